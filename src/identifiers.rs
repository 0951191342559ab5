//! Hierarchical document identifiers: `PREFIX-PRODUCT-BASE-SEQ[-VER]`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;

use crate::db::Repository;
use crate::error::EngineError;
use crate::models::{PolicyRecord, Product};

pub const MAX_BASE_NUMBER: i32 = 999_999;
pub const MAX_SEQUENCE: i32 = 99;

/// Product lines seeded by `init-sequences`.
pub const DEFAULT_PRODUCTS: &[(&str, &str)] = &[
    ("COM", "Commercial Package"),
    ("GEN", "General Liability"),
    ("PRO", "Professional Liability"),
    ("AUT", "Commercial Auto"),
    ("UMB", "Umbrella"),
    ("WCP", "Workers Compensation"),
];

lazy_static! {
    static ref IDENTIFIER_RE: Regex =
        Regex::new(r"^(APP|QTE|POL|END)-([A-Z0-9]{2,10})-(\d{6})-(\d{2})(?:-(\d{2}))?$")
            .expect("identifier pattern is valid");
    static ref PRODUCT_CODE_RE: Regex =
        Regex::new(r"^[A-Z0-9]{2,10}$").expect("product code pattern is valid");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierKind {
    Application,
    Quote,
    Policy,
    Endorsement,
}

impl IdentifierKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Application => "APP",
            Self::Quote => "QTE",
            Self::Policy => "POL",
            Self::Endorsement => "END",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "APP" => Some(Self::Application),
            "QTE" => Some(Self::Quote),
            "POL" => Some(Self::Policy),
            "END" => Some(Self::Endorsement),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    pub kind: IdentifierKind,
    pub product_code: String,
    pub base_number: i32,
    pub sequence: i32,
    pub version: Option<i32>,
}

impl Identifier {
    pub fn new(
        kind: IdentifierKind,
        product_code: &str,
        base_number: i32,
        sequence: i32,
        version: Option<i32>,
    ) -> Result<Self, EngineError> {
        let product_code = product_code.trim().to_ascii_uppercase();
        if !PRODUCT_CODE_RE.is_match(&product_code) {
            return Err(EngineError::validation(format!(
                "invalid product code {product_code:?}"
            )));
        }
        if !(1..=MAX_BASE_NUMBER).contains(&base_number) {
            return Err(EngineError::validation(format!(
                "base number {base_number} is outside 000001..999999"
            )));
        }
        if !(0..=MAX_SEQUENCE).contains(&sequence) {
            return Err(EngineError::validation(format!(
                "sequence {sequence} is outside 00..99"
            )));
        }
        if let Some(version) = version {
            if !(1..=MAX_SEQUENCE).contains(&version) {
                return Err(EngineError::validation(format!(
                    "version {version} is outside 01..99"
                )));
            }
        }
        Ok(Self {
            kind,
            product_code,
            base_number,
            sequence,
            version,
        })
    }

    /// Zero-padded six digit base.
    pub fn base(&self) -> String {
        format_base(self.base_number)
    }

    fn with_kind(&self, kind: IdentifierKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{:06}-{:02}",
            self.kind.prefix(),
            self.product_code,
            self.base_number,
            self.sequence
        )?;
        if let Some(version) = self.version {
            write!(f, "-{version:02}")?;
        }
        Ok(())
    }
}

impl FromStr for Identifier {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || EngineError::validation(format!("invalid identifier {value:?}"));
        let caps = IDENTIFIER_RE.captures(value.trim()).ok_or_else(invalid)?;

        let kind = IdentifierKind::from_prefix(&caps[1]).ok_or_else(invalid)?;
        let base_number: i32 = caps[3].parse().map_err(|_| invalid())?;
        let sequence: i32 = caps[4].parse().map_err(|_| invalid())?;
        let version = match caps.get(5) {
            Some(m) => Some(m.as_str().parse::<i32>().map_err(|_| invalid())?),
            None => None,
        };
        Identifier::new(kind, &caps[2], base_number, sequence, version)
    }
}

pub fn format_base(base_number: i32) -> String {
    format!("{base_number:06}")
}

pub fn format_application(product_code: &str, base_number: i32) -> Result<String, EngineError> {
    Identifier::new(IdentifierKind::Application, product_code, base_number, 0, None)
        .map(|id| id.to_string())
}

pub fn format_quote(
    product_code: &str,
    base_number: i32,
    sequence: i32,
    version: Option<i32>,
) -> Result<String, EngineError> {
    Identifier::new(IdentifierKind::Quote, product_code, base_number, sequence, version)
        .map(|id| id.to_string())
}

pub fn format_policy(
    product_code: &str,
    base_number: i32,
    sequence: i32,
) -> Result<String, EngineError> {
    Identifier::new(IdentifierKind::Policy, product_code, base_number, sequence, None)
        .map(|id| id.to_string())
}

/// Renewal keeps the parent's base and bumps the sequence.
pub fn format_renewal_policy(parent: &Identifier) -> Result<String, EngineError> {
    if parent.sequence >= MAX_SEQUENCE {
        return Err(EngineError::SequenceExhausted(format!(
            "{} renewals of {}-{}",
            parent.product_code,
            parent.product_code,
            parent.base()
        )));
    }
    format_policy(&parent.product_code, parent.base_number, parent.sequence + 1)
}

pub fn format_endorsement(
    product_code: &str,
    base_number: i32,
    endorsement_sequence: i32,
) -> Result<String, EngineError> {
    if endorsement_sequence < 1 {
        return Err(EngineError::validation("endorsement sequences start at 1"));
    }
    if endorsement_sequence > MAX_SEQUENCE {
        return Err(EngineError::SequenceExhausted(format!(
            "{product_code} endorsements of base {}",
            format_base(base_number)
        )));
    }
    Identifier::new(
        IdentifierKind::Endorsement,
        product_code,
        base_number,
        endorsement_sequence,
        None,
    )
    .map(|id| id.to_string())
}

/// Highest package version the two-digit `-DOC-NN` suffix can carry.
pub const MAX_PACKAGE_VERSION: i32 = 99;

/// `<POLICY>-DOC` for version 0, `<POLICY>-DOC-NN` for 1 through 99.
pub fn format_package(policy_number: &str, version: i32) -> Result<String, EngineError> {
    match version {
        v if v <= 0 => Ok(format!("{policy_number}-DOC")),
        v if v <= MAX_PACKAGE_VERSION => Ok(format!("{policy_number}-DOC-{v:02}")),
        _ => Err(EngineError::validation(format!(
            "policy {policy_number} already has {} package versions",
            MAX_PACKAGE_VERSION + 1
        ))),
    }
}

/// Reserves base numbers and derives identifiers from one another.
#[derive(Clone)]
pub struct IdentifierAllocator {
    repo: Arc<dyn Repository>,
}

impl IdentifierAllocator {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Reserve the next base number for the product, zero-padded.
    pub async fn reserve(&self, product_code: &str) -> Result<String, EngineError> {
        let base = self.repo.reserve_base(product_code, Utc::now()).await?;
        log::debug!("reserved base {} for {}", format_base(base), product_code);
        Ok(format_base(base))
    }

    pub async fn confirm(&self, product_code: &str, base_number: &str) -> Result<(), EngineError> {
        let base: i32 = base_number
            .parse()
            .map_err(|_| EngineError::validation(format!("invalid base number {base_number:?}")))?;
        self.repo.confirm_base(product_code, base).await
    }

    async fn fresh_base(&self, product_code: &str) -> Result<i32, EngineError> {
        let base = self.repo.reserve_base(product_code, Utc::now()).await?;
        self.repo.confirm_base(product_code, base).await?;
        Ok(base)
    }

    pub async fn allocate_application(&self, product_code: &str) -> Result<Identifier, EngineError> {
        let base = self.fresh_base(product_code).await?;
        Identifier::new(IdentifierKind::Application, product_code, base, 0, None)
    }

    /// A quote inherits base and sequence from its application when there is one.
    pub async fn allocate_quote(
        &self,
        product_code: &str,
        application: Option<&Identifier>,
    ) -> Result<Identifier, EngineError> {
        match application {
            Some(app) => Ok(app.with_kind(IdentifierKind::Quote)),
            None => {
                let base = self.fresh_base(product_code).await?;
                Identifier::new(IdentifierKind::Quote, product_code, base, 0, None)
            }
        }
    }

    pub async fn revise_quote(&self, quote: &Identifier) -> Result<Identifier, EngineError> {
        let current = self
            .repo
            .max_quote_version(&quote.product_code, &quote.base())
            .await?;
        let next = current.map_or(1, |v| v + 1);
        if next > MAX_SEQUENCE {
            return Err(EngineError::SequenceExhausted(format!(
                "{} quote revisions of {}",
                quote.product_code,
                quote.base()
            )));
        }
        Identifier::new(
            IdentifierKind::Quote,
            &quote.product_code,
            quote.base_number,
            quote.sequence,
            Some(next),
        )
    }

    pub fn policy_from_quote(&self, quote: &Identifier) -> Identifier {
        Identifier {
            kind: IdentifierKind::Policy,
            version: None,
            ..quote.clone()
        }
    }

    pub fn renewal_of(&self, policy: &Identifier) -> Result<Identifier, EngineError> {
        format_renewal_policy(policy)?.parse()
    }

    /// Next endorsement sequence and number for the policy.
    pub async fn next_endorsement(
        &self,
        policy: &PolicyRecord,
    ) -> Result<(i32, String), EngineError> {
        let base: i32 = policy.base_number.parse().map_err(|_| {
            EngineError::validation(format!(
                "policy {} has invalid base number {:?}",
                policy.number, policy.base_number
            ))
        })?;
        let sequence = self.repo.max_endorsement_sequence(policy.id).await? + 1;
        let number = format_endorsement(&policy.product_code, base, sequence)?;
        Ok((sequence, number))
    }

    /// Reset trackers whose reservations are older than `grace`.
    pub async fn sweep(&self, grace: Duration) -> Result<Vec<String>, EngineError> {
        let grace = chrono::Duration::from_std(grace)
            .map_err(|_| EngineError::validation("grace window is too large"))?;
        let reset = self.repo.sweep_reservations(Utc::now() - grace).await?;
        for code in &reset {
            log::info!("reset abandoned reservations for product {}", code);
        }
        Ok(reset)
    }

    /// Seed the default product lines and bring every tracker up to date.
    pub async fn init_sequences(&self) -> Result<Vec<Product>, EngineError> {
        for (code, name) in DEFAULT_PRODUCTS {
            if self.repo.get_product(code).await?.is_none() {
                self.repo
                    .upsert_product(&Product {
                        code: code.to_string(),
                        name: name.to_string(),
                        active: true,
                    })
                    .await?;
                log::info!("created product {}", code);
            }
        }

        let products = self.repo.list_products().await?;
        for product in &products {
            let tracker = self.repo.init_tracker(&product.code).await?;
            log::info!(
                "tracker {} at last_used={} last_reserved={}",
                tracker.product_code,
                tracker.last_used,
                tracker.last_reserved
            );
        }
        Ok(products)
    }
}
