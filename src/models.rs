use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::EngineError;

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = EngineError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(EngineError::validation(format!(
                        "unknown {} {:?}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum!(
    /// What a template produces inside a package.
    TemplateType {
        Declaration => "declaration",
        PolicyForm => "policy_form",
        Endorsement => "endorsement",
        StateForm => "state_form",
        Schedule => "schedule",
        Notice => "notice",
        Certificate => "certificate",
    }
);

string_enum!(
    /// How a template is turned into bytes.
    TemplateFormat {
        Dynamic => "dynamic",
        Static => "static",
        Hybrid => "hybrid",
    }
);

string_enum!(
    PackageStatus {
        Draft => "draft",
        Generated => "generated",
        Issued => "issued",
        Reissued => "reissued",
        Superseded => "superseded",
    }
);

string_enum!(
    ComponentStatus {
        Pending => "pending",
        Generated => "generated",
        Error => "error",
    }
);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub code: String,
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceTracker {
    pub product_code: String,
    pub last_used: i32,
    pub last_reserved: i32,
    pub last_reserved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Template {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub template_type: TemplateType,
    pub format: TemplateFormat,
    pub product_code: Option<String>,
    /// Two-letter state codes; empty means every state.
    pub applicable_states: Vec<String>,
    pub state_mandatory: bool,
    pub storage_key: Option<String>,
    pub inline_layout: Option<serde_json::Value>,
    /// PDF form field name -> dotted path into the merge bundle.
    pub merge_fields: BTreeMap<String, String>,
    pub version: String,
    pub effective_date: NaiveDate,
    pub expiration_date: Option<NaiveDate>,
    pub default_sequence: i32,
    pub active: bool,
}

impl Template {
    /// Half-open `[effective_date, expiration_date)` check.
    pub fn is_effective_on(&self, date: NaiveDate) -> bool {
        self.effective_date <= date && self.expiration_date.map_or(true, |end| end > date)
    }

    pub fn is_applicable_to_state(&self, state_code: &str) -> bool {
        if self.applicable_states.is_empty() {
            if self.state_mandatory {
                log::warn!(
                    "template {} is state-mandatory but lists no states; treating as not applicable",
                    self.code
                );
                return false;
            }
            return true;
        }
        self.applicable_states
            .iter()
            .any(|state| state.trim().eq_ignore_ascii_case(state_code.trim()))
    }

    pub fn is_for_product(&self, product_code: &str) -> bool {
        self.product_code
            .as_deref()
            .map_or(true, |code| code.eq_ignore_ascii_case(product_code))
    }
}

/// Template definition as it appears in a manifest, before it has an id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTemplate {
    pub code: String,
    pub name: String,
    pub template_type: TemplateType,
    pub format: TemplateFormat,
    #[serde(default)]
    pub product_code: Option<String>,
    #[serde(default)]
    pub applicable_states: Vec<String>,
    #[serde(default)]
    pub state_mandatory: bool,
    #[serde(default)]
    pub storage_key: Option<String>,
    #[serde(default)]
    pub inline_layout: Option<serde_json::Value>,
    #[serde(default)]
    pub merge_fields: BTreeMap<String, String>,
    #[serde(default = "default_template_version")]
    pub version: String,
    pub effective_date: NaiveDate,
    #[serde(default)]
    pub expiration_date: Option<NaiveDate>,
    #[serde(default = "default_sequence")]
    pub default_sequence: i32,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_template_version() -> String {
    "1.0".to_string()
}

fn default_sequence() -> i32 {
    100
}

fn default_active() -> bool {
    true
}

impl NewTemplate {
    pub fn into_template(self, id: i64) -> Template {
        Template {
            id,
            code: self.code,
            name: self.name,
            template_type: self.template_type,
            format: self.format,
            product_code: self.product_code,
            applicable_states: self
                .applicable_states
                .into_iter()
                .map(|state| state.trim().to_ascii_uppercase())
                .collect(),
            state_mandatory: self.state_mandatory,
            storage_key: self.storage_key,
            inline_layout: self.inline_layout,
            merge_fields: self.merge_fields,
            version: self.version,
            effective_date: self.effective_date,
            expiration_date: self.expiration_date,
            default_sequence: self.default_sequence,
            active: self.active,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Insured {
    pub company_name: String,
    pub dba_name: Option<String>,
    pub address_line1: String,
    pub address_line2: Option<String>,
    pub city: String,
    pub state: String,
    pub zip_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuoteRecord {
    pub number: String,
    pub effective_date: NaiveDate,
    pub expiration_date: NaiveDate,
    pub total_premium: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationRecord {
    pub number: Option<String>,
    pub company_name: String,
    pub product_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Coverage {
    pub name: String,
    pub limit: Decimal,
    pub deductible: Option<Decimal>,
    pub premium: Decimal,
}

/// Read-only layered snapshot of a bound policy, owned by the policy system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyRecord {
    pub id: i64,
    pub number: String,
    pub product_code: String,
    pub base_number: String,
    pub sequence_number: i32,
    pub version_number: Option<i32>,
    pub effective_date: NaiveDate,
    pub expiration_date: NaiveDate,
    pub state_code: String,
    pub status: String,
    pub annual_premium: Decimal,
    pub insured: Insured,
    pub quote: QuoteRecord,
    pub application: ApplicationRecord,
    #[serde(default)]
    pub coverages: Vec<Coverage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentPackage {
    pub id: i64,
    pub policy_id: i64,
    pub number: String,
    pub version: i32,
    pub status: PackageStatus,
    pub is_current: bool,
    pub generated_date: DateTime<Utc>,
    pub issued_date: Option<DateTime<Utc>>,
    pub combined_artifact_key: Option<String>,
    pub total_pages: i32,
    pub byte_size: i64,
    pub state_code: String,
    pub merge_snapshot: serde_json::Value,
}

impl DocumentPackage {
    /// Historic or issued packages: their components and artifacts are final.
    pub fn is_frozen(&self) -> bool {
        !self.is_current || self.issued_date.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentComponent {
    pub id: i64,
    pub package_id: i64,
    pub template_id: Option<i64>,
    pub sequence_order: i32,
    pub component_type: TemplateType,
    pub name: String,
    pub status: ComponentStatus,
    pub artifact_key: Option<String>,
    pub page_count: i32,
    pub byte_size: i64,
    pub merge_inputs: serde_json::Value,
    pub error_message: Option<String>,
    pub generated_at: Option<DateTime<Utc>>,
}

/// Component row before persistence assigns id and sequence order.
#[derive(Debug, Clone, PartialEq)]
pub struct NewComponent {
    pub template_id: Option<i64>,
    pub component_type: TemplateType,
    pub name: String,
    pub merge_inputs: serde_json::Value,
}

impl NewComponent {
    pub fn from_template(template: &Template) -> Self {
        Self {
            template_id: Some(template.id),
            component_type: template.template_type,
            name: template.name.clone(),
            merge_inputs: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPackage {
    pub policy_id: i64,
    pub policy_number: String,
    pub state_code: String,
    pub merge_snapshot: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Endorsement {
    pub id: i64,
    pub policy_id: i64,
    pub template_id: i64,
    pub number: String,
    pub sequence: i32,
    pub title: String,
    pub effective_date: NaiveDate,
    pub artifact_key: String,
    pub merge_inputs: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEndorsement {
    pub policy_id: i64,
    pub template_id: i64,
    pub number: String,
    pub sequence: i32,
    pub title: String,
    pub effective_date: NaiveDate,
    pub artifact_key: String,
    pub merge_inputs: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(states: &[&str], mandatory: bool) -> Template {
        NewTemplate {
            code: "CA-NOTICE-001".to_string(),
            name: "California Notice".to_string(),
            template_type: TemplateType::StateForm,
            format: TemplateFormat::Static,
            product_code: Some("WCP".to_string()),
            applicable_states: states.iter().map(|s| s.to_string()).collect(),
            state_mandatory: mandatory,
            storage_key: None,
            inline_layout: None,
            merge_fields: BTreeMap::new(),
            version: "1.0".to_string(),
            effective_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            expiration_date: NaiveDate::from_ymd_opt(2025, 1, 1),
            default_sequence: 300,
            active: true,
        }
        .into_template(1)
    }

    #[test]
    fn enum_round_trips_through_text() {
        for status in PackageStatus::ALL {
            assert_eq!(status.as_str().parse::<PackageStatus>().unwrap(), *status);
        }
        assert_eq!("Policy_Form".parse::<TemplateType>().unwrap(), TemplateType::PolicyForm);
        assert!("pdf".parse::<TemplateFormat>().is_err());
    }

    #[test]
    fn expiration_is_exclusive() {
        let t = template(&[], false);
        assert!(t.is_effective_on(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()));
        assert!(t.is_effective_on(NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()));
        assert!(!t.is_effective_on(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()));
        assert!(!t.is_effective_on(NaiveDate::from_ymd_opt(2023, 12, 31).unwrap()));
    }

    #[test]
    fn state_rules() {
        assert!(template(&[], false).is_applicable_to_state("NY"));
        assert!(!template(&[], true).is_applicable_to_state("NY"));
        assert!(template(&["ca"], true).is_applicable_to_state("CA"));
        assert!(template(&["CA", "NV"], true).is_applicable_to_state("nv"));
        assert!(!template(&["CA"], true).is_applicable_to_state("NY"));
    }
}
