//! Postgres repository.
//!
//! Row locks (`SELECT ... FOR UPDATE`) serialize tracker increments and the
//! `is_current` flip. Queries are built at runtime so the crate compiles
//! without a live database.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};

use super::{CreatedPackage, Repository};
use crate::error::EngineError;
use crate::identifiers::{format_package, MAX_BASE_NUMBER};
use crate::models::{
    ApplicationRecord, ComponentStatus, Coverage, DocumentComponent, DocumentPackage,
    Endorsement, Insured, NewComponent, NewEndorsement, NewPackage, NewTemplate, PackageStatus,
    PolicyRecord, Product, QuoteRecord, SequenceTracker, Template,
};

const TEMPLATE_COLUMNS: &str = "id, code, name, template_type, format, product_code, \
     applicable_states, state_mandatory, storage_key, inline_layout, merge_fields, version, \
     effective_date, expiration_date, default_sequence, active";

const PACKAGE_COLUMNS: &str = "id, policy_id, package_number, version, status, is_current, \
     generated_date, issued_date, combined_artifact_key, total_pages, byte_size, state_code, \
     merge_snapshot";

const COMPONENT_COLUMNS: &str = "id, package_id, template_id, sequence_order, component_type, \
     name, status, artifact_key, page_count, byte_size, merge_inputs, error_message, generated_at";

const ENDORSEMENT_COLUMNS: &str = "id, policy_id, template_id, endorsement_number, sequence, \
     title, effective_date, artifact_key, merge_inputs, created_at";

#[derive(FromRow)]
struct ProductRow {
    code: String,
    name: String,
    active: bool,
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Product {
            code: row.code,
            name: row.name,
            active: row.active,
        }
    }
}

#[derive(FromRow)]
struct TrackerRow {
    product_code: String,
    last_used: i32,
    last_reserved: i32,
    last_reserved_at: Option<DateTime<Utc>>,
}

impl From<TrackerRow> for SequenceTracker {
    fn from(row: TrackerRow) -> Self {
        SequenceTracker {
            product_code: row.product_code,
            last_used: row.last_used,
            last_reserved: row.last_reserved,
            last_reserved_at: row.last_reserved_at,
        }
    }
}

#[derive(FromRow)]
struct TemplateRow {
    id: i64,
    code: String,
    name: String,
    template_type: String,
    format: String,
    product_code: Option<String>,
    applicable_states: Vec<String>,
    state_mandatory: bool,
    storage_key: Option<String>,
    inline_layout: Option<serde_json::Value>,
    merge_fields: serde_json::Value,
    version: String,
    effective_date: NaiveDate,
    expiration_date: Option<NaiveDate>,
    default_sequence: i32,
    active: bool,
}

impl TryFrom<TemplateRow> for Template {
    type Error = EngineError;

    fn try_from(row: TemplateRow) -> Result<Self, Self::Error> {
        let merge_fields: BTreeMap<String, String> = serde_json::from_value(row.merge_fields)
            .map_err(|e| {
                EngineError::validation(format!("template {} has bad merge_fields: {e}", row.code))
            })?;
        Ok(Template {
            id: row.id,
            template_type: row.template_type.parse()?,
            format: row.format.parse()?,
            code: row.code,
            name: row.name,
            product_code: row.product_code,
            applicable_states: row.applicable_states,
            state_mandatory: row.state_mandatory,
            storage_key: row.storage_key,
            inline_layout: row.inline_layout,
            merge_fields,
            version: row.version,
            effective_date: row.effective_date,
            expiration_date: row.expiration_date,
            default_sequence: row.default_sequence,
            active: row.active,
        })
    }
}

#[derive(FromRow)]
struct PolicyRow {
    id: i64,
    policy_number: String,
    product_code: String,
    base_number: String,
    sequence_number: i32,
    version_number: Option<i32>,
    effective_date: NaiveDate,
    expiration_date: NaiveDate,
    state_code: String,
    status: String,
    annual_premium: Decimal,
    quote_number: String,
    quote_effective_date: NaiveDate,
    quote_expiration_date: NaiveDate,
    total_premium: Decimal,
    application_number: Option<String>,
    company_name: Option<String>,
    dba_name: Option<String>,
    address_line1: Option<String>,
    address_line2: Option<String>,
    city: Option<String>,
    state: Option<String>,
    zip_code: Option<String>,
    product_name: String,
}

#[derive(FromRow)]
struct CoverageRow {
    name: String,
    coverage_limit: Decimal,
    deductible: Option<Decimal>,
    premium: Decimal,
}

#[derive(FromRow)]
struct PackageRow {
    id: i64,
    policy_id: i64,
    package_number: String,
    version: i32,
    status: String,
    is_current: bool,
    generated_date: DateTime<Utc>,
    issued_date: Option<DateTime<Utc>>,
    combined_artifact_key: Option<String>,
    total_pages: i32,
    byte_size: i64,
    state_code: String,
    merge_snapshot: serde_json::Value,
}

impl TryFrom<PackageRow> for DocumentPackage {
    type Error = EngineError;

    fn try_from(row: PackageRow) -> Result<Self, Self::Error> {
        Ok(DocumentPackage {
            id: row.id,
            policy_id: row.policy_id,
            number: row.package_number,
            version: row.version,
            status: row.status.parse()?,
            is_current: row.is_current,
            generated_date: row.generated_date,
            issued_date: row.issued_date,
            combined_artifact_key: row.combined_artifact_key,
            total_pages: row.total_pages,
            byte_size: row.byte_size,
            state_code: row.state_code,
            merge_snapshot: row.merge_snapshot,
        })
    }
}

#[derive(FromRow)]
struct ComponentRow {
    id: i64,
    package_id: i64,
    template_id: Option<i64>,
    sequence_order: i32,
    component_type: String,
    name: String,
    status: String,
    artifact_key: Option<String>,
    page_count: i32,
    byte_size: i64,
    merge_inputs: serde_json::Value,
    error_message: Option<String>,
    generated_at: Option<DateTime<Utc>>,
}

impl TryFrom<ComponentRow> for DocumentComponent {
    type Error = EngineError;

    fn try_from(row: ComponentRow) -> Result<Self, Self::Error> {
        Ok(DocumentComponent {
            id: row.id,
            package_id: row.package_id,
            template_id: row.template_id,
            sequence_order: row.sequence_order,
            component_type: row.component_type.parse()?,
            name: row.name,
            status: row.status.parse()?,
            artifact_key: row.artifact_key,
            page_count: row.page_count,
            byte_size: row.byte_size,
            merge_inputs: row.merge_inputs,
            error_message: row.error_message,
            generated_at: row.generated_at,
        })
    }
}

#[derive(FromRow)]
struct EndorsementRow {
    id: i64,
    policy_id: i64,
    template_id: i64,
    endorsement_number: String,
    sequence: i32,
    title: String,
    effective_date: NaiveDate,
    artifact_key: String,
    merge_inputs: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<EndorsementRow> for Endorsement {
    fn from(row: EndorsementRow) -> Self {
        Endorsement {
            id: row.id,
            policy_id: row.policy_id,
            template_id: row.template_id,
            number: row.endorsement_number,
            sequence: row.sequence,
            title: row.title,
            effective_date: row.effective_date,
            artifact_key: row.artifact_key,
            merge_inputs: row.merge_inputs,
            created_at: row.created_at,
        }
    }
}

fn collect<R, T>(rows: Vec<R>) -> Result<Vec<T>, EngineError>
where
    T: TryFrom<R, Error = EngineError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, EngineError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(900))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), EngineError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EngineError::Database(e.into()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn highest_reference(
        tx: &mut Transaction<'_, Postgres>,
        product_code: &str,
        above: i32,
        up_to: i32,
    ) -> Result<Option<i32>, EngineError> {
        let highest: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT MAX(base::INTEGER) FROM (
                SELECT base_number AS base FROM applications
                    WHERE product_code = $1 AND base_number ~ '^[0-9]{6}$'
                UNION ALL
                SELECT base_number FROM quotes
                    WHERE product_code = $1 AND base_number ~ '^[0-9]{6}$'
                UNION ALL
                SELECT base_number FROM policies
                    WHERE product_code = $1 AND base_number ~ '^[0-9]{6}$'
            ) refs
            WHERE base::INTEGER > $2 AND base::INTEGER <= $3
            "#,
        )
        .bind(product_code)
        .bind(above)
        .bind(up_to)
        .fetch_one(&mut **tx)
        .await?;
        Ok(highest)
    }

    async fn lock_tracker(
        tx: &mut Transaction<'_, Postgres>,
        product_code: &str,
    ) -> Result<Option<TrackerRow>, EngineError> {
        let row = sqlx::query_as::<_, TrackerRow>(
            "SELECT product_code, last_used, last_reserved, last_reserved_at \
             FROM sequence_trackers WHERE product_code = $1 FOR UPDATE",
        )
        .bind(product_code)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row)
    }

    async fn ensure_tracker(
        tx: &mut Transaction<'_, Postgres>,
        product_code: &str,
    ) -> Result<TrackerRow, EngineError> {
        let known: Option<String> =
            sqlx::query_scalar("SELECT code FROM products WHERE code = $1")
                .bind(product_code)
                .fetch_optional(&mut **tx)
                .await?;
        if known.is_none() {
            return Err(EngineError::ProductUnknown(product_code.to_string()));
        }

        sqlx::query(
            "INSERT INTO sequence_trackers (product_code) VALUES ($1) \
             ON CONFLICT (product_code) DO NOTHING",
        )
        .bind(product_code)
        .execute(&mut **tx)
        .await?;

        Self::lock_tracker(tx, product_code)
            .await?
            .ok_or_else(|| EngineError::ProductUnknown(product_code.to_string()))
    }

    async fn fetch_package(
        tx: &mut Transaction<'_, Postgres>,
        package_id: i64,
    ) -> Result<DocumentPackage, EngineError> {
        let row = sqlx::query_as::<_, PackageRow>(&format!(
            "SELECT {PACKAGE_COLUMNS} FROM document_packages WHERE id = $1"
        ))
        .bind(package_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| EngineError::not_found(format!("package {package_id}")))?;
        row.try_into()
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn upsert_product(&self, product: &Product) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO products (code, name, active) VALUES ($1, $2, $3) \
             ON CONFLICT (code) DO UPDATE SET name = EXCLUDED.name, active = EXCLUDED.active",
        )
        .bind(&product.code)
        .bind(&product.name)
        .bind(product.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_product(&self, code: &str) -> Result<Option<Product>, EngineError> {
        let row = sqlx::query_as::<_, ProductRow>(
            "SELECT code, name, active FROM products WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Product::from))
    }

    async fn list_products(&self) -> Result<Vec<Product>, EngineError> {
        let rows =
            sqlx::query_as::<_, ProductRow>("SELECT code, name, active FROM products ORDER BY code")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Product::from).collect())
    }

    async fn get_tracker(&self, product_code: &str) -> Result<Option<SequenceTracker>, EngineError> {
        let row = sqlx::query_as::<_, TrackerRow>(
            "SELECT product_code, last_used, last_reserved, last_reserved_at \
             FROM sequence_trackers WHERE product_code = $1",
        )
        .bind(product_code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SequenceTracker::from))
    }

    async fn init_tracker(&self, product_code: &str) -> Result<SequenceTracker, EngineError> {
        let mut tx = self.pool.begin().await?;
        let tracker = Self::ensure_tracker(&mut tx, product_code).await?;
        let highest = Self::highest_reference(&mut tx, product_code, 0, MAX_BASE_NUMBER)
            .await?
            .unwrap_or(0);

        let last_used = tracker.last_used.max(highest);
        let last_reserved = tracker.last_reserved.max(last_used);
        let row = sqlx::query_as::<_, TrackerRow>(
            "UPDATE sequence_trackers SET last_used = $2, last_reserved = $3 \
             WHERE product_code = $1 \
             RETURNING product_code, last_used, last_reserved, last_reserved_at",
        )
        .bind(product_code)
        .bind(last_used)
        .bind(last_reserved)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row.into())
    }

    async fn reserve_base(
        &self,
        product_code: &str,
        now: DateTime<Utc>,
    ) -> Result<i32, EngineError> {
        let mut tx = self.pool.begin().await?;
        let tracker = Self::ensure_tracker(&mut tx, product_code).await?;

        let next = tracker.last_reserved + 1;
        if next > MAX_BASE_NUMBER {
            tx.rollback().await?;
            return Err(EngineError::SequenceExhausted(product_code.to_string()));
        }

        sqlx::query(
            "UPDATE sequence_trackers SET last_reserved = $2, last_reserved_at = $3 \
             WHERE product_code = $1",
        )
        .bind(product_code)
        .bind(next)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(next)
    }

    async fn confirm_base(&self, product_code: &str, base_number: i32) -> Result<(), EngineError> {
        let result = sqlx::query(
            "UPDATE sequence_trackers \
             SET last_used = GREATEST(last_used, $2), \
                 last_reserved = GREATEST(last_reserved, last_used, $2) \
             WHERE product_code = $1",
        )
        .bind(product_code)
        .bind(base_number)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::ProductUnknown(product_code.to_string()));
        }
        Ok(())
    }

    async fn sweep_reservations(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, EngineError> {
        let mut tx = self.pool.begin().await?;
        let stale = sqlx::query_as::<_, TrackerRow>(
            "SELECT product_code, last_used, last_reserved, last_reserved_at \
             FROM sequence_trackers \
             WHERE last_reserved > last_used \
               AND (last_reserved_at IS NULL OR last_reserved_at <= $1) \
             ORDER BY product_code FOR UPDATE",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut reset = Vec::with_capacity(stale.len());
        for tracker in stale {
            let floor = Self::highest_reference(
                &mut tx,
                &tracker.product_code,
                tracker.last_used,
                tracker.last_reserved,
            )
            .await?
            .map_or(tracker.last_used, |referenced| referenced.max(tracker.last_used));

            sqlx::query(
                "UPDATE sequence_trackers SET last_used = $2, last_reserved = $2 \
                 WHERE product_code = $1",
            )
            .bind(&tracker.product_code)
            .bind(floor)
            .execute(&mut *tx)
            .await?;
            reset.push(tracker.product_code);
        }
        tx.commit().await?;
        Ok(reset)
    }

    async fn max_quote_version(
        &self,
        product_code: &str,
        base_number: &str,
    ) -> Result<Option<i32>, EngineError> {
        let version: Option<i32> = sqlx::query_scalar(
            "SELECT MAX(version_number) FROM quotes WHERE product_code = $1 AND base_number = $2",
        )
        .bind(product_code)
        .bind(base_number)
        .fetch_one(&self.pool)
        .await?;
        Ok(version)
    }

    async fn insert_template_if_absent(
        &self,
        template: NewTemplate,
    ) -> Result<(Template, bool), EngineError> {
        let template = template.into_template(0);
        let merge_fields = serde_json::to_value(&template.merge_fields)
            .map_err(|e| EngineError::validation(e.to_string()))?;

        let inserted = sqlx::query_as::<_, TemplateRow>(&format!(
            "INSERT INTO document_templates (code, name, template_type, format, product_code, \
                 applicable_states, state_mandatory, storage_key, inline_layout, merge_fields, \
                 version, effective_date, expiration_date, default_sequence, active) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             ON CONFLICT (code) DO NOTHING \
             RETURNING {TEMPLATE_COLUMNS}"
        ))
        .bind(&template.code)
        .bind(&template.name)
        .bind(template.template_type.as_str())
        .bind(template.format.as_str())
        .bind(&template.product_code)
        .bind(&template.applicable_states)
        .bind(template.state_mandatory)
        .bind(&template.storage_key)
        .bind(&template.inline_layout)
        .bind(merge_fields)
        .bind(&template.version)
        .bind(template.effective_date)
        .bind(template.expiration_date)
        .bind(template.default_sequence)
        .bind(template.active)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(row) => Ok((row.try_into()?, true)),
            None => {
                let existing = self
                    .get_template_by_code(&template.code)
                    .await?
                    .ok_or_else(|| EngineError::not_found(format!("template {}", template.code)))?;
                Ok((existing, false))
            }
        }
    }

    async fn get_template(&self, id: i64) -> Result<Option<Template>, EngineError> {
        let row = sqlx::query_as::<_, TemplateRow>(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM document_templates WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Template::try_from).transpose()
    }

    async fn get_template_by_code(&self, code: &str) -> Result<Option<Template>, EngineError> {
        let row = sqlx::query_as::<_, TemplateRow>(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM document_templates WHERE code = $1"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Template::try_from).transpose()
    }

    async fn list_active_templates(
        &self,
        product_code: &str,
    ) -> Result<Vec<Template>, EngineError> {
        let rows = sqlx::query_as::<_, TemplateRow>(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM document_templates \
             WHERE active AND (product_code IS NULL OR product_code = $1) \
             ORDER BY default_sequence, code"
        ))
        .bind(product_code)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn list_templates(&self) -> Result<Vec<Template>, EngineError> {
        let rows = sqlx::query_as::<_, TemplateRow>(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM document_templates ORDER BY default_sequence, code"
        ))
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn get_policy(&self, policy_id: i64) -> Result<Option<PolicyRecord>, EngineError> {
        let row = sqlx::query_as::<_, PolicyRow>(
            r#"
            SELECT p.id, p.policy_number, p.product_code, p.base_number, p.sequence_number,
                   p.version_number, p.effective_date, p.expiration_date, p.state_code, p.status,
                   p.annual_premium,
                   q.quote_number, q.effective_date AS quote_effective_date,
                   q.expiration_date AS quote_expiration_date, q.total_premium,
                   a.application_number, a.company_name, a.dba_name, a.address_line1,
                   a.address_line2, a.city, a.state, a.zip_code,
                   pr.name AS product_name
            FROM policies p
            JOIN quotes q ON q.id = p.quote_id
            LEFT JOIN applications a ON a.id = q.application_id
            JOIN products pr ON pr.code = p.product_code
            WHERE p.id = $1
            "#,
        )
        .bind(policy_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let coverages = sqlx::query_as::<_, CoverageRow>(
            "SELECT name, coverage_limit, deductible, premium FROM policy_coverages \
             WHERE policy_id = $1 ORDER BY sort_order, id",
        )
        .bind(policy_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|c| Coverage {
            name: c.name,
            limit: c.coverage_limit,
            deductible: c.deductible,
            premium: c.premium,
        })
        .collect();

        let company_name = row.company_name.unwrap_or_default();
        Ok(Some(PolicyRecord {
            id: row.id,
            number: row.policy_number,
            product_code: row.product_code,
            base_number: row.base_number,
            sequence_number: row.sequence_number,
            version_number: row.version_number,
            effective_date: row.effective_date,
            expiration_date: row.expiration_date,
            state_code: row.state_code,
            status: row.status,
            annual_premium: row.annual_premium,
            insured: Insured {
                company_name: company_name.clone(),
                dba_name: row.dba_name,
                address_line1: row.address_line1.unwrap_or_default(),
                address_line2: row.address_line2,
                city: row.city.unwrap_or_default(),
                state: row.state.unwrap_or_default(),
                zip_code: row.zip_code.unwrap_or_default(),
            },
            quote: QuoteRecord {
                number: row.quote_number,
                effective_date: row.quote_effective_date,
                expiration_date: row.quote_expiration_date,
                total_premium: row.total_premium,
            },
            application: ApplicationRecord {
                number: row.application_number,
                company_name,
                product_name: row.product_name,
            },
            coverages,
        }))
    }

    async fn create_package(
        &self,
        package: NewPackage,
        components: Vec<NewComponent>,
        replace_current: bool,
    ) -> Result<CreatedPackage, EngineError> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<i64> =
            sqlx::query_scalar("SELECT id FROM policies WHERE id = $1 FOR UPDATE")
                .bind(package.policy_id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Err(EngineError::not_found(format!("policy {}", package.policy_id)));
        }

        if !replace_current {
            let current = sqlx::query_as::<_, PackageRow>(&format!(
                "SELECT {PACKAGE_COLUMNS} FROM document_packages \
                 WHERE policy_id = $1 AND is_current"
            ))
            .bind(package.policy_id)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(current) = current {
                let current: DocumentPackage = current.try_into()?;
                let rows = sqlx::query_as::<_, ComponentRow>(&format!(
                    "SELECT {COMPONENT_COLUMNS} FROM document_components WHERE package_id = $1 \
                     ORDER BY sequence_order"
                ))
                .bind(current.id)
                .fetch_all(&mut *tx)
                .await?;
                tx.commit().await?;
                return Ok(CreatedPackage {
                    created: false,
                    package: current,
                    components: collect(rows)?,
                });
            }
        }

        let max_version: Option<i32> =
            sqlx::query_scalar("SELECT MAX(version) FROM document_packages WHERE policy_id = $1")
                .bind(package.policy_id)
                .fetch_one(&mut *tx)
                .await?;
        let version = max_version.map_or(0, |v| v + 1);
        let number = format_package(&package.policy_number, version)?;

        sqlx::query(
            "UPDATE document_packages \
             SET status = CASE WHEN is_current THEN $2 ELSE $3 END, is_current = FALSE \
             WHERE policy_id = $1",
        )
        .bind(package.policy_id)
        .bind(PackageStatus::Reissued.as_str())
        .bind(PackageStatus::Superseded.as_str())
        .execute(&mut *tx)
        .await?;

        let created: DocumentPackage = sqlx::query_as::<_, PackageRow>(&format!(
            "INSERT INTO document_packages (policy_id, package_number, version, status, \
                 is_current, state_code, merge_snapshot) \
             VALUES ($1, $2, $3, $4, TRUE, $5, $6) \
             RETURNING {PACKAGE_COLUMNS}"
        ))
        .bind(package.policy_id)
        .bind(&number)
        .bind(version)
        .bind(PackageStatus::Draft.as_str())
        .bind(&package.state_code)
        .bind(&package.merge_snapshot)
        .fetch_one(&mut *tx)
        .await?
        .try_into()?;

        let mut rows = Vec::with_capacity(components.len());
        for (index, component) in components.into_iter().enumerate() {
            let row: DocumentComponent = sqlx::query_as::<_, ComponentRow>(&format!(
                "INSERT INTO document_components (package_id, template_id, sequence_order, \
                     component_type, name, status, merge_inputs) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 RETURNING {COMPONENT_COLUMNS}"
            ))
            .bind(created.id)
            .bind(component.template_id)
            .bind(index as i32 + 1)
            .bind(component.component_type.as_str())
            .bind(&component.name)
            .bind(ComponentStatus::Pending.as_str())
            .bind(&component.merge_inputs)
            .fetch_one(&mut *tx)
            .await?
            .try_into()?;
            rows.push(row);
        }

        tx.commit().await?;
        Ok(CreatedPackage {
            created: true,
            package: created,
            components: rows,
        })
    }

    async fn get_package(&self, package_id: i64) -> Result<Option<DocumentPackage>, EngineError> {
        let row = sqlx::query_as::<_, PackageRow>(&format!(
            "SELECT {PACKAGE_COLUMNS} FROM document_packages WHERE id = $1"
        ))
        .bind(package_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DocumentPackage::try_from).transpose()
    }

    async fn get_current_package(
        &self,
        policy_id: i64,
    ) -> Result<Option<DocumentPackage>, EngineError> {
        let row = sqlx::query_as::<_, PackageRow>(&format!(
            "SELECT {PACKAGE_COLUMNS} FROM document_packages WHERE policy_id = $1 AND is_current"
        ))
        .bind(policy_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DocumentPackage::try_from).transpose()
    }

    async fn list_packages(&self, policy_id: i64) -> Result<Vec<DocumentPackage>, EngineError> {
        let rows = sqlx::query_as::<_, PackageRow>(&format!(
            "SELECT {PACKAGE_COLUMNS} FROM document_packages WHERE policy_id = $1 \
             ORDER BY version DESC"
        ))
        .bind(policy_id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn update_package_rollup(
        &self,
        package_id: i64,
        status: PackageStatus,
        total_pages: i32,
        byte_size: i64,
    ) -> Result<DocumentPackage, EngineError> {
        let row = sqlx::query_as::<_, PackageRow>(&format!(
            "UPDATE document_packages SET status = $2, total_pages = $3, byte_size = $4, \
                 combined_artifact_key = NULL \
             WHERE id = $1 RETURNING {PACKAGE_COLUMNS}"
        ))
        .bind(package_id)
        .bind(status.as_str())
        .bind(total_pages)
        .bind(byte_size)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::not_found(format!("package {package_id}")))?;
        row.try_into()
    }

    async fn mark_package_issued(
        &self,
        package_id: i64,
        issued_at: DateTime<Utc>,
    ) -> Result<DocumentPackage, EngineError> {
        let mut tx = self.pool.begin().await?;
        let package = Self::fetch_package(&mut tx, package_id).await?;
        if !package.is_current {
            return Err(EngineError::Concurrency(format!(
                "package {} is no longer current",
                package.number
            )));
        }
        let row = sqlx::query_as::<_, PackageRow>(&format!(
            "UPDATE document_packages SET status = $2, issued_date = $3 \
             WHERE id = $1 RETURNING {PACKAGE_COLUMNS}"
        ))
        .bind(package_id)
        .bind(PackageStatus::Issued.as_str())
        .bind(issued_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        row.try_into()
    }

    async fn set_combined_artifact(&self, package_id: i64, key: &str) -> Result<(), EngineError> {
        let result =
            sqlx::query("UPDATE document_packages SET combined_artifact_key = $2 WHERE id = $1")
                .bind(package_id)
                .bind(key)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(format!("package {package_id}")));
        }
        Ok(())
    }

    async fn list_components(
        &self,
        package_id: i64,
    ) -> Result<Vec<DocumentComponent>, EngineError> {
        let rows = sqlx::query_as::<_, ComponentRow>(&format!(
            "SELECT {COMPONENT_COLUMNS} FROM document_components WHERE package_id = $1 \
             ORDER BY sequence_order"
        ))
        .bind(package_id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn get_component(
        &self,
        component_id: i64,
    ) -> Result<Option<DocumentComponent>, EngineError> {
        let row = sqlx::query_as::<_, ComponentRow>(&format!(
            "SELECT {COMPONENT_COLUMNS} FROM document_components WHERE id = $1"
        ))
        .bind(component_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DocumentComponent::try_from).transpose()
    }

    async fn append_component(
        &self,
        package_id: i64,
        component: NewComponent,
    ) -> Result<DocumentComponent, EngineError> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<i64> =
            sqlx::query_scalar("SELECT id FROM document_packages WHERE id = $1 FOR UPDATE")
                .bind(package_id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Err(EngineError::not_found(format!("package {package_id}")));
        }

        let (max_order, occurrences): (Option<i32>, i64) = sqlx::query_as(
            "SELECT MAX(sequence_order), \
                    COUNT(*) FILTER (WHERE $2::BIGINT IS NOT NULL AND template_id = $2) \
             FROM document_components WHERE package_id = $1",
        )
        .bind(package_id)
        .bind(component.template_id)
        .fetch_one(&mut *tx)
        .await?;

        let occurrence = occurrences + 1;
        let name = if occurrence > 1 {
            format!("{} ({})", component.name, occurrence)
        } else {
            component.name
        };

        let row = sqlx::query_as::<_, ComponentRow>(&format!(
            "INSERT INTO document_components (package_id, template_id, sequence_order, \
                 component_type, name, status, merge_inputs) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {COMPONENT_COLUMNS}"
        ))
        .bind(package_id)
        .bind(component.template_id)
        .bind(max_order.unwrap_or(0) + 1)
        .bind(component.component_type.as_str())
        .bind(name)
        .bind(ComponentStatus::Pending.as_str())
        .bind(&component.merge_inputs)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        row.try_into()
    }

    async fn save_component(&self, component: &DocumentComponent) -> Result<(), EngineError> {
        let result = sqlx::query(
            "UPDATE document_components SET status = $2, artifact_key = $3, page_count = $4, \
                 byte_size = $5, merge_inputs = $6, error_message = $7, generated_at = $8 \
             WHERE id = $1",
        )
        .bind(component.id)
        .bind(component.status.as_str())
        .bind(&component.artifact_key)
        .bind(component.page_count)
        .bind(component.byte_size)
        .bind(&component.merge_inputs)
        .bind(&component.error_message)
        .bind(component.generated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(format!("component {}", component.id)));
        }
        Ok(())
    }

    async fn delete_component(&self, component_id: i64) -> Result<(), EngineError> {
        let result = sqlx::query("DELETE FROM document_components WHERE id = $1")
            .bind(component_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(format!("component {component_id}")));
        }
        Ok(())
    }

    async fn template_usage(&self, package_id: i64) -> Result<BTreeMap<i64, i64>, EngineError> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT template_id, COUNT(*) FROM document_components \
             WHERE package_id = $1 AND template_id IS NOT NULL GROUP BY template_id",
        )
        .bind(package_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn max_endorsement_sequence(&self, policy_id: i64) -> Result<i32, EngineError> {
        let max: Option<i32> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM endorsement_documents WHERE policy_id = $1")
                .bind(policy_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.unwrap_or(0))
    }

    async fn insert_endorsement(
        &self,
        endorsement: NewEndorsement,
    ) -> Result<Endorsement, EngineError> {
        let inserted = sqlx::query_as::<_, EndorsementRow>(&format!(
            "INSERT INTO endorsement_documents (policy_id, template_id, endorsement_number, \
                 sequence, title, effective_date, artifact_key, merge_inputs) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {ENDORSEMENT_COLUMNS}"
        ))
        .bind(endorsement.policy_id)
        .bind(endorsement.template_id)
        .bind(&endorsement.number)
        .bind(endorsement.sequence)
        .bind(&endorsement.title)
        .bind(endorsement.effective_date)
        .bind(&endorsement.artifact_key)
        .bind(&endorsement.merge_inputs)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(row) => Ok(row.into()),
            Err(err) if is_unique_violation(&err) => Err(EngineError::Concurrency(format!(
                "endorsement {} already exists",
                endorsement.number
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_endorsements(&self, policy_id: i64) -> Result<Vec<Endorsement>, EngineError> {
        let rows = sqlx::query_as::<_, EndorsementRow>(&format!(
            "SELECT {ENDORSEMENT_COLUMNS} FROM endorsement_documents WHERE policy_id = $1 \
             ORDER BY sequence"
        ))
        .bind(policy_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Endorsement::from).collect())
    }
}
