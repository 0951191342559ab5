//! Persistence layer.
//!
//! - `memory` - in-process tables behind a single lock, used by tests and demos
//! - `postgres` - sqlx implementation backed by the schema in `migrations/`
//!
//! Both implementations honour the same contract: tracker reservations are
//! serialized per product, and every write that changes `is_current` first
//! unsets all current packages of the policy inside one critical section.

mod memory;
mod postgres;

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::models::{
    DocumentComponent, DocumentPackage, Endorsement, NewComponent, NewEndorsement, NewPackage,
    NewTemplate, PackageStatus, PolicyRecord, Product, SequenceTracker, Template,
};

/// Result of creating a package together with its component rows.
///
/// `created` is false when an existing current package was kept; `package`
/// and `components` then describe that package.
#[derive(Debug, Clone)]
pub struct CreatedPackage {
    pub created: bool,
    pub package: DocumentPackage,
    pub components: Vec<DocumentComponent>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn upsert_product(&self, product: &Product) -> Result<(), EngineError>;

    async fn get_product(&self, code: &str) -> Result<Option<Product>, EngineError>;

    async fn list_products(&self) -> Result<Vec<Product>, EngineError>;

    async fn get_tracker(&self, product_code: &str) -> Result<Option<SequenceTracker>, EngineError>;

    /// Create the tracker if missing and raise it to the highest base number
    /// already referenced by applications, quotes or policies of the product.
    async fn init_tracker(&self, product_code: &str) -> Result<SequenceTracker, EngineError>;

    /// Increment `last_reserved` under the tracker lock and return it.
    async fn reserve_base(
        &self,
        product_code: &str,
        now: DateTime<Utc>,
    ) -> Result<i32, EngineError>;

    /// Raise `last_used` to `base_number` if it is higher.
    async fn confirm_base(&self, product_code: &str, base_number: i32) -> Result<(), EngineError>;

    /// Reset `last_reserved := last_used` for trackers whose reservations are
    /// older than `cutoff` and whose gap nobody references. Returns reset codes.
    async fn sweep_reservations(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, EngineError>;

    async fn max_quote_version(
        &self,
        product_code: &str,
        base_number: &str,
    ) -> Result<Option<i32>, EngineError>;

    /// Get-or-create by template code. The flag is true when a row was inserted.
    async fn insert_template_if_absent(
        &self,
        template: NewTemplate,
    ) -> Result<(Template, bool), EngineError>;

    async fn get_template(&self, id: i64) -> Result<Option<Template>, EngineError>;

    async fn get_template_by_code(&self, code: &str) -> Result<Option<Template>, EngineError>;

    /// Active templates of the product plus product-agnostic ones.
    async fn list_active_templates(&self, product_code: &str)
        -> Result<Vec<Template>, EngineError>;

    async fn list_templates(&self) -> Result<Vec<Template>, EngineError>;

    async fn get_policy(&self, policy_id: i64) -> Result<Option<PolicyRecord>, EngineError>;

    /// Insert a package as the policy's only current one. The version is
    /// `max(existing) + 1` (0 for the first); the previous current package
    /// becomes `reissued` and anything older `superseded`.
    ///
    /// Without `replace_current` an existing current package, checked under
    /// the same lock, is returned instead and nothing is written.
    async fn create_package(
        &self,
        package: NewPackage,
        components: Vec<NewComponent>,
        replace_current: bool,
    ) -> Result<CreatedPackage, EngineError>;

    async fn get_package(&self, package_id: i64) -> Result<Option<DocumentPackage>, EngineError>;

    async fn get_current_package(
        &self,
        policy_id: i64,
    ) -> Result<Option<DocumentPackage>, EngineError>;

    /// Newest version first.
    async fn list_packages(&self, policy_id: i64) -> Result<Vec<DocumentPackage>, EngineError>;

    /// Store recomputed totals and drop the combined artifact reference,
    /// which no longer matches the components.
    async fn update_package_rollup(
        &self,
        package_id: i64,
        status: PackageStatus,
        total_pages: i32,
        byte_size: i64,
    ) -> Result<DocumentPackage, EngineError>;

    async fn mark_package_issued(
        &self,
        package_id: i64,
        issued_at: DateTime<Utc>,
    ) -> Result<DocumentPackage, EngineError>;

    async fn set_combined_artifact(&self, package_id: i64, key: &str) -> Result<(), EngineError>;

    /// Ordered by `sequence_order`.
    async fn list_components(&self, package_id: i64)
        -> Result<Vec<DocumentComponent>, EngineError>;

    async fn get_component(
        &self,
        component_id: i64,
    ) -> Result<Option<DocumentComponent>, EngineError>;

    /// Append with `sequence_order = max + 1`. Repeated templates get a
    /// ` (N)` suffix where N is the 1-based occurrence.
    async fn append_component(
        &self,
        package_id: i64,
        component: NewComponent,
    ) -> Result<DocumentComponent, EngineError>;

    async fn save_component(&self, component: &DocumentComponent) -> Result<(), EngineError>;

    async fn delete_component(&self, component_id: i64) -> Result<(), EngineError>;

    /// template id -> number of components using it in the package.
    async fn template_usage(&self, package_id: i64) -> Result<BTreeMap<i64, i64>, EngineError>;

    async fn max_endorsement_sequence(&self, policy_id: i64) -> Result<i32, EngineError>;

    /// Fails with `Concurrency` if the sequence is already taken.
    async fn insert_endorsement(
        &self,
        endorsement: NewEndorsement,
    ) -> Result<Endorsement, EngineError>;

    async fn list_endorsements(&self, policy_id: i64) -> Result<Vec<Endorsement>, EngineError>;
}

/// Aggregate a package's status from its components.
///
/// Historic packages keep their status. An issued package stays issued while
/// every component is generated.
pub fn aggregate_status(
    current: PackageStatus,
    components: &[DocumentComponent],
) -> (PackageStatus, i32, i64) {
    use crate::models::ComponentStatus;

    let generated = components
        .iter()
        .filter(|c| c.status == ComponentStatus::Generated);
    let total_pages = generated.clone().map(|c| c.page_count).sum();
    let byte_size = generated.map(|c| c.byte_size).sum();

    let status = match current {
        PackageStatus::Reissued | PackageStatus::Superseded => current,
        _ => {
            let complete = !components.is_empty()
                && components
                    .iter()
                    .all(|c| c.status == ComponentStatus::Generated);
            match (complete, current) {
                (true, PackageStatus::Issued) => PackageStatus::Issued,
                (true, _) => PackageStatus::Generated,
                (false, _) => PackageStatus::Draft,
            }
        }
    };
    (status, total_pages, byte_size)
}
