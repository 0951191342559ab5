//! In-memory repository.
//!
//! One `parking_lot::Mutex` guards every table, so each trait method is a
//! single critical section. That gives the same serialization the Postgres
//! implementation gets from row locks.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{CreatedPackage, Repository};
use crate::error::EngineError;
use crate::identifiers::{format_package, MAX_BASE_NUMBER};
use crate::models::{
    ComponentStatus, DocumentComponent, DocumentPackage, Endorsement, NewComponent,
    NewEndorsement, NewPackage, NewTemplate, PackageStatus, PolicyRecord, Product,
    SequenceTracker, Template,
};

/// A base number referenced by an application, quote or policy row.
#[derive(Debug, Clone, PartialEq)]
struct IdentifierReference {
    product_code: String,
    base_number: i32,
    version_number: Option<i32>,
}

#[derive(Default)]
struct Tables {
    products: BTreeMap<String, Product>,
    trackers: BTreeMap<String, SequenceTracker>,
    templates: BTreeMap<i64, Template>,
    policies: BTreeMap<i64, PolicyRecord>,
    references: Vec<IdentifierReference>,
    packages: BTreeMap<i64, DocumentPackage>,
    components: BTreeMap<i64, DocumentComponent>,
    endorsements: BTreeMap<i64, Endorsement>,
    last_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn max_reference(&self, product_code: &str, above: i32, up_to: i32) -> Option<i32> {
        self.references
            .iter()
            .filter(|r| r.product_code == product_code)
            .map(|r| r.base_number)
            .filter(|base| *base > above && *base <= up_to)
            .max()
    }

    fn package_mut(&mut self, package_id: i64) -> Result<&mut DocumentPackage, EngineError> {
        self.packages
            .get_mut(&package_id)
            .ok_or_else(|| EngineError::not_found(format!("package {package_id}")))
    }
}

#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a policy owned by the external policy system. The policy's base
    /// number counts as a referenced identifier for its product.
    pub fn insert_policy(&self, policy: PolicyRecord) {
        let mut tables = self.tables.lock();
        if let Ok(base_number) = policy.base_number.parse::<i32>() {
            tables.references.push(IdentifierReference {
                product_code: policy.product_code.clone(),
                base_number,
                version_number: None,
            });
        }
        tables.last_id = tables.last_id.max(policy.id);
        tables.policies.insert(policy.id, policy);
    }

    /// Seed an application or quote row that references `base_number`.
    pub fn record_reference(&self, product_code: &str, base_number: i32, version: Option<i32>) {
        self.tables.lock().references.push(IdentifierReference {
            product_code: product_code.to_string(),
            base_number,
            version_number: version,
        });
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn upsert_product(&self, product: &Product) -> Result<(), EngineError> {
        self.tables
            .lock()
            .products
            .insert(product.code.clone(), product.clone());
        Ok(())
    }

    async fn get_product(&self, code: &str) -> Result<Option<Product>, EngineError> {
        Ok(self.tables.lock().products.get(code).cloned())
    }

    async fn list_products(&self) -> Result<Vec<Product>, EngineError> {
        Ok(self.tables.lock().products.values().cloned().collect())
    }

    async fn get_tracker(&self, product_code: &str) -> Result<Option<SequenceTracker>, EngineError> {
        Ok(self.tables.lock().trackers.get(product_code).cloned())
    }

    async fn init_tracker(&self, product_code: &str) -> Result<SequenceTracker, EngineError> {
        let mut tables = self.tables.lock();
        if !tables.products.contains_key(product_code) {
            return Err(EngineError::ProductUnknown(product_code.to_string()));
        }
        let highest = tables
            .max_reference(product_code, 0, MAX_BASE_NUMBER)
            .unwrap_or(0);
        let tracker = tables
            .trackers
            .entry(product_code.to_string())
            .or_insert_with(|| SequenceTracker {
                product_code: product_code.to_string(),
                last_used: 0,
                last_reserved: 0,
                last_reserved_at: None,
            });
        tracker.last_used = tracker.last_used.max(highest);
        tracker.last_reserved = tracker.last_reserved.max(tracker.last_used);
        Ok(tracker.clone())
    }

    async fn reserve_base(
        &self,
        product_code: &str,
        now: DateTime<Utc>,
    ) -> Result<i32, EngineError> {
        let mut tables = self.tables.lock();
        if !tables.products.contains_key(product_code) {
            return Err(EngineError::ProductUnknown(product_code.to_string()));
        }
        let tracker = tables
            .trackers
            .entry(product_code.to_string())
            .or_insert_with(|| SequenceTracker {
                product_code: product_code.to_string(),
                last_used: 0,
                last_reserved: 0,
                last_reserved_at: None,
            });
        let next = tracker.last_reserved + 1;
        if next > MAX_BASE_NUMBER {
            return Err(EngineError::SequenceExhausted(product_code.to_string()));
        }
        tracker.last_reserved = next;
        tracker.last_reserved_at = Some(now);
        Ok(next)
    }

    async fn confirm_base(&self, product_code: &str, base_number: i32) -> Result<(), EngineError> {
        let mut tables = self.tables.lock();
        let tracker = tables
            .trackers
            .get_mut(product_code)
            .ok_or_else(|| EngineError::ProductUnknown(product_code.to_string()))?;
        if base_number > tracker.last_used {
            tracker.last_used = base_number;
        }
        tracker.last_reserved = tracker.last_reserved.max(tracker.last_used);
        Ok(())
    }

    async fn sweep_reservations(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, EngineError> {
        let mut tables = self.tables.lock();
        let stale: Vec<(String, i32, i32)> = tables
            .trackers
            .values()
            .filter(|t| t.last_reserved > t.last_used)
            .filter(|t| t.last_reserved_at.map_or(true, |at| at <= cutoff))
            .map(|t| (t.product_code.clone(), t.last_used, t.last_reserved))
            .collect();

        let mut reset = Vec::new();
        for (code, used, reserved) in stale {
            let floor = tables
                .max_reference(&code, used, reserved)
                .map_or(used, |referenced| referenced.max(used));
            if let Some(tracker) = tables.trackers.get_mut(&code) {
                tracker.last_used = floor;
                tracker.last_reserved = floor;
            }
            reset.push(code);
        }
        Ok(reset)
    }

    async fn max_quote_version(
        &self,
        product_code: &str,
        base_number: &str,
    ) -> Result<Option<i32>, EngineError> {
        let base: i32 = base_number
            .parse()
            .map_err(|_| EngineError::validation(format!("invalid base number {base_number:?}")))?;
        let tables = self.tables.lock();
        Ok(tables
            .references
            .iter()
            .filter(|r| r.product_code == product_code && r.base_number == base)
            .filter_map(|r| r.version_number)
            .max())
    }

    async fn insert_template_if_absent(
        &self,
        template: NewTemplate,
    ) -> Result<(Template, bool), EngineError> {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.templates.values().find(|t| t.code == template.code) {
            return Ok((existing.clone(), false));
        }
        let id = tables.next_id();
        let template = template.into_template(id);
        tables.templates.insert(id, template.clone());
        Ok((template, true))
    }

    async fn get_template(&self, id: i64) -> Result<Option<Template>, EngineError> {
        Ok(self.tables.lock().templates.get(&id).cloned())
    }

    async fn get_template_by_code(&self, code: &str) -> Result<Option<Template>, EngineError> {
        Ok(self
            .tables
            .lock()
            .templates
            .values()
            .find(|t| t.code == code)
            .cloned())
    }

    async fn list_active_templates(
        &self,
        product_code: &str,
    ) -> Result<Vec<Template>, EngineError> {
        Ok(self
            .tables
            .lock()
            .templates
            .values()
            .filter(|t| t.active && t.is_for_product(product_code))
            .cloned()
            .collect())
    }

    async fn list_templates(&self) -> Result<Vec<Template>, EngineError> {
        Ok(self.tables.lock().templates.values().cloned().collect())
    }

    async fn get_policy(&self, policy_id: i64) -> Result<Option<PolicyRecord>, EngineError> {
        Ok(self.tables.lock().policies.get(&policy_id).cloned())
    }

    async fn create_package(
        &self,
        package: NewPackage,
        components: Vec<NewComponent>,
        replace_current: bool,
    ) -> Result<CreatedPackage, EngineError> {
        let mut tables = self.tables.lock();
        if !tables.policies.contains_key(&package.policy_id) {
            return Err(EngineError::not_found(format!("policy {}", package.policy_id)));
        }
        if !replace_current {
            let current = tables
                .packages
                .values()
                .find(|p| p.policy_id == package.policy_id && p.is_current)
                .cloned();
            if let Some(current) = current {
                let mut rows: Vec<DocumentComponent> = tables
                    .components
                    .values()
                    .filter(|c| c.package_id == current.id)
                    .cloned()
                    .collect();
                rows.sort_by_key(|c| c.sequence_order);
                return Ok(CreatedPackage {
                    created: false,
                    package: current,
                    components: rows,
                });
            }
        }

        let version = tables
            .packages
            .values()
            .filter(|p| p.policy_id == package.policy_id)
            .map(|p| p.version + 1)
            .max()
            .unwrap_or(0);
        let number = format_package(&package.policy_number, version)?;
        for existing in tables
            .packages
            .values_mut()
            .filter(|p| p.policy_id == package.policy_id)
        {
            existing.status = if existing.is_current {
                PackageStatus::Reissued
            } else {
                PackageStatus::Superseded
            };
            existing.is_current = false;
        }

        let id = tables.next_id();
        let created = DocumentPackage {
            id,
            policy_id: package.policy_id,
            number,
            version,
            status: PackageStatus::Draft,
            is_current: true,
            generated_date: Utc::now(),
            issued_date: None,
            combined_artifact_key: None,
            total_pages: 0,
            byte_size: 0,
            state_code: package.state_code,
            merge_snapshot: package.merge_snapshot,
        };
        tables.packages.insert(id, created.clone());

        let mut rows = Vec::with_capacity(components.len());
        for (index, component) in components.into_iter().enumerate() {
            let component_id = tables.next_id();
            let row = DocumentComponent {
                id: component_id,
                package_id: id,
                template_id: component.template_id,
                sequence_order: index as i32 + 1,
                component_type: component.component_type,
                name: component.name,
                status: ComponentStatus::Pending,
                artifact_key: None,
                page_count: 0,
                byte_size: 0,
                merge_inputs: component.merge_inputs,
                error_message: None,
                generated_at: None,
            };
            tables.components.insert(component_id, row.clone());
            rows.push(row);
        }

        Ok(CreatedPackage {
            created: true,
            package: created,
            components: rows,
        })
    }

    async fn get_package(&self, package_id: i64) -> Result<Option<DocumentPackage>, EngineError> {
        Ok(self.tables.lock().packages.get(&package_id).cloned())
    }

    async fn get_current_package(
        &self,
        policy_id: i64,
    ) -> Result<Option<DocumentPackage>, EngineError> {
        Ok(self
            .tables
            .lock()
            .packages
            .values()
            .find(|p| p.policy_id == policy_id && p.is_current)
            .cloned())
    }

    async fn list_packages(&self, policy_id: i64) -> Result<Vec<DocumentPackage>, EngineError> {
        let mut packages: Vec<DocumentPackage> = self
            .tables
            .lock()
            .packages
            .values()
            .filter(|p| p.policy_id == policy_id)
            .cloned()
            .collect();
        packages.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(packages)
    }

    async fn update_package_rollup(
        &self,
        package_id: i64,
        status: PackageStatus,
        total_pages: i32,
        byte_size: i64,
    ) -> Result<DocumentPackage, EngineError> {
        let mut tables = self.tables.lock();
        let package = tables.package_mut(package_id)?;
        package.status = status;
        package.total_pages = total_pages;
        package.byte_size = byte_size;
        package.combined_artifact_key = None;
        Ok(package.clone())
    }

    async fn mark_package_issued(
        &self,
        package_id: i64,
        issued_at: DateTime<Utc>,
    ) -> Result<DocumentPackage, EngineError> {
        let mut tables = self.tables.lock();
        let package = tables.package_mut(package_id)?;
        package.status = PackageStatus::Issued;
        package.issued_date = Some(issued_at);
        Ok(package.clone())
    }

    async fn set_combined_artifact(&self, package_id: i64, key: &str) -> Result<(), EngineError> {
        let mut tables = self.tables.lock();
        tables.package_mut(package_id)?.combined_artifact_key = Some(key.to_string());
        Ok(())
    }

    async fn list_components(
        &self,
        package_id: i64,
    ) -> Result<Vec<DocumentComponent>, EngineError> {
        let mut components: Vec<DocumentComponent> = self
            .tables
            .lock()
            .components
            .values()
            .filter(|c| c.package_id == package_id)
            .cloned()
            .collect();
        components.sort_by_key(|c| c.sequence_order);
        Ok(components)
    }

    async fn get_component(
        &self,
        component_id: i64,
    ) -> Result<Option<DocumentComponent>, EngineError> {
        Ok(self.tables.lock().components.get(&component_id).cloned())
    }

    async fn append_component(
        &self,
        package_id: i64,
        component: NewComponent,
    ) -> Result<DocumentComponent, EngineError> {
        let mut tables = self.tables.lock();
        if !tables.packages.contains_key(&package_id) {
            return Err(EngineError::not_found(format!("package {package_id}")));
        }

        let siblings = tables
            .components
            .values()
            .filter(|c| c.package_id == package_id);
        let next_order = siblings.clone().map(|c| c.sequence_order).max().unwrap_or(0) + 1;
        let occurrence = match component.template_id {
            Some(template_id) => {
                siblings
                    .filter(|c| c.template_id == Some(template_id))
                    .count()
                    + 1
            }
            None => 1,
        };
        let name = if occurrence > 1 {
            format!("{} ({})", component.name, occurrence)
        } else {
            component.name
        };

        let id = tables.next_id();
        let row = DocumentComponent {
            id,
            package_id,
            template_id: component.template_id,
            sequence_order: next_order,
            component_type: component.component_type,
            name,
            status: ComponentStatus::Pending,
            artifact_key: None,
            page_count: 0,
            byte_size: 0,
            merge_inputs: component.merge_inputs,
            error_message: None,
            generated_at: None,
        };
        tables.components.insert(id, row.clone());
        Ok(row)
    }

    async fn save_component(&self, component: &DocumentComponent) -> Result<(), EngineError> {
        let mut tables = self.tables.lock();
        match tables.components.get_mut(&component.id) {
            Some(row) => {
                *row = component.clone();
                Ok(())
            }
            None => Err(EngineError::not_found(format!("component {}", component.id))),
        }
    }

    async fn delete_component(&self, component_id: i64) -> Result<(), EngineError> {
        self.tables
            .lock()
            .components
            .remove(&component_id)
            .map(|_| ())
            .ok_or_else(|| EngineError::not_found(format!("component {component_id}")))
    }

    async fn template_usage(&self, package_id: i64) -> Result<BTreeMap<i64, i64>, EngineError> {
        let tables = self.tables.lock();
        let mut usage = BTreeMap::new();
        for template_id in tables
            .components
            .values()
            .filter(|c| c.package_id == package_id)
            .filter_map(|c| c.template_id)
        {
            *usage.entry(template_id).or_insert(0) += 1;
        }
        Ok(usage)
    }

    async fn max_endorsement_sequence(&self, policy_id: i64) -> Result<i32, EngineError> {
        Ok(self
            .tables
            .lock()
            .endorsements
            .values()
            .filter(|e| e.policy_id == policy_id)
            .map(|e| e.sequence)
            .max()
            .unwrap_or(0))
    }

    async fn insert_endorsement(
        &self,
        endorsement: NewEndorsement,
    ) -> Result<Endorsement, EngineError> {
        let mut tables = self.tables.lock();
        let taken = tables.endorsements.values().any(|e| {
            (e.policy_id == endorsement.policy_id && e.sequence == endorsement.sequence)
                || e.number == endorsement.number
        });
        if taken {
            return Err(EngineError::Concurrency(format!(
                "endorsement {} already exists",
                endorsement.number
            )));
        }

        let id = tables.next_id();
        let row = Endorsement {
            id,
            policy_id: endorsement.policy_id,
            template_id: endorsement.template_id,
            number: endorsement.number,
            sequence: endorsement.sequence,
            title: endorsement.title,
            effective_date: endorsement.effective_date,
            artifact_key: endorsement.artifact_key,
            merge_inputs: endorsement.merge_inputs,
            created_at: Utc::now(),
        };
        tables.endorsements.insert(id, row.clone());
        Ok(row)
    }

    async fn list_endorsements(&self, policy_id: i64) -> Result<Vec<Endorsement>, EngineError> {
        let mut endorsements: Vec<Endorsement> = self
            .tables
            .lock()
            .endorsements
            .values()
            .filter(|e| e.policy_id == policy_id)
            .cloned()
            .collect();
        endorsements.sort_by_key(|e| e.sequence);
        Ok(endorsements)
    }
}
