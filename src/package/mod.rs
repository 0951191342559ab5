//! Package lifecycle: creation, per-component generation, status rollup,
//! combining, issuance and delivery.

mod locks;
mod summary;

pub use locks::{ComponentGuard, ComponentLocks};
pub use summary::{
    AvailableTemplate, BulkMode, BulkResult, CombineResult, ComponentResult, ComponentSummary,
    CreatePackageResult, GenerateMissingSummary, PackageSummary, StatusReport,
};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};

use crate::combine::PdfCombiner;
use crate::db::{aggregate_status, Repository};
use crate::delivery::{normalize_recipients, DeliveryChannel, DeliveryReceipt, DeliveryRequest};
use crate::error::EngineError;
use crate::merge::{self, MergeBundle};
use crate::metrics;
use crate::models::{
    ComponentStatus, DocumentComponent, DocumentPackage, NewComponent, NewPackage, PackageStatus,
    PolicyRecord, Template, TemplateType,
};
use crate::render::ComponentRenderer;
use crate::storage::{self, ArtifactStore};
use crate::templates::TemplateRegistry;

#[derive(Clone)]
pub struct PackageManager {
    repo: Arc<dyn Repository>,
    store: Arc<dyn ArtifactStore>,
    registry: TemplateRegistry,
    renderer: ComponentRenderer,
    combiner: PdfCombiner,
    delivery: Arc<dyn DeliveryChannel>,
    locks: ComponentLocks,
    bulk_concurrency: usize,
}

impl PackageManager {
    pub fn new(
        repo: Arc<dyn Repository>,
        store: Arc<dyn ArtifactStore>,
        registry: TemplateRegistry,
        renderer: ComponentRenderer,
        combiner: PdfCombiner,
        delivery: Arc<dyn DeliveryChannel>,
        bulk_concurrency: usize,
    ) -> Self {
        Self {
            repo,
            store,
            registry,
            renderer,
            combiner,
            delivery,
            locks: ComponentLocks::new(),
            bulk_concurrency: bulk_concurrency.max(1),
        }
    }

    pub fn locks(&self) -> &ComponentLocks {
        &self.locks
    }

    async fn policy(&self, policy_id: i64) -> Result<PolicyRecord, EngineError> {
        self.repo
            .get_policy(policy_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("policy {policy_id}")))
    }

    async fn package(&self, package_id: i64) -> Result<DocumentPackage, EngineError> {
        self.repo
            .get_package(package_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("package {package_id}")))
    }

    async fn current_package(&self, policy: &PolicyRecord) -> Result<DocumentPackage, EngineError> {
        self.repo
            .get_current_package(policy.id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("current package for policy {}", policy.number)))
    }

    /// The component together with its package, checked against the policy.
    async fn owned_component(
        &self,
        policy_id: i64,
        component_id: i64,
    ) -> Result<(DocumentPackage, DocumentComponent), EngineError> {
        let missing = || EngineError::not_found(format!("component {component_id} of policy {policy_id}"));
        let component = self.repo.get_component(component_id).await?.ok_or_else(missing)?;
        let package = self.package(component.package_id).await?;
        if package.policy_id != policy_id {
            return Err(missing());
        }
        Ok((package, component))
    }

    fn ensure_mutable(package: &DocumentPackage) -> Result<(), EngineError> {
        if package.is_frozen() {
            return Err(EngineError::validation(format!(
                "package {} is {} and can no longer be changed",
                package.number, package.status
            )));
        }
        Ok(())
    }

    async fn template_for(&self, component: &DocumentComponent) -> Result<Option<Template>, EngineError> {
        match component.template_id {
            Some(id) => {
                let template = self.repo.get_template(id).await?;
                if template.is_none() {
                    log::warn!("component {} refers to unknown template {}", component.id, id);
                }
                Ok(template)
            }
            None => Ok(None),
        }
    }

    async fn summary(&self, package: &DocumentPackage) -> Result<PackageSummary, EngineError> {
        let components = self.repo.list_components(package.id).await?;
        Ok(PackageSummary::new(package, &components, self.store.as_ref()))
    }

    /// Recompute status, page and byte totals from the components.
    async fn rollup(&self, package_id: i64) -> Result<DocumentPackage, EngineError> {
        let package = self.package(package_id).await?;
        let components = self.repo.list_components(package_id).await?;
        let (status, total_pages, byte_size) = aggregate_status(package.status, &components);
        if status == package.status
            && total_pages == package.total_pages
            && byte_size == package.byte_size
            && package.combined_artifact_key.is_none()
        {
            return Ok(package);
        }
        if status != package.status {
            log::info!("package {} {} -> {}", package.number, package.status, status);
        }
        self.repo
            .update_package_rollup(package_id, status, total_pages, byte_size)
            .await
    }

    /// Render one component from the package snapshot and persist the outcome.
    ///
    /// Render failures land on the component; store and database failures are
    /// returned.
    async fn generate(
        &self,
        package: &DocumentPackage,
        mut component: DocumentComponent,
        template: Option<&Template>,
    ) -> Result<DocumentComponent, EngineError> {
        let _guard = self.locks.acquire(component.id).await?;

        let previous_key = component.artifact_key.clone();
        component.status = ComponentStatus::Pending;
        component.error_message = None;
        self.repo.save_component(&component).await?;

        let custom = component.merge_inputs.get("custom");
        let bundle = MergeBundle::from_snapshot(package.merge_snapshot.clone())
            .for_component(template, custom);

        match self.renderer.render(&component.name, template, &bundle).await {
            Ok(rendered) => {
                let now = Utc::now();
                let key = storage::component_key(&package.number, component.sequence_order, now);
                self.store.put(&key, &rendered.bytes).await?;

                component.status = ComponentStatus::Generated;
                component.artifact_key = Some(key);
                component.page_count = rendered.page_count;
                component.byte_size = rendered.byte_size;
                component.generated_at = Some(now);
                self.repo.save_component(&component).await?;

                if let Some(old) = previous_key {
                    if package.is_frozen() {
                        log::info!("keeping final artifact {} of {}", old, package.number);
                    } else if let Err(e) = self.store.delete(&old).await {
                        log::error!("could not remove replaced artifact {}: {}", old, e);
                    }
                }
            }
            Err(e) => {
                log::warn!(
                    "component {} ({}) of {} failed: {} [template {}, file {}]",
                    component.id,
                    component.name,
                    package.number,
                    e,
                    template.map_or("-", |t| t.code.as_str()),
                    template.and_then(|t| t.storage_key.as_deref()).unwrap_or("-"),
                );
                component.status = ComponentStatus::Error;
                component.error_message = Some(e.component_message());
                component.page_count = 0;
                component.byte_size = 0;
                self.repo.save_component(&component).await?;
            }
        }
        Ok(component)
    }

    async fn create_for(
        &self,
        policy: &PolicyRecord,
        force: bool,
    ) -> Result<CreatePackageResult, EngineError> {
        if !force {
            if let Some(current) = self.repo.get_current_package(policy.id).await? {
                log::info!("policy {} already has package {}", policy.number, current.number);
                return Ok(CreatePackageResult {
                    created: false,
                    package: self.summary(&current).await?,
                });
            }
        }

        let templates = self
            .registry
            .select_applicable(policy, policy.effective_date)
            .await?;
        if templates.is_empty() {
            let err = EngineError::TemplateApplicability {
                policy_number: policy.number.clone(),
                reason: format!(
                    "no active {} template covers state {} on {}",
                    policy.product_code, policy.state_code, policy.effective_date
                ),
            };
            log::warn!("{}; creating an empty draft package", err);
        }

        let endorsements = self.repo.list_endorsements(policy.id).await?;
        let bundle = merge::project(policy, &endorsements);
        let created = self
            .repo
            .create_package(
                NewPackage {
                    policy_id: policy.id,
                    policy_number: policy.number.clone(),
                    state_code: policy.state_code.clone(),
                    merge_snapshot: bundle.to_snapshot(),
                },
                templates.iter().map(NewComponent::from_template).collect(),
                force,
            )
            .await?;
        if !created.created {
            log::info!(
                "policy {} gained package {} concurrently",
                policy.number,
                created.package.number
            );
            return Ok(CreatePackageResult {
                created: false,
                package: PackageSummary::new(
                    &created.package,
                    &created.components,
                    self.store.as_ref(),
                ),
            });
        }
        metrics::record_package_created();
        log::info!(
            "created package {} (version {}) with {} component(s)",
            created.package.number,
            created.package.version,
            created.components.len()
        );

        let by_id: HashMap<i64, &Template> = templates.iter().map(|t| (t.id, t)).collect();
        for component in created.components {
            let template = component.template_id.and_then(|id| by_id.get(&id).copied());
            self.generate(&created.package, component, template).await?;
        }

        let package = self.rollup(created.package.id).await?;
        Ok(CreatePackageResult {
            created: true,
            package: self.summary(&package).await?,
        })
    }

    /// Build a package from the applicable templates. Without `force` an
    /// existing current package is returned untouched.
    pub async fn create_package(
        &self,
        policy_id: i64,
        force: bool,
    ) -> Result<CreatePackageResult, EngineError> {
        let policy = self.policy(policy_id).await?;
        self.create_for(&policy, force).await
    }

    pub async fn regenerate_component(
        &self,
        policy_id: i64,
        component_id: i64,
    ) -> Result<ComponentSummary, EngineError> {
        let (package, component) = self.owned_component(policy_id, component_id).await?;
        Self::ensure_mutable(&package)?;
        let template = self.template_for(&component).await?;
        log::info!("regenerating component {} of {}", component.id, package.number);
        let component = self.generate(&package, component, template.as_ref()).await?;
        self.rollup(package.id).await?;
        Ok(ComponentSummary::new(&component, self.store.as_ref()))
    }

    /// Append a component built from `template_id` to the current package.
    /// The same template may be added any number of times.
    pub async fn add_component(
        &self,
        policy_id: i64,
        template_id: i64,
        custom: Option<Value>,
    ) -> Result<ComponentSummary, EngineError> {
        let policy = self.policy(policy_id).await?;
        let template = self
            .repo
            .get_template(template_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("template {template_id}")))?;
        if !template.active || !template.is_for_product(&policy.product_code) {
            return Err(EngineError::validation(format!(
                "template {} cannot be used for product {}",
                template.code, policy.product_code
            )));
        }
        if let Some(custom) = &custom {
            if !custom.is_object() {
                return Err(EngineError::validation("custom data must be a JSON object"));
            }
        }

        let package = self.current_package(&policy).await?;
        Self::ensure_mutable(&package)?;
        let mut new = NewComponent::from_template(&template);
        if let Some(custom) = custom {
            new.merge_inputs = json!({ "custom": custom });
        }
        let component = self.repo.append_component(package.id, new).await?;
        log::info!(
            "added component {} \"{}\" to {} at position {}",
            component.id,
            component.name,
            package.number,
            component.sequence_order
        );

        let component = self.generate(&package, component, Some(&template)).await?;
        self.rollup(package.id).await?;
        Ok(ComponentSummary::new(&component, self.store.as_ref()))
    }

    /// Remove a component and its artifact. Issued and historic packages are
    /// left alone.
    pub async fn delete_component(&self, policy_id: i64, component_id: i64) -> Result<(), EngineError> {
        let (package, component) = self.owned_component(policy_id, component_id).await?;
        Self::ensure_mutable(&package)?;
        let _guard = self.locks.acquire(component.id).await?;
        if let Some(key) = &component.artifact_key {
            self.store.delete(key).await?;
        }
        self.repo.delete_component(component.id).await?;
        log::info!("deleted component {} from {}", component.id, package.number);
        self.rollup(package.id).await?;
        Ok(())
    }

    async fn missing_for(&self, policy: &PolicyRecord) -> Result<GenerateMissingSummary, EngineError> {
        let package = match self.repo.get_current_package(policy.id).await? {
            Some(package) => package,
            None => {
                let created = self.create_for(policy, false).await?.package;
                let results: Vec<ComponentResult> = created
                    .components
                    .iter()
                    .map(|c| ComponentResult {
                        component_id: c.id,
                        name: c.name.clone(),
                        status: c.status,
                        error_message: c.error_message.clone(),
                    })
                    .collect();
                return Ok(GenerateMissingSummary {
                    package_id: created.id,
                    package_status: created.status,
                    generated_count: results
                        .iter()
                        .filter(|r| r.status == ComponentStatus::Generated)
                        .count(),
                    total_count: results.len(),
                    results,
                });
            }
        };

        let missing: Vec<DocumentComponent> = self
            .repo
            .list_components(package.id)
            .await?
            .into_iter()
            .filter(|c| matches!(c.status, ComponentStatus::Pending | ComponentStatus::Error))
            .collect();
        if missing.is_empty() {
            return Ok(GenerateMissingSummary {
                package_id: package.id,
                package_status: package.status,
                generated_count: 0,
                total_count: 0,
                results: Vec::new(),
            });
        }
        Self::ensure_mutable(&package)?;

        let mut results = Vec::with_capacity(missing.len());
        for component in missing {
            let template = self.template_for(&component).await?;
            let component = self.generate(&package, component, template.as_ref()).await?;
            results.push(ComponentResult::from(&component));
        }
        let package = self.rollup(package.id).await?;

        Ok(GenerateMissingSummary {
            package_id: package.id,
            package_status: package.status,
            generated_count: results
                .iter()
                .filter(|r| r.status == ComponentStatus::Generated)
                .count(),
            total_count: results.len(),
            results,
        })
    }

    /// Render every pending or errored component of the current package,
    /// creating the package first if the policy has none.
    pub async fn generate_missing(&self, policy_id: i64) -> Result<GenerateMissingSummary, EngineError> {
        let policy = self.policy(policy_id).await?;
        self.missing_for(&policy).await
    }

    async fn regenerate_all(
        &self,
        policy: &PolicyRecord,
    ) -> Result<Option<(DocumentPackage, usize, usize)>, EngineError> {
        let Some(package) = self.repo.get_current_package(policy.id).await? else {
            return Ok(None);
        };
        Self::ensure_mutable(&package)?;
        let components = self.repo.list_components(package.id).await?;
        let total = components.len();
        let mut generated = 0;
        for component in components {
            let template = self.template_for(&component).await?;
            let component = self.generate(&package, component, template.as_ref()).await?;
            if component.status == ComponentStatus::Generated {
                generated += 1;
            }
        }
        Ok(Some((self.rollup(package.id).await?, generated, total)))
    }

    async fn bulk_one(&self, policy_id: i64, mode: BulkMode) -> BulkResult {
        let outcome: Result<(Option<(String, PackageStatus)>, usize, usize), EngineError> = async {
            let policy = self.policy(policy_id).await?;
            match mode {
                BulkMode::All => {
                    let package = self.create_for(&policy, true).await?.package;
                    let generated = package
                        .components
                        .iter()
                        .filter(|c| c.status == ComponentStatus::Generated)
                        .count();
                    Ok((
                        Some((package.number.clone(), package.status)),
                        generated,
                        package.components.len(),
                    ))
                }
                BulkMode::Regenerate => Ok(match self.regenerate_all(&policy).await? {
                    Some((package, generated, total)) => {
                        (Some((package.number, package.status)), generated, total)
                    }
                    None => (None, 0, 0),
                }),
                BulkMode::Missing => {
                    let summary = self.missing_for(&policy).await?;
                    let package = self.package(summary.package_id).await?;
                    Ok((
                        Some((package.number, package.status)),
                        summary.generated_count,
                        summary.total_count,
                    ))
                }
            }
        }
        .await;

        match outcome {
            Ok((package, generated_count, total_count)) => BulkResult {
                policy_id,
                success: true,
                package_number: package.as_ref().map(|(n, _)| n.clone()),
                package_status: package.map(|(_, s)| s),
                generated_count,
                total_count,
                error_kind: None,
                error: None,
            },
            Err(e) => {
                log::error!("bulk generation for policy {} failed: {}", policy_id, e);
                BulkResult {
                    policy_id,
                    success: false,
                    package_number: None,
                    package_status: None,
                    generated_count: 0,
                    total_count: 0,
                    error_kind: Some(e.kind().to_string()),
                    error: Some(e.user_message()),
                }
            }
        }
    }

    /// Apply `mode` to each policy. A failing policy does not stop the others;
    /// results come back in input order.
    pub async fn bulk_generate(&self, policy_ids: &[i64], mode: BulkMode) -> Vec<BulkResult> {
        log::info!("bulk {:?} generation for {} policies", mode, policy_ids.len());
        stream::iter(policy_ids.iter().copied())
            .map(|policy_id| self.bulk_one(policy_id, mode))
            .buffered(self.bulk_concurrency)
            .collect()
            .await
    }

    /// Templates that may be added by hand, with how often each is already
    /// used in the current package.
    pub async fn list_available_templates(
        &self,
        policy_id: i64,
        template_type: Option<TemplateType>,
        state_code: Option<&str>,
    ) -> Result<Vec<AvailableTemplate>, EngineError> {
        let policy = self.policy(policy_id).await?;
        let state = state_code.unwrap_or(&policy.state_code);
        let templates = self.registry.addable(&policy, template_type, Some(state)).await?;
        let usage = match self.repo.get_current_package(policy.id).await? {
            Some(package) => self.repo.template_usage(package.id).await?,
            None => Default::default(),
        };
        Ok(templates
            .iter()
            .map(|t| AvailableTemplate::new(t, usage.get(&t.id).copied().unwrap_or(0)))
            .collect())
    }

    /// Combine the package's generated components. Only a real merge is
    /// recorded on the package; a degraded cover is stored but not attached.
    pub async fn combine_package(&self, package_id: i64) -> Result<CombineResult, EngineError> {
        let package = self.package(package_id).await?;
        let components = self.repo.list_components(package.id).await?;

        let Some(combined) = self.combiner.combine(&package.number, &components).await? else {
            return Ok(CombineResult {
                package_id: package.id,
                package_number: package.number,
                artifact_key: None,
                artifact_url: None,
                degraded: false,
                page_count: 0,
            });
        };

        let key = if combined.degraded {
            storage::fallback_key(&package.number)
        } else {
            storage::combined_key(&package.number, Utc::now())
        };
        self.store.put(&key, &combined.bytes).await?;
        if !combined.degraded {
            self.repo.set_combined_artifact(package.id, &key).await?;
        }
        log::info!(
            "combined {} into {} ({} pages{})",
            package.number,
            key,
            combined.page_count,
            if combined.degraded { ", fallback" } else { "" }
        );

        Ok(CombineResult {
            package_id: package.id,
            package_number: package.number,
            artifact_url: Some(self.store.url(&key)),
            artifact_key: Some(key),
            degraded: combined.degraded,
            page_count: combined.page_count,
        })
    }

    /// Mark the current package issued.
    pub async fn issue_package(&self, package_id: i64) -> Result<PackageSummary, EngineError> {
        let package = self.package(package_id).await?;
        if !package.is_current {
            return Err(EngineError::validation(format!(
                "package {} is not the current package",
                package.number
            )));
        }
        if !matches!(package.status, PackageStatus::Draft | PackageStatus::Generated) {
            return Err(EngineError::validation(format!(
                "package {} is {} and cannot be issued",
                package.number, package.status
            )));
        }
        let issued = self.repo.mark_package_issued(package.id, Utc::now()).await?;
        log::info!("issued package {}", issued.number);
        self.summary(&issued).await
    }

    pub async fn get_status(&self, policy_id: i64) -> Result<StatusReport, EngineError> {
        let policy = self.policy(policy_id).await?;
        let package = match self.repo.get_current_package(policy.id).await? {
            Some(package) => Some(self.summary(&package).await?),
            None => None,
        };
        Ok(StatusReport {
            policy_id: policy.id,
            policy_number: policy.number,
            package,
        })
    }

    /// Hand the current package to the delivery channel, combining it first
    /// when it has no combined artifact yet.
    pub async fn deliver_package(
        &self,
        policy_id: i64,
        recipients: &[String],
    ) -> Result<DeliveryReceipt, EngineError> {
        let recipients = normalize_recipients(recipients)?;
        let policy = self.policy(policy_id).await?;
        let mut package = self.current_package(&policy).await?;
        if !matches!(package.status, PackageStatus::Generated | PackageStatus::Issued) {
            return Err(EngineError::validation(format!(
                "package {} is {}; only generated or issued packages can be delivered",
                package.number, package.status
            )));
        }

        if package.combined_artifact_key.is_none() {
            self.combine_package(package.id).await?;
            package = self.package(package.id).await?;
        }

        let (artifact_urls, combined) = match &package.combined_artifact_key {
            Some(key) => (vec![self.store.url(key)], true),
            None => {
                let urls = self
                    .repo
                    .list_components(package.id)
                    .await?
                    .iter()
                    .filter(|c| c.status == ComponentStatus::Generated)
                    .filter_map(|c| c.artifact_key.as_deref())
                    .map(|k| self.store.url(k))
                    .collect();
                (urls, false)
            }
        };

        let request = DeliveryRequest {
            package_id: package.id,
            package_number: package.number.clone(),
            policy_number: policy.number,
            recipients,
            artifact_urls,
            combined,
        };
        self.delivery.deliver(&request).await?;

        Ok(DeliveryReceipt {
            channel: self.delivery.name().to_string(),
            package_number: request.package_number,
            recipients: request.recipients,
            artifact_urls: request.artifact_urls,
            delivered_at: Utc::now(),
        })
    }
}
