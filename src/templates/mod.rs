//! Template registry: which templates apply to a policy.

mod manifest;

pub use manifest::{load_manifest, verify_template_files, LoadReport, Manifest, ManifestEntry, MissingFile};

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use moka::future::Cache;

use crate::db::Repository;
use crate::error::EngineError;
use crate::models::{PolicyRecord, Template, TemplateType};

#[derive(Clone)]
pub struct TemplateRegistry {
    repo: Arc<dyn Repository>,
    candidates: Cache<String, Arc<Vec<Template>>>,
}

impl TemplateRegistry {
    pub fn new(repo: Arc<dyn Repository>, ttl: Duration) -> Self {
        let candidates = Cache::builder()
            .time_to_live(ttl)
            .max_capacity(64)
            .build();
        Self { repo, candidates }
    }

    /// Active templates for the product plus product-agnostic ones.
    pub async fn candidates(&self, product_code: &str) -> Result<Arc<Vec<Template>>, EngineError> {
        let key = product_code.to_ascii_uppercase();
        if let Some(hit) = self.candidates.get(&key).await {
            return Ok(hit);
        }
        let templates = Arc::new(self.repo.list_active_templates(&key).await?);
        self.candidates.insert(key, templates.clone()).await;
        Ok(templates)
    }

    /// Drop cached candidate lists, e.g. after a manifest load.
    pub fn invalidate(&self) {
        self.candidates.invalidate_all();
    }

    /// Eligible templates ordered by `default_sequence`, then `code`.
    pub async fn select_applicable(
        &self,
        policy: &PolicyRecord,
        as_of: NaiveDate,
    ) -> Result<Vec<Template>, EngineError> {
        let candidates = self.candidates(&policy.product_code).await?;
        Ok(select(&candidates, &policy.product_code, &policy.state_code, as_of))
    }

    /// Templates a user may add to the policy's package by hand. Dates are
    /// not checked here and prior usage never hides a template.
    pub async fn addable(
        &self,
        policy: &PolicyRecord,
        template_type: Option<TemplateType>,
        state_code: Option<&str>,
    ) -> Result<Vec<Template>, EngineError> {
        let candidates = self.candidates(&policy.product_code).await?;
        let mut templates: Vec<Template> = candidates
            .iter()
            .filter(|t| template_type.map_or(true, |ty| t.template_type == ty))
            .filter(|t| state_code.map_or(true, |state| t.is_applicable_to_state(state)))
            .cloned()
            .collect();
        sort_templates(&mut templates);
        Ok(templates)
    }
}

fn sort_templates(templates: &mut [Template]) {
    templates.sort_by(|a, b| {
        a.default_sequence
            .cmp(&b.default_sequence)
            .then_with(|| a.code.cmp(&b.code))
    });
}

/// Pure selection over a candidate list.
pub fn select(
    candidates: &[Template],
    product_code: &str,
    state_code: &str,
    as_of: NaiveDate,
) -> Vec<Template> {
    let mut selected: Vec<Template> = candidates
        .iter()
        .filter(|t| t.active)
        .filter(|t| t.is_for_product(product_code))
        .filter(|t| t.is_effective_on(as_of))
        .filter(|t| t.is_applicable_to_state(state_code))
        .cloned()
        .collect();
    sort_templates(&mut selected);
    selected
}
