//! Standalone endorsement documents numbered from the parent policy's base.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;

use crate::db::Repository;
use crate::error::{EngineError, RenderError};
use crate::identifiers::IdentifierAllocator;
use crate::merge::{self, date_string};
use crate::metrics;
use crate::models::{Endorsement, NewEndorsement, PolicyRecord, Template, TemplateType};
use crate::render::{ComponentRenderer, LayoutSpec};
use crate::storage::{self, ArtifactStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EndorsementSummary {
    pub id: i64,
    pub policy_id: i64,
    pub template_id: i64,
    pub number: String,
    pub sequence: i32,
    pub title: String,
    pub effective_date: NaiveDate,
    pub artifact_key: String,
    pub artifact_url: String,
    pub created_at: DateTime<Utc>,
}

impl EndorsementSummary {
    pub fn new(endorsement: &Endorsement, store: &dyn ArtifactStore) -> Self {
        Self {
            id: endorsement.id,
            policy_id: endorsement.policy_id,
            template_id: endorsement.template_id,
            number: endorsement.number.clone(),
            sequence: endorsement.sequence,
            title: endorsement.title.clone(),
            effective_date: endorsement.effective_date,
            artifact_key: endorsement.artifact_key.clone(),
            artifact_url: store.url(&endorsement.artifact_key),
            created_at: endorsement.created_at,
        }
    }
}

#[derive(Clone)]
pub struct EndorsementEngine {
    repo: Arc<dyn Repository>,
    store: Arc<dyn ArtifactStore>,
    allocator: IdentifierAllocator,
    renderer: ComponentRenderer,
}

impl EndorsementEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        store: Arc<dyn ArtifactStore>,
        allocator: IdentifierAllocator,
        renderer: ComponentRenderer,
    ) -> Self {
        Self {
            repo,
            store,
            allocator,
            renderer,
        }
    }

    async fn endorsement_template(
        &self,
        policy: &PolicyRecord,
        template_code: &str,
    ) -> Result<Template, EngineError> {
        let template = self
            .repo
            .get_template_by_code(template_code.trim())
            .await?
            .ok_or_else(|| EngineError::not_found(format!("template {template_code}")))?;
        if template.template_type != TemplateType::Endorsement {
            return Err(EngineError::validation(format!(
                "template {} is a {} template, not an endorsement",
                template.code, template.template_type
            )));
        }
        if !template.active || !template.is_for_product(&policy.product_code) {
            return Err(EngineError::validation(format!(
                "endorsement {} is not available for product {}",
                template.code, policy.product_code
            )));
        }
        Ok(template)
    }

    /// Render and record the next endorsement for the policy. A lost race for
    /// the sequence number is retried once with a fresh number.
    pub async fn create_endorsement(
        &self,
        policy_id: i64,
        template_code: &str,
        data: Value,
        effective_date: Option<NaiveDate>,
    ) -> Result<EndorsementSummary, EngineError> {
        let policy = self
            .repo
            .get_policy(policy_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("policy {policy_id}")))?;
        let template = self.endorsement_template(&policy, template_code).await?;
        let data = match data {
            Value::Null => json!({}),
            Value::Object(map) => Value::Object(map),
            _ => return Err(EngineError::validation("endorsement data must be a JSON object")),
        };
        let effective_date = effective_date.unwrap_or_else(|| Utc::now().date_naive());
        let layout = LayoutSpec::for_template(&template)
            .map_err(|e| EngineError::Render(RenderError::LayoutFailure(e)))?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .attempt(&policy, &template, &layout, &data, effective_date)
                .await
            {
                Err(EngineError::Concurrency(reason)) if attempt == 1 => {
                    log::warn!(
                        "endorsement sequence for {} was taken ({}); retrying",
                        policy.number,
                        reason
                    );
                }
                Err(e) => return Err(e),
                Ok(endorsement) => {
                    metrics::record_endorsement_created();
                    log::info!(
                        "created endorsement {} ({}) for {}",
                        endorsement.number,
                        endorsement.title,
                        policy.number
                    );
                    return Ok(EndorsementSummary::new(&endorsement, self.store.as_ref()));
                }
            }
        }
    }

    async fn attempt(
        &self,
        policy: &PolicyRecord,
        template: &Template,
        layout: &LayoutSpec,
        data: &Value,
        effective_date: NaiveDate,
    ) -> Result<Endorsement, EngineError> {
        let (sequence, number) = self.allocator.next_endorsement(policy).await?;

        let existing = self.repo.list_endorsements(policy.id).await?;
        let bundle = merge::project(policy, &existing)
            .for_component(Some(template), Some(data))
            .with_slot(
                "endorsement",
                json!({
                    "number": number,
                    "sequence": sequence,
                    "effective_date": date_string(effective_date),
                    "title": template.name,
                }),
            );

        let rendered = self.renderer.render_layout(layout.clone(), &bundle).await?;
        let key = storage::endorsement_key(&number);
        self.store.put(&key, &rendered.bytes).await?;

        let inserted = self
            .repo
            .insert_endorsement(NewEndorsement {
                policy_id: policy.id,
                template_id: template.id,
                number,
                sequence,
                title: template.name.clone(),
                effective_date,
                artifact_key: key.clone(),
                merge_inputs: data.clone(),
            })
            .await;
        if inserted.is_err() {
            if let Err(e) = self.store.delete(&key).await {
                log::error!("could not remove unrecorded endorsement artifact {}: {}", key, e);
            }
        }
        inserted
    }

    pub async fn list_endorsements(
        &self,
        policy_id: i64,
    ) -> Result<Vec<EndorsementSummary>, EngineError> {
        if self.repo.get_policy(policy_id).await?.is_none() {
            return Err(EngineError::not_found(format!("policy {policy_id}")));
        }
        Ok(self
            .repo
            .list_endorsements(policy_id)
            .await?
            .iter()
            .map(|e| EndorsementSummary::new(e, self.store.as_ref()))
            .collect())
    }
}
