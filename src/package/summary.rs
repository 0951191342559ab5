//! Results returned by package operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::{
    ComponentStatus, DocumentComponent, DocumentPackage, PackageStatus, Template, TemplateFormat,
    TemplateType,
};
use crate::storage::ArtifactStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ComponentSummary {
    pub id: i64,
    pub package_id: i64,
    pub template_id: Option<i64>,
    pub sequence_order: i32,
    pub component_type: TemplateType,
    pub name: String,
    pub status: ComponentStatus,
    pub artifact_key: Option<String>,
    pub artifact_url: Option<String>,
    pub page_count: i32,
    pub byte_size: i64,
    pub error_message: Option<String>,
    pub generated_at: Option<DateTime<Utc>>,
}

impl ComponentSummary {
    pub fn new(component: &DocumentComponent, store: &dyn ArtifactStore) -> Self {
        let artifact_url = match component.status {
            ComponentStatus::Generated => component.artifact_key.as_deref().map(|k| store.url(k)),
            _ => None,
        };
        Self {
            id: component.id,
            package_id: component.package_id,
            template_id: component.template_id,
            sequence_order: component.sequence_order,
            component_type: component.component_type,
            name: component.name.clone(),
            status: component.status,
            artifact_key: component.artifact_key.clone(),
            artifact_url,
            page_count: component.page_count,
            byte_size: component.byte_size,
            error_message: component.error_message.clone(),
            generated_at: component.generated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PackageSummary {
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
    pub components: Vec<ComponentSummary>,
}

impl PackageSummary {
    pub fn new(
        package: &DocumentPackage,
        components: &[DocumentComponent],
        store: &dyn ArtifactStore,
    ) -> Self {
        Self {
            id: package.id,
            policy_id: package.policy_id,
            number: package.number.clone(),
            version: package.version,
            status: package.status,
            is_current: package.is_current,
            generated_date: package.generated_date,
            issued_date: package.issued_date,
            combined_artifact_key: package.combined_artifact_key.clone(),
            total_pages: package.total_pages,
            byte_size: package.byte_size,
            state_code: package.state_code.clone(),
            components: components
                .iter()
                .map(|c| ComponentSummary::new(c, store))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CreatePackageResult {
    /// False when the existing current package was returned instead.
    pub created: bool,
    pub package: PackageSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ComponentResult {
    pub component_id: i64,
    pub name: String,
    pub status: ComponentStatus,
    pub error_message: Option<String>,
}

impl From<&DocumentComponent> for ComponentResult {
    fn from(component: &DocumentComponent) -> Self {
        Self {
            component_id: component.id,
            name: component.name.clone(),
            status: component.status,
            error_message: component.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GenerateMissingSummary {
    pub package_id: i64,
    pub package_status: PackageStatus,
    pub generated_count: usize,
    pub total_count: usize,
    pub results: Vec<ComponentResult>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BulkMode {
    /// Render pending and errored components of the current package.
    #[default]
    Missing,
    /// Create a fresh package version.
    All,
    /// Re-render every component of the current package.
    Regenerate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BulkResult {
    pub policy_id: i64,
    pub success: bool,
    pub package_number: Option<String>,
    pub package_status: Option<PackageStatus>,
    pub generated_count: usize,
    pub total_count: usize,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AvailableTemplate {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub template_type: TemplateType,
    pub format: TemplateFormat,
    pub version: String,
    pub default_sequence: i32,
    pub applicable_states: Vec<String>,
    pub state_mandatory: bool,
    /// Components in the current package already built from this template.
    pub usage_count: i64,
}

impl AvailableTemplate {
    pub fn new(template: &Template, usage_count: i64) -> Self {
        Self {
            id: template.id,
            code: template.code.clone(),
            name: template.name.clone(),
            template_type: template.template_type,
            format: template.format,
            version: template.version.clone(),
            default_sequence: template.default_sequence,
            applicable_states: template.applicable_states.clone(),
            state_mandatory: template.state_mandatory,
            usage_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CombineResult {
    pub package_id: i64,
    pub package_number: String,
    pub artifact_key: Option<String>,
    pub artifact_url: Option<String>,
    pub degraded: bool,
    pub page_count: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StatusReport {
    pub policy_id: i64,
    pub policy_number: String,
    pub package: Option<PackageSummary>,
}
