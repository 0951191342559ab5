//! JSON template manifests and stored-file verification.
//!
//! ```json
//! { "templates": [ { "code": "WCP-DEC", "name": "Declarations", "template_type": "declaration",
//!                    "format": "dynamic", "product_code": "WCP", "effective_date": "2024-01-01",
//!                    "default_sequence": 10 } ] }
//! ```
//!
//! Static and hybrid entries may name a `file` relative to the files directory;
//! it is copied into the `templates/` bucket unless a `storage_key` is given.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::db::Repository;
use crate::error::{EngineError, StoreError};
use crate::models::{NewTemplate, TemplateFormat};
use crate::storage::{template_key, ArtifactStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(flatten)]
    pub template: NewTemplate,
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub templates: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        serde_json::from_str(text)
            .map_err(|e| EngineError::validation(format!("invalid template manifest: {e}")))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct LoadReport {
    pub created: Vec<String>,
    pub existing: Vec<String>,
    pub files_copied: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingFile {
    pub template_code: String,
    pub storage_key: Option<String>,
}

/// Get-or-create every manifest entry by code. Existing templates are left untouched.
pub async fn load_manifest(
    repo: &dyn Repository,
    store: &dyn ArtifactStore,
    manifest: Manifest,
    files_dir: Option<&Path>,
) -> Result<LoadReport, EngineError> {
    let mut report = LoadReport::default();

    for entry in manifest.templates {
        let mut template = entry.template;
        if template.code.trim().is_empty() {
            return Err(EngineError::validation("template code must not be empty"));
        }

        if repo.get_template_by_code(&template.code).await?.is_some() {
            log::info!("template {} already exists; skipping", template.code);
            report.existing.push(template.code);
            continue;
        }

        if let (Some(file), None) = (entry.file.as_deref(), template.storage_key.as_ref()) {
            let dir = files_dir.ok_or_else(|| {
                EngineError::validation(format!(
                    "template {} names a file but no files directory was given",
                    template.code
                ))
            })?;
            let bytes = tokio::fs::read(dir.join(file)).await.map_err(|e| {
                log::error!("cannot read template file {} for {}: {}", file, template.code, e);
                EngineError::validation(format!(
                    "template file {file} for {} could not be read",
                    template.code
                ))
            })?;

            let key = template_key(&template.code, file);
            match store.put(&key, &bytes).await {
                Ok(()) => report.files_copied += 1,
                Err(StoreError::AlreadyExists(_)) => {
                    log::warn!("template file {} already stored; reusing it", key)
                }
                Err(e) => return Err(e.into()),
            }
            template.storage_key = Some(key);
        }

        if template.format != TemplateFormat::Dynamic && template.storage_key.is_none() {
            log::warn!(
                "{} template {} has no stored file; it will render as missing_template_file",
                template.format,
                template.code
            );
        }

        let (stored, created) = repo.insert_template_if_absent(template).await?;
        if created {
            log::info!("created template {} ({})", stored.code, stored.template_type);
            report.created.push(stored.code);
        } else {
            report.existing.push(stored.code);
        }
    }

    Ok(report)
}

/// Static and hybrid templates whose stored file is missing.
pub async fn verify_template_files(
    repo: &dyn Repository,
    store: &dyn ArtifactStore,
) -> Result<Vec<MissingFile>, EngineError> {
    let mut missing = Vec::new();
    for template in repo.list_templates().await? {
        if template.format == TemplateFormat::Dynamic {
            continue;
        }
        let present = match template.storage_key.as_deref() {
            Some(key) => store.exists(key).await.unwrap_or_else(|e| {
                log::warn!("cannot check {} for template {}: {}", key, template.code, e);
                false
            }),
            None => false,
        };
        if !present {
            missing.push(MissingFile {
                template_code: template.code,
                storage_key: template.storage_key,
            });
        }
    }
    Ok(missing)
}
