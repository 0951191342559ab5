//! Component rendering.
//!
//! - `layout` - declarative sections, wrapping and pagination
//! - `pdf` - lopdf page writer and page counting
//! - `hybrid` - AcroForm overlay on stored templates
//! - `format` - currency, date and text normalization
//!
//! Rendering runs in two phases. `prepare` does the I/O (loading stored
//! template files) and yields a `RenderJob` tagged by template format; the job
//! is then executed on the blocking pool under the configured deadline.

pub mod format;
pub mod hybrid;
pub mod layout;
pub mod pdf;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{RenderError, StoreError};
use crate::merge::MergeBundle;
use crate::metrics;
use crate::models::{Template, TemplateFormat};
use crate::storage::ArtifactStore;

pub use layout::{LayoutSpec, Section};

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedDocument {
    pub bytes: Vec<u8>,
    pub page_count: i32,
    pub byte_size: i64,
}

impl RenderedDocument {
    fn new(bytes: Vec<u8>, page_count: i32) -> Self {
        let byte_size = bytes.len() as i64;
        Self {
            bytes,
            page_count,
            byte_size,
        }
    }
}

pub enum RenderJob {
    Dynamic {
        spec: LayoutSpec,
        bundle: MergeBundle,
    },
    Static {
        template_code: String,
        bytes: Vec<u8>,
    },
    Hybrid {
        template_code: String,
        bytes: Vec<u8>,
        values: BTreeMap<String, String>,
    },
}

impl RenderJob {
    /// CPU-bound half of a render.
    pub fn run(self) -> Result<RenderedDocument, RenderError> {
        match self {
            Self::Dynamic { spec, bundle } => {
                let pages = layout::compose(&spec, &bundle);
                let page_count = pages.len() as i32;
                let bytes = pdf::write_pages(&pages)?;
                Ok(RenderedDocument::new(bytes, page_count))
            }
            Self::Static {
                template_code,
                bytes,
            } => match pdf::page_count(&bytes) {
                Some(pages) => Ok(RenderedDocument::new(bytes, pages)),
                None => Err(RenderError::MissingTemplateFile { template_code }),
            },
            Self::Hybrid {
                template_code,
                bytes,
                values,
            } => {
                let (filled_bytes, filled) = hybrid::overlay(&bytes, &values)?;
                if filled == 0 {
                    log::debug!("template {} has no matching form fields", template_code);
                }
                let pages = pdf::page_count(&filled_bytes).ok_or_else(|| {
                    RenderError::OverlayFailure(format!(
                        "filled form for {template_code} is not a readable PDF"
                    ))
                })?;
                Ok(RenderedDocument::new(filled_bytes, pages))
            }
        }
    }
}

#[derive(Clone)]
pub struct ComponentRenderer {
    store: Arc<dyn ArtifactStore>,
    timeout: Duration,
}

impl ComponentRenderer {
    pub fn new(store: Arc<dyn ArtifactStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    async fn load_template_file(&self, template: &Template) -> Result<Vec<u8>, RenderError> {
        let missing = || RenderError::MissingTemplateFile {
            template_code: template.code.clone(),
        };
        let key = template.storage_key.as_deref().ok_or_else(missing)?;
        match self.store.get(key).await {
            Ok(bytes) => Ok(bytes),
            Err(StoreError::NotFound(_)) | Err(StoreError::InvalidKey(_)) => Err(missing()),
            Err(e) => {
                log::warn!(
                    "template {} file {} could not be read: {}",
                    template.code,
                    key,
                    e
                );
                Err(missing())
            }
        }
    }

    /// Gather everything the job needs. Components without a template use
    /// the ad-hoc layout.
    pub async fn prepare(
        &self,
        component_name: &str,
        template: Option<&Template>,
        bundle: &MergeBundle,
    ) -> Result<RenderJob, RenderError> {
        let Some(template) = template else {
            return Ok(RenderJob::Dynamic {
                spec: LayoutSpec::ad_hoc(component_name),
                bundle: bundle.clone(),
            });
        };

        match template.format {
            TemplateFormat::Dynamic => Ok(RenderJob::Dynamic {
                spec: LayoutSpec::for_template(template).map_err(RenderError::LayoutFailure)?,
                bundle: bundle.clone(),
            }),
            TemplateFormat::Static => Ok(RenderJob::Static {
                template_code: template.code.clone(),
                bytes: self.load_template_file(template).await?,
            }),
            TemplateFormat::Hybrid => {
                let values = template
                    .merge_fields
                    .iter()
                    .map(|(field, path)| (field.clone(), format::printable(&bundle.text(path))))
                    .collect();
                Ok(RenderJob::Hybrid {
                    template_code: template.code.clone(),
                    bytes: self.load_template_file(template).await?,
                    values,
                })
            }
        }
    }

    /// Render one component under the soft deadline.
    pub async fn render(
        &self,
        component_name: &str,
        template: Option<&Template>,
        bundle: &MergeBundle,
    ) -> Result<RenderedDocument, RenderError> {
        let format = template.map_or(TemplateFormat::Dynamic, |t| t.format);
        self.with_deadline(format, async {
            let job = self.prepare(component_name, template, bundle).await?;
            execute(job).await
        })
        .await
    }

    /// Render an explicit layout, bypassing template lookup.
    pub async fn render_layout(
        &self,
        spec: LayoutSpec,
        bundle: &MergeBundle,
    ) -> Result<RenderedDocument, RenderError> {
        let job = RenderJob::Dynamic {
            spec,
            bundle: bundle.clone(),
        };
        self.with_deadline(TemplateFormat::Dynamic, execute(job)).await
    }

    async fn with_deadline<F>(
        &self,
        format: TemplateFormat,
        work: F,
    ) -> Result<RenderedDocument, RenderError>
    where
        F: std::future::Future<Output = Result<RenderedDocument, RenderError>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(RenderError::Timeout),
        };
        metrics::record_render(format.as_str(), &result, started.elapsed());
        result
    }
}

async fn execute(job: RenderJob) -> Result<RenderedDocument, RenderError> {
    tokio::task::spawn_blocking(move || job.run())
        .await
        .map_err(|e| RenderError::LayoutFailure(format!("render task failed: {e}")))?
}
