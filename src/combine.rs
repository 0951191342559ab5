//! Combining component PDFs into one delivery artifact.
//!
//! The primary path merges documents with lopdf: every source is renumbered
//! into a shared object space, its pages are re-parented under one page tree
//! and inherited page attributes are copied onto each page so dimensions and
//! resources survive. When the primary path is disabled or fails, a one-page
//! cover listing the components is produced instead.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use lopdf::{dictionary, Dictionary, Document, Object, ObjectId};

use crate::error::{CombinerError, EngineError, StoreError};
use crate::metrics;
use crate::models::{ComponentStatus, DocumentComponent};
use crate::render::layout::Composer;
use crate::render::pdf;
use crate::storage::ArtifactStore;

pub const FALLBACK_LABEL: &str = "FALLBACK";
const CHECK_MARK: &str = "4";
const CROSS_MARK: &str = "8";
const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

#[derive(Debug, Clone, PartialEq)]
pub struct CombinedDocument {
    pub bytes: Vec<u8>,
    pub page_count: i32,
    pub degraded: bool,
}

#[derive(Clone)]
pub struct PdfCombiner {
    store: Arc<dyn ArtifactStore>,
    primary_enabled: bool,
    timeout: Duration,
}

impl PdfCombiner {
    pub fn new(store: Arc<dyn ArtifactStore>, primary_enabled: bool, timeout: Duration) -> Self {
        Self {
            store,
            primary_enabled,
            timeout,
        }
    }

    /// Combine the generated components in `sequence_order`. Returns `None`
    /// when there is nothing to combine on the primary path.
    pub async fn combine(
        &self,
        package_number: &str,
        components: &[DocumentComponent],
    ) -> Result<Option<CombinedDocument>, EngineError> {
        let mut ordered: Vec<&DocumentComponent> = components.iter().collect();
        ordered.sort_by_key(|c| c.sequence_order);

        let mut sources = Vec::new();
        let mut available = BTreeMap::new();
        for component in &ordered {
            let bytes = match (&component.status, component.artifact_key.as_deref()) {
                (ComponentStatus::Generated, Some(key)) => match self.store.get(key).await {
                    Ok(bytes) => Some(bytes),
                    Err(StoreError::NotFound(_)) => {
                        log::warn!(
                            "component {} of {} points at missing artifact {}",
                            component.id,
                            package_number,
                            key
                        );
                        None
                    }
                    Err(e) => return Err(e.into()),
                },
                _ => None,
            };
            available.insert(component.id, bytes.is_some());
            if let Some(bytes) = bytes {
                sources.push(bytes);
            }
        }

        if self.primary_enabled {
            if sources.is_empty() {
                log::info!("package {} has no generated components to combine", package_number);
                return Ok(None);
            }
            match self.primary(sources).await {
                Ok(combined) => {
                    metrics::record_combine(false);
                    return Ok(Some(combined));
                }
                Err(e) => log::warn!("combining {} fell back to a cover: {}", package_number, e),
            }
        } else {
            log::info!("primary merge disabled; writing cover for {}", package_number);
        }

        let cover = degraded_cover(package_number, &ordered, &available)?;
        metrics::record_combine(true);
        Ok(Some(cover))
    }

    async fn primary(&self, sources: Vec<Vec<u8>>) -> Result<CombinedDocument, CombinerError> {
        let task = tokio::task::spawn_blocking(move || merge(&sources));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(CombinerError::DegradedFallback(join.to_string())),
            Err(_) => Err(CombinerError::DegradedFallback("timeout".to_string())),
        }
    }
}

fn fallback(err: impl std::fmt::Display) -> CombinerError {
    CombinerError::DegradedFallback(err.to_string())
}

fn type_name(object: &Object) -> Option<&[u8]> {
    object
        .as_dict()
        .ok()
        .and_then(|d| d.get(b"Type").ok())
        .and_then(|t| t.as_name().ok())
}

/// Walk up the page tree until each inheritable key is found.
fn inherited_attributes(doc: &Document, page_id: ObjectId) -> Vec<(Vec<u8>, Object)> {
    let mut found = Vec::new();
    let Ok(page) = doc.get_dictionary(page_id) else {
        return found;
    };
    for key in INHERITABLE {
        if page.has(key) {
            continue;
        }
        let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();
        let mut depth = 0;
        while let Some(id) = parent {
            depth += 1;
            let Ok(node) = doc.get_dictionary(id) else {
                break;
            };
            if let Ok(value) = node.get(key) {
                found.push((key.to_vec(), value.clone()));
                break;
            }
            if depth > 32 {
                break;
            }
            parent = node.get(b"Parent").and_then(Object::as_reference).ok();
        }
    }
    found
}

fn form_fields(doc: &Document) -> Vec<Object> {
    let Some(catalog) = doc
        .trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .ok()
        .and_then(|id| doc.get_dictionary(id).ok())
    else {
        return Vec::new();
    };
    let form = match catalog.get(b"AcroForm") {
        Ok(Object::Reference(id)) => doc.get_dictionary(*id).ok(),
        Ok(Object::Dictionary(dict)) => Some(dict),
        _ => None,
    };
    let fields = form.and_then(|f| f.get(b"Fields").ok());
    let fields = match fields {
        Some(Object::Reference(id)) => doc.get_object(*id).ok(),
        other => other,
    };
    match fields {
        Some(Object::Array(items)) => items.clone(),
        _ => Vec::new(),
    }
}

/// Concatenate whole documents page by page.
pub fn merge(sources: &[Vec<u8>]) -> Result<CombinedDocument, CombinerError> {
    let mut out = Document::with_version("1.5");
    let mut next_id = 1;
    let mut pages: Vec<(ObjectId, Vec<(Vec<u8>, Object)>)> = Vec::new();
    let mut fields = Vec::new();

    for bytes in sources {
        let mut doc = Document::load_mem(bytes).map_err(fallback)?;
        doc.renumber_objects_with(next_id);
        next_id = doc.max_id + 1;

        for page_id in doc.get_pages().into_values() {
            pages.push((page_id, inherited_attributes(&doc, page_id)));
        }
        fields.extend(form_fields(&doc));

        for (id, object) in doc.objects {
            match type_name(&object) {
                Some(b"Catalog") | Some(b"Pages") => continue,
                _ => {
                    out.objects.insert(id, object);
                }
            }
        }
    }

    if pages.is_empty() {
        return Err(fallback("no pages in any source document"));
    }

    let pages_id = (next_id, 0);
    let mut kids = Vec::with_capacity(pages.len());
    for (page_id, inherited) in pages {
        let page = out
            .objects
            .get_mut(&page_id)
            .and_then(|o| o.as_dict_mut().ok())
            .ok_or_else(|| fallback(format!("page object {page_id:?} is missing")))?;
        page.set("Parent", pages_id);
        for (key, value) in inherited {
            page.set(key, value);
        }
        kids.push(Object::Reference(page_id));
    }

    let count = kids.len() as i64;
    out.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );

    let mut catalog = Dictionary::new();
    catalog.set("Type", Object::Name(b"Catalog".to_vec()));
    catalog.set("Pages", pages_id);
    if !fields.is_empty() {
        catalog.set(
            "AcroForm",
            dictionary! {
                "Fields" => fields,
                "NeedAppearances" => true,
            },
        );
    }
    let catalog_id = (next_id + 1, 0);
    out.objects.insert(catalog_id, Object::Dictionary(catalog));
    out.max_id = next_id + 1;
    out.trailer.set("Root", catalog_id);

    let bytes = pdf::save(&mut out).map_err(fallback)?;
    let page_count = pdf::page_count(&bytes)
        .ok_or_else(|| fallback("merged document could not be read back"))?;
    Ok(CombinedDocument {
        bytes,
        page_count,
        degraded: false,
    })
}

/// One-page placeholder listing each component with a check or cross mark.
pub fn degraded_cover(
    package_number: &str,
    components: &[&DocumentComponent],
    available: &BTreeMap<i64, bool>,
) -> Result<CombinedDocument, EngineError> {
    let mut composer = Composer::new(format!("{package_number} {FALLBACK_LABEL}"));
    composer.heading(&format!("{FALLBACK_LABEL}: COMBINED DOCUMENT UNAVAILABLE"), 16);
    composer.rule();
    composer.label_value("Package Number", package_number);
    composer.paragraph(
        "The combined package could not be produced. Components marked with a check \
         are available individually.",
    );
    composer.gap(6);
    for component in components {
        let ok = available.get(&component.id).copied().unwrap_or(false);
        composer.marked_line(
            if ok { CHECK_MARK } else { CROSS_MARK },
            &format!(
                "{}. {} ({})",
                component.sequence_order, component.name, component.status
            ),
        );
    }
    let pages = composer.finish(&format!("{package_number} {FALLBACK_LABEL}"));
    let page_count = pages.len() as i32;
    let bytes = pdf::write_pages(&pages)?;
    Ok(CombinedDocument {
        bytes,
        page_count,
        degraded: true,
    })
}
