//! AcroForm overlay for hybrid templates.

use std::collections::BTreeMap;

use lopdf::{Dictionary, Document, Object, ObjectId, StringFormat};

use super::{format, pdf};
use crate::error::RenderError;

fn overlay_error(err: impl std::fmt::Display) -> RenderError {
    RenderError::OverlayFailure(err.to_string())
}

fn resolve<'a>(doc: &'a Document, object: &'a Object) -> Option<&'a Object> {
    match object {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

fn field_name(dict: &Dictionary) -> Option<String> {
    dict.get(b"T")
        .ok()
        .and_then(|t| t.as_str().ok())
        .map(|raw| String::from_utf8_lossy(raw).into_owned())
}

/// Where the form dictionary lives: inline in the catalog or as its own object.
enum AcroFormLocation {
    Inline(ObjectId),
    Object(ObjectId),
}

fn acroform(doc: &Document) -> Option<(AcroFormLocation, &Dictionary)> {
    let root_id = doc.trailer.get(b"Root").ok()?.as_reference().ok()?;
    let catalog = doc.get_dictionary(root_id).ok()?;
    match catalog.get(b"AcroForm").ok()? {
        Object::Reference(id) => doc
            .get_dictionary(*id)
            .ok()
            .map(|dict| (AcroFormLocation::Object(*id), dict)),
        Object::Dictionary(dict) => Some((AcroFormLocation::Inline(root_id), dict)),
        _ => None,
    }
}

/// Terminal and intermediate fields with their fully qualified names.
fn collect_fields(doc: &Document, form: &Dictionary) -> Vec<(ObjectId, String, String)> {
    let mut found = Vec::new();
    let Some(Object::Array(roots)) = form.get(b"Fields").ok().and_then(|f| resolve(doc, f)) else {
        return found;
    };

    let mut stack: Vec<(ObjectId, String)> = roots
        .iter()
        .rev()
        .filter_map(|o| o.as_reference().ok())
        .map(|id| (id, String::new()))
        .collect();

    while let Some((id, parent)) = stack.pop() {
        let Ok(dict) = doc.get_dictionary(id) else {
            continue;
        };
        let partial = field_name(dict);
        let full = match (&partial, parent.is_empty()) {
            (Some(name), true) => name.clone(),
            (Some(name), false) => format!("{parent}.{name}"),
            (None, _) => parent.clone(),
        };
        if let Some(name) = partial {
            found.push((id, full.clone(), name));
        }
        if let Some(Object::Array(kids)) = dict.get(b"Kids").ok().and_then(|k| resolve(doc, k)) {
            for kid in kids.iter().rev().filter_map(|o| o.as_reference().ok()) {
                stack.push((kid, full.clone()));
            }
        }
    }
    found
}

/// Fill named form fields. Fields absent from the PDF are skipped; if none
/// match, the template bytes are returned unchanged.
pub fn overlay(
    template_bytes: &[u8],
    values: &BTreeMap<String, String>,
) -> Result<(Vec<u8>, usize), RenderError> {
    let mut doc = Document::load_mem(template_bytes).map_err(overlay_error)?;

    let (location, fields) = match acroform(&doc) {
        Some((location, form)) => {
            let fields = collect_fields(&doc, form);
            (location, fields)
        }
        None => return Ok((template_bytes.to_vec(), 0)),
    };

    let mut filled = 0;
    for (id, full_name, partial_name) in fields {
        let value = values.get(&full_name).or_else(|| values.get(&partial_name));
        let Some(value) = value else {
            continue;
        };
        let dict = doc
            .get_object_mut(id)
            .and_then(Object::as_dict_mut)
            .map_err(overlay_error)?;
        dict.set(
            "V",
            Object::String(format::win_ansi(value), StringFormat::Literal),
        );
        filled += 1;
    }

    if filled == 0 {
        return Ok((template_bytes.to_vec(), 0));
    }

    let form = match location {
        AcroFormLocation::Object(id) => doc.get_object_mut(id).and_then(Object::as_dict_mut),
        AcroFormLocation::Inline(root_id) => doc
            .get_object_mut(root_id)
            .and_then(Object::as_dict_mut)
            .and_then(|catalog| catalog.get_mut(b"AcroForm"))
            .and_then(Object::as_dict_mut),
    }
    .map_err(overlay_error)?;
    form.set("NeedAppearances", true);

    let bytes = pdf::save(&mut doc)
        .map_err(|e| RenderError::OverlayFailure(e.to_string()))?;
    Ok((bytes, filled))
}
