//! Merge bundle: the frozen data projection handed to renderers.
//!
//! Decimals are strings with two fractional digits and dates are `YYYY-MM-DD`.
//! Object keys are kept in sorted order (serde_json's default map), so the
//! serialized bundle is stable for identical input.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};

use crate::models::{Endorsement, Insured, PolicyRecord, Template};

#[derive(Debug, Clone, PartialEq)]
pub struct MergeBundle(Value);

pub fn decimal_string(value: Decimal) -> String {
    let mut rounded = value.round_dp(2);
    rounded.rescale(2);
    rounded.to_string()
}

pub fn date_string(value: NaiveDate) -> String {
    value.format("%Y-%m-%d").to_string()
}

fn address_block(insured: &Insured) -> String {
    let mut lines = vec![insured.address_line1.trim().to_string()];
    if let Some(line2) = insured.address_line2.as_deref().map(str::trim) {
        if !line2.is_empty() {
            lines.push(line2.to_string());
        }
    }
    lines.push(format!(
        "{}, {} {}",
        insured.city.trim(),
        insured.state.trim(),
        insured.zip_code.trim()
    ));
    lines.retain(|line| !line.is_empty());
    lines.join("\n")
}

/// Project a policy (and its endorsements so far) into a bundle.
pub fn project(policy: &PolicyRecord, endorsements: &[Endorsement]) -> MergeBundle {
    let coverages: Vec<Value> = policy
        .coverages
        .iter()
        .map(|c| {
            json!({
                "name": c.name,
                "limit": decimal_string(c.limit),
                "deductible": c.deductible.map(decimal_string).unwrap_or_default(),
                "premium": decimal_string(c.premium),
            })
        })
        .collect();

    let endorsement_schedule: Vec<Value> = endorsements
        .iter()
        .map(|e| {
            json!({
                "number": e.number,
                "title": e.title,
                "effective_date": date_string(e.effective_date),
            })
        })
        .collect();

    MergeBundle(json!({
        "policy": {
            "number": policy.number,
            "effective_date": date_string(policy.effective_date),
            "expiration_date": date_string(policy.expiration_date),
            "annual_premium": decimal_string(policy.annual_premium),
            "state_code": policy.state_code,
            "product_code": policy.product_code,
            "status": policy.status,
        },
        "product": {
            "code": policy.product_code,
            "name": policy.application.product_name,
        },
        "insured": {
            "company_name": policy.insured.company_name,
            "dba_name": policy.insured.dba_name.clone().unwrap_or_default(),
            "address": address_block(&policy.insured),
        },
        "quote": {
            "number": policy.quote.number,
            "effective_date": date_string(policy.quote.effective_date),
            "expiration_date": date_string(policy.quote.expiration_date),
            "total_premium": decimal_string(policy.quote.total_premium),
        },
        "application": {
            "company_name": policy.application.company_name,
            "product_name": policy.application.product_name,
        },
        "coverages": coverages,
        "endorsements": endorsement_schedule,
    }))
}

impl MergeBundle {
    /// Rebuild from a persisted `merge_snapshot`.
    pub fn from_snapshot(snapshot: Value) -> Self {
        Self(snapshot)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn to_snapshot(&self) -> Value {
        self.0.clone()
    }

    /// A copy with the `template` slot filled and, when given, a `custom` map.
    pub fn for_component(&self, template: Option<&Template>, custom: Option<&Value>) -> Self {
        let mut root = match &self.0 {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        if let Some(template) = template {
            root.insert(
                "template".to_string(),
                json!({
                    "name": template.name,
                    "code": template.code,
                    "type": template.template_type.as_str(),
                }),
            );
        }
        if let Some(custom) = custom.filter(|c| !c.is_null()) {
            root.insert("custom".to_string(), custom.clone());
        }
        Self(Value::Object(root))
    }

    /// A copy with one top-level key replaced.
    pub fn with_slot(&self, key: &str, value: Value) -> Self {
        let mut root = match &self.0 {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        root.insert(key.to_string(), value);
        Self(Value::Object(root))
    }

    /// Dotted path lookup, e.g. `policy.number` or `coverages.0.name`.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(&self.0, |node, segment| match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    /// Text form of a value; missing paths and nulls become empty strings.
    pub fn text(&self, path: &str) -> String {
        match self.lookup(path) {
            Some(value) => value_text(value),
            None => String::new(),
        }
    }
}

pub fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => if *b { "Yes" } else { "No" }.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}
