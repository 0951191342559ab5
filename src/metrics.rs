//! Prometheus metrics, registered in the default registry and served at `/metrics`.

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

use crate::error::RenderError;

lazy_static! {
    static ref RENDERS: IntCounterVec = register_int_counter_vec!(
        "pdae_renders_total",
        "Component renders by template format and outcome",
        &["format", "outcome"]
    )
    .expect("render counter registers");
    static ref RENDER_SECONDS: HistogramVec = register_histogram_vec!(
        "pdae_render_duration_seconds",
        "Time spent rendering one component",
        &["format"],
        vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("render histogram registers");
    static ref PACKAGES_CREATED: IntCounter = register_int_counter!(
        "pdae_packages_created_total",
        "Document packages created, including reissues"
    )
    .expect("package counter registers");
    static ref COMBINES: IntCounterVec = register_int_counter_vec!(
        "pdae_combines_total",
        "Combined package artifacts by merge path",
        &["path"]
    )
    .expect("combine counter registers");
    static ref ENDORSEMENTS_CREATED: IntCounter = register_int_counter!(
        "pdae_endorsements_created_total",
        "Endorsement documents created"
    )
    .expect("endorsement counter registers");
}

pub fn record_render<T>(format: &str, result: &Result<T, RenderError>, elapsed: Duration) {
    let outcome = match result {
        Ok(_) => "generated",
        Err(e) => e.kind(),
    };
    RENDERS.with_label_values(&[format, outcome]).inc();
    RENDER_SECONDS
        .with_label_values(&[format])
        .observe(elapsed.as_secs_f64());
}

pub fn record_package_created() {
    PACKAGES_CREATED.inc();
}

pub fn record_combine(degraded: bool) {
    let path = if degraded { "degraded" } else { "primary" };
    COMBINES.with_label_values(&[path]).inc();
}

pub fn record_endorsement_created() {
    ENDORSEMENTS_CREATED.inc();
}

/// Text exposition of every registered metric.
pub fn gather_text() -> Result<String, String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}
