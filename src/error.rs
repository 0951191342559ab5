//! Error kinds surfaced by the engine.
//!
//! Every error carries a stable machine-readable `kind()` and a human message.
//! Messages never include filesystem paths; storage keys are logical names.

use thiserror::Error;

/// Failures while producing the bytes of a single component.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RenderError {
    #[error("template {template_code} has no usable stored file")]
    MissingTemplateFile { template_code: String },
    #[error("form overlay failed: {0}")]
    OverlayFailure(String),
    #[error("layout failed: {0}")]
    LayoutFailure(String),
    #[error("timeout")]
    Timeout,
}

impl RenderError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingTemplateFile { .. } => "missing_template_file",
            Self::OverlayFailure(_) => "overlay_failure",
            Self::LayoutFailure(_) => "layout_failure",
            Self::Timeout => "timeout",
        }
    }

    /// Text stored in `DocumentComponent.error_message`.
    pub fn component_message(&self) -> String {
        match self {
            Self::Timeout => "timeout".to_string(),
            other => format!("{}: {}", other.kind(), other),
        }
    }
}

impl From<lopdf::Error> for RenderError {
    fn from(err: lopdf::Error) -> Self {
        Self::LayoutFailure(err.to_string())
    }
}

/// Artifact store failures. Never recovered locally.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact {0} not found")]
    NotFound(String),
    #[error("artifact {0} already exists")]
    AlreadyExists(String),
    #[error("invalid artifact key {0:?}")]
    InvalidKey(String),
    #[error("i/o failure on artifact {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Combine failures. The combiner always recovers these by emitting a cover.
#[derive(Debug, Error)]
pub enum CombinerError {
    #[error("degraded fallback: {0}")]
    DegradedFallback(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("sequence exhausted for product {0}")]
    SequenceExhausted(String),
    #[error("unknown product code {0}")]
    ProductUnknown(String),
    #[error("no templates apply to policy {policy_number}: {reason}")]
    TemplateApplicability {
        policy_number: String,
        reason: String,
    },
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Combiner(#[from] CombinerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("concurrent modification: {0}")]
    Concurrency(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0} did not finish before its deadline")]
    Timeout(String),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::NotFound(_) => "validation_error",
            Self::SequenceExhausted(_) => "sequence_exhausted",
            Self::ProductUnknown(_) => "product_unknown",
            Self::TemplateApplicability { .. } => "template_applicability_error",
            Self::Render(_) => "render_error",
            Self::Combiner(_) => "combiner_error",
            Self::Store(_) | Self::Database(_) => "store_error",
            Self::Concurrency(_) => "concurrency",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Message safe to show to callers. Store and database details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::Store(StoreError::Io { key, .. }) => {
                format!("artifact {key} could not be read or written")
            }
            Self::Database(_) => "the document store is temporarily unavailable".to_string(),
            other => other.to_string(),
        }
    }

    /// Transient failures are worth one retry by the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Database(_) | Self::Concurrency(_) | Self::Timeout(_)
        )
    }
}
