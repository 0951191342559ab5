//! Hand-off of finished packages to an outbound channel.
//!
//! Mail transport lives outside the engine. The shipped channel only logs
//! the hand-off; deployments plug in their own `DeliveryChannel`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DeliveryRequest {
    pub package_id: i64,
    pub package_number: String,
    pub policy_number: String,
    pub recipients: Vec<String>,
    /// The combined artifact when there is one, otherwise each generated component.
    pub artifact_urls: Vec<String>,
    pub combined: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DeliveryReceipt {
    pub channel: String,
    pub package_number: String,
    pub recipients: Vec<String>,
    pub artifact_urls: Vec<String>,
    pub delivered_at: DateTime<Utc>,
}

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, request: &DeliveryRequest) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDeliveryChannel;

#[async_trait]
impl DeliveryChannel for LoggingDeliveryChannel {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, request: &DeliveryRequest) -> Result<(), EngineError> {
        log::info!(
            "delivering {} ({} artifact(s)) to {}",
            request.package_number,
            request.artifact_urls.len(),
            request.recipients.join(", ")
        );
        Ok(())
    }
}

/// Trim, drop blanks and reject anything that is not an address.
pub fn normalize_recipients(recipients: &[String]) -> Result<Vec<String>, EngineError> {
    let cleaned: Vec<String> = recipients
        .iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect();
    if cleaned.is_empty() {
        return Err(EngineError::validation("at least one recipient is required"));
    }
    if let Some(bad) = cleaned.iter().find(|r| {
        let mut parts = r.splitn(2, '@');
        let local = parts.next().unwrap_or_default();
        let domain = parts.next().unwrap_or_default();
        local.is_empty() || !domain.contains('.') || domain.starts_with('.')
    }) {
        return Err(EngineError::validation(format!(
            "{bad:?} is not a valid email address"
        )));
    }
    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipients_are_cleaned_and_checked() {
        let ok = normalize_recipients(&[" agent@example.com ".to_string(), String::new()]).unwrap();
        assert_eq!(ok, vec!["agent@example.com".to_string()]);

        assert!(normalize_recipients(&[]).is_err());
        assert!(normalize_recipients(&["nobody".to_string()]).is_err());
        assert!(normalize_recipients(&["a@localhost".to_string()]).is_err());
    }
}
