//! Billing error types

use crate::sku::SkuCategory;

/// Result alias used across the billing crate
pub type BillingResult<T> = Result<T, BillingError>;

/// Errors raised while reconciling billing events.
///
/// Every variant renders a complete human-readable message, so callers that
/// alert on failures only ever need `to_string()`.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// The payload could not be classified as any provider notification
    #[error("Malformed webhook event: {0}")]
    MalformedEvent(String),

    /// A reconciliation step failed in a way that has already been alerted
    #[error("Webhook failed to complete: {message}")]
    WebhookFailedToComplete { message: String },

    /// A subscription or add-on SKU has no catalog mapping
    #[error("No {category} mapping for SKU '{sku}'")]
    UnmappedSku { category: SkuCategory, sku: String },

    /// Programmer or deployment error (missing adapter method, uninitialized resolver)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Billing provider answered with an unexpected status
    #[error("Billing provider API error ({status}): {message}")]
    ProviderApi { status: u16, message: String },

    /// Third-party integration call failed
    #[error("External integration error: {0}")]
    Integration(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn failed_to_complete(message: impl Into<String>) -> Self {
        BillingError::WebhookFailedToComplete {
            message: message.into(),
        }
    }

    /// Whether the error was already alerted at the point it was raised
    pub fn is_failed_to_complete(&self) -> bool {
        matches!(self, BillingError::WebhookFailedToComplete { .. })
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        BillingError::Http(e.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::MalformedEvent(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_to_complete_is_recognized() {
        let err = BillingError::failed_to_complete("user 42 not found");
        assert!(err.is_failed_to_complete());
        assert_eq!(err.to_string(), "Webhook failed to complete: user 42 not found");

        let other = BillingError::Database("connection reset".to_string());
        assert!(!other.is_failed_to_complete());
    }

    #[test]
    fn test_unmapped_sku_message_names_category() {
        let err = BillingError::UnmappedSku {
            category: SkuCategory::AddOn,
            sku: "extra_seat".to_string(),
        };
        assert_eq!(err.to_string(), "No add-on mapping for SKU 'extra_seat'");
    }
}
