//! Webhook engine contract
//!
//! A `BillingProvider` turns raw notification bytes into a `WebhookEngine`
//! bound to that one event. The engine knows which provider object the
//! event refers to and normalizes it into domain objects on demand.

use async_trait::async_trait;

use crate::error::{BillingError, BillingResult};
use crate::invoice::Invoice;
use crate::subscription::Subscription;

/// Provider notification categories the reconciler understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    InvoicePaid,
    SubscriptionCreated,
    SubscriptionRenewed,
    SubscriptionCancelled,
    SubscriptionExpired,
    SubscriptionUpdated,
    AccountReactivated,
    /// Well-formed notification the reconciler ignores
    Other(String),
}

impl EventKind {
    pub fn is_invoice_event(&self) -> bool {
        matches!(self, EventKind::InvoicePaid)
    }

    pub fn is_subscription_event(&self) -> bool {
        matches!(
            self,
            EventKind::SubscriptionCreated
                | EventKind::SubscriptionRenewed
                | EventKind::SubscriptionCancelled
                | EventKind::SubscriptionExpired
                | EventKind::SubscriptionUpdated
                | EventKind::AccountReactivated
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::InvoicePaid => "invoice_paid",
            EventKind::SubscriptionCreated => "subscription_created",
            EventKind::SubscriptionRenewed => "subscription_renewed",
            EventKind::SubscriptionCancelled => "subscription_cancelled",
            EventKind::SubscriptionExpired => "subscription_expired",
            EventKind::SubscriptionUpdated => "subscription_updated",
            EventKind::AccountReactivated => "account_reactivated",
            EventKind::Other(kind) => kind,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn unsupported(operation: &str) -> BillingError {
    BillingError::Configuration(format!(
        "{} is not implemented by this provider adapter",
        operation
    ))
}

/// One classified notification and the provider object behind it.
///
/// Fetches are memoized per instance: the orchestrator may ask for the
/// invoice or subscription more than once while reconciling.
#[async_trait]
pub trait WebhookEngine: Send + Sync {
    fn event_kind(&self) -> &EventKind;

    /// Provider id of the invoice or subscription the event refers to
    fn external_id(&self) -> Option<&str>;

    async fn fetch_invoice(&self) -> BillingResult<Invoice> {
        Err(unsupported("fetch_invoice"))
    }

    async fn fetch_subscription(&self) -> BillingResult<Subscription> {
        Err(unsupported("fetch_subscription"))
    }
}

/// Entry point for one billing provider's notifications
pub trait BillingProvider: Send + Sync {
    fn classify(&self, raw: &[u8]) -> BillingResult<EventKind>;

    fn engine_for(&self, raw: &[u8]) -> BillingResult<Box<dyn WebhookEngine>>;
}
