//! Notification classification and the provider-backed webhook engine

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::OnceCell;

use super::client::ProviderApi;
use crate::engine::{BillingProvider, EventKind, WebhookEngine};
use crate::error::{BillingError, BillingResult};
use crate::invoice::Invoice;
use crate::subscription::Subscription;

fn kind_from_name(name: &str) -> EventKind {
    match name {
        "paid_charge_invoice_notification" => EventKind::InvoicePaid,
        "new_subscription_notification" => EventKind::SubscriptionCreated,
        "renewed_subscription_notification" => EventKind::SubscriptionRenewed,
        "canceled_subscription_notification" => EventKind::SubscriptionCancelled,
        "expired_subscription_notification" => EventKind::SubscriptionExpired,
        "updated_subscription_notification" => EventKind::SubscriptionUpdated,
        "reactivated_account_notification" => EventKind::AccountReactivated,
        other => EventKind::Other(other.to_string()),
    }
}

/// A parsed notification envelope
#[derive(Debug, Clone)]
struct Notification {
    kind: EventKind,
    body: Value,
}

impl Notification {
    /// Accepts `{"type": kind, ...}` and the wrapped `{"<kind>": {...}}` form
    fn parse(raw: &[u8]) -> BillingResult<Self> {
        let value: Value = serde_json::from_slice(raw)?;
        let Value::Object(map) = value else {
            return Err(BillingError::MalformedEvent(
                "notification is not a JSON object".to_string(),
            ));
        };

        if let Some(Value::String(kind)) = map.get("type") {
            let kind = kind_from_name(kind);
            return Ok(Self {
                kind,
                body: Value::Object(map),
            });
        }

        if map.len() == 1 {
            if let Some((name, body @ Value::Object(_))) = map.into_iter().next() {
                return Ok(Self {
                    kind: kind_from_name(&name),
                    body,
                });
            }
        }

        Err(BillingError::MalformedEvent(
            "notification carries no event kind".to_string(),
        ))
    }

    fn object_id(&self, object: &str) -> Option<String> {
        let inner = self.body.get(object)?;
        inner
            .get("id")
            .or_else(|| inner.get("uuid"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }

    fn external_id(&self) -> Option<String> {
        if self.kind.is_invoice_event() {
            self.object_id("invoice")
        } else if self.kind.is_subscription_event() {
            self.object_id("subscription")
        } else {
            None
        }
    }
}

/// Engine that resolves the referenced object through the provider API
pub struct ProviderWebhookEngine {
    kind: EventKind,
    external_id: Option<String>,
    api: Arc<dyn ProviderApi>,
    invoice: OnceCell<Invoice>,
    subscription: OnceCell<Subscription>,
}

impl ProviderWebhookEngine {
    fn new(notification: Notification, api: Arc<dyn ProviderApi>) -> Self {
        Self {
            external_id: notification.external_id(),
            kind: notification.kind,
            api,
            invoice: OnceCell::new(),
            subscription: OnceCell::new(),
        }
    }

    fn require_id(&self, object: &str) -> BillingResult<&str> {
        self.external_id.as_deref().ok_or_else(|| {
            BillingError::MalformedEvent(format!(
                "{} notification carries no {} id",
                self.kind, object
            ))
        })
    }
}

#[async_trait]
impl WebhookEngine for ProviderWebhookEngine {
    fn event_kind(&self) -> &EventKind {
        &self.kind
    }

    fn external_id(&self) -> Option<&str> {
        self.external_id.as_deref()
    }

    async fn fetch_invoice(&self) -> BillingResult<Invoice> {
        if !self.kind.is_invoice_event() {
            return Err(BillingError::Configuration(format!(
                "{} does not reference an invoice",
                self.kind
            )));
        }
        let id = self.require_id("invoice")?;
        let invoice = self
            .invoice
            .get_or_try_init(|| async {
                let wire = self.api.get_invoice(id).await?;
                Invoice::try_from(wire)
            })
            .await?;
        Ok(invoice.clone())
    }

    async fn fetch_subscription(&self) -> BillingResult<Subscription> {
        if !self.kind.is_subscription_event() {
            return Err(BillingError::Configuration(format!(
                "{} does not reference a subscription",
                self.kind
            )));
        }
        let id = self.require_id("subscription")?;
        let subscription = self
            .subscription
            .get_or_try_init(|| async {
                let wire = self.api.get_subscription(id).await?;
                Subscription::try_from(wire)
            })
            .await?;
        Ok(subscription.clone())
    }
}

/// `BillingProvider` for the provider-neutral JSON envelope
#[derive(Clone)]
pub struct ProviderAdapter {
    api: Arc<dyn ProviderApi>,
}

impl ProviderAdapter {
    pub fn new(api: Arc<dyn ProviderApi>) -> Self {
        Self { api }
    }
}

impl BillingProvider for ProviderAdapter {
    fn classify(&self, raw: &[u8]) -> BillingResult<EventKind> {
        Ok(Notification::parse(raw)?.kind)
    }

    fn engine_for(&self, raw: &[u8]) -> BillingResult<Box<dyn WebhookEngine>> {
        let notification = Notification::parse(raw)?;
        Ok(Box::new(ProviderWebhookEngine::new(
            notification,
            self.api.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubProviderApi;

    fn adapter(api: Arc<StubProviderApi>) -> ProviderAdapter {
        ProviderAdapter::new(api)
    }

    #[test]
    fn test_classify_both_envelope_forms() {
        let adapter = adapter(Arc::new(StubProviderApi::default()));

        let typed = br#"{"type":"paid_charge_invoice_notification","invoice":{"id":"inv_1"}}"#;
        assert_eq!(adapter.classify(typed).unwrap(), EventKind::InvoicePaid);

        let wrapped = br#"{"expired_subscription_notification":{"subscription":{"uuid":"sub_9"}}}"#;
        assert_eq!(adapter.classify(wrapped).unwrap(), EventKind::SubscriptionExpired);
        let engine = adapter.engine_for(wrapped).unwrap();
        assert_eq!(engine.external_id(), Some("sub_9"));

        let other = br#"{"type":"closed_invoice_notification"}"#;
        assert_eq!(
            adapter.classify(other).unwrap(),
            EventKind::Other("closed_invoice_notification".to_string())
        );
    }

    #[test]
    fn test_malformed_payloads() {
        let adapter = adapter(Arc::new(StubProviderApi::default()));
        let payloads: [&[u8]; 4] = [b"not json", b"[1,2]", br#"{"a":1,"b":2}"#, br#"{"type":5}"#];
        for raw in payloads {
            assert!(
                matches!(adapter.classify(raw), Err(BillingError::MalformedEvent(_))),
                "payload {:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[tokio::test]
    async fn test_subscription_fetch_is_memoized() {
        let api = Arc::new(StubProviderApi::default());
        let user = uuid::Uuid::new_v4();
        api.put_subscription("sub_1", user, "pro_monthly", "active");

        let engine = adapter(api.clone())
            .engine_for(br#"{"type":"new_subscription_notification","subscription":{"id":"sub_1"}}"#)
            .unwrap();

        let first = engine.fetch_subscription().await.unwrap();
        let second = engine.fetch_subscription().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.user_id(), user);
        assert_eq!(api.subscription_fetches(), 1);
    }

    #[tokio::test]
    async fn test_invoice_fetch_on_subscription_event_is_rejected() {
        let engine = adapter(Arc::new(StubProviderApi::default()))
            .engine_for(br#"{"type":"renewed_subscription_notification","subscription":{"id":"s"}}"#)
            .unwrap();
        assert!(matches!(
            engine.fetch_invoice().await,
            Err(BillingError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_object_id_is_malformed() {
        let engine = adapter(Arc::new(StubProviderApi::default()))
            .engine_for(br#"{"type":"paid_charge_invoice_notification"}"#)
            .unwrap();
        assert!(matches!(
            engine.fetch_invoice().await,
            Err(BillingError::MalformedEvent(_))
        ));
    }
}
