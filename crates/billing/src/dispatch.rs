//! Post-webhook side effects
//!
//! Runs after the primary reconciliation transaction has committed. The
//! three branches (external sync, affiliate commission, analytics events)
//! run concurrently and never affect one another or the webhook response.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use uuid::Uuid;

use crate::alerting::{AlertChannel, AlertSink};
use crate::error::{BillingError, BillingResult};
use crate::external::{ExternalServiceManager, ExternalServiceToUpdate};
use crate::store::BillingStore;

/// Commission owed to an affiliate for a paid invoice
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AffiliateCommission {
    pub invoice_id: String,
    pub user_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub affiliate_code: Option<String>,
}

/// Side effects assembled while reconciling one webhook
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostWebhookOptions {
    pub user_id: Option<Uuid>,
    pub services_to_update: Vec<ExternalServiceToUpdate>,
    pub affiliate_commission: Option<AffiliateCommission>,
    /// Free-text analytics events for the user
    pub events: Vec<String>,
}

impl PostWebhookOptions {
    pub fn for_user(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.services_to_update.is_empty()
            && self.affiliate_commission.is_none()
            && self.events.is_empty()
    }
}

#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, email: &str, event: &str) -> BillingResult<()>;
}

#[async_trait]
pub trait AffiliateTracker: Send + Sync {
    async fn record_commission(&self, commission: &AffiliateCommission) -> BillingResult<()>;
}

#[derive(Serialize)]
struct EventPayload<'a> {
    email: &'a str,
    event: &'a str,
}

async fn post_json<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    body: &T,
) -> BillingResult<()> {
    let resp = client.post(url).json(body).send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        return Err(BillingError::Http(format!("{} responded {}", url, status)));
    }
    Ok(())
}

/// Analytics events as JSON POSTs
#[derive(Debug, Clone)]
pub struct HttpEventEmitter {
    client: reqwest::Client,
    url: String,
}

impl HttpEventEmitter {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl EventEmitter for HttpEventEmitter {
    async fn emit(&self, email: &str, event: &str) -> BillingResult<()> {
        post_json(&self.client, &self.url, &EventPayload { email, event }).await
    }
}

/// Affiliate commissions as JSON POSTs
#[derive(Debug, Clone)]
pub struct HttpAffiliateTracker {
    client: reqwest::Client,
    url: String,
}

impl HttpAffiliateTracker {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl AffiliateTracker for HttpAffiliateTracker {
    async fn record_commission(&self, commission: &AffiliateCommission) -> BillingResult<()> {
        post_json(&self.client, &self.url, commission).await
    }
}

/// What the dispatcher managed to do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub services_synced: usize,
    pub services_failed: usize,
    pub commission_recorded: bool,
    pub events_emitted: usize,
}

#[derive(Clone)]
pub struct PostWebhookDispatcher {
    store: Arc<dyn BillingStore>,
    sync: ExternalServiceManager,
    alerts: Arc<dyn AlertSink>,
    emitter: Option<Arc<dyn EventEmitter>>,
    affiliates: Option<Arc<dyn AffiliateTracker>>,
}

impl PostWebhookDispatcher {
    pub fn new(
        store: Arc<dyn BillingStore>,
        sync: ExternalServiceManager,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            store,
            sync,
            alerts,
            emitter: None,
            affiliates: None,
        }
    }

    pub fn with_event_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn with_affiliate_tracker(mut self, tracker: Arc<dyn AffiliateTracker>) -> Self {
        self.affiliates = Some(tracker);
        self
    }

    pub async fn dispatch(&self, options: &PostWebhookOptions) -> DispatchReport {
        let (synced, commission_recorded, events_emitted) = futures::join!(
            self.run_sync(&options.services_to_update),
            self.run_commission(options.affiliate_commission.as_ref()),
            self.run_events(options.user_id, &options.events),
        );

        let services_synced = synced.iter().filter(|ok| **ok).count();
        let report = DispatchReport {
            services_synced,
            services_failed: synced.len() - services_synced,
            commission_recorded,
            events_emitted,
        };
        tracing::debug!(?report, "Post-webhook dispatch finished");
        report
    }

    async fn run_sync(&self, instructions: &[ExternalServiceToUpdate]) -> Vec<bool> {
        join_all(
            instructions
                .iter()
                .map(|instruction| self.sync.update_external_service(instruction)),
        )
        .await
    }

    async fn run_commission(&self, commission: Option<&AffiliateCommission>) -> bool {
        let Some(commission) = commission else {
            return false;
        };
        let Some(tracker) = &self.affiliates else {
            tracing::debug!(invoice_id = %commission.invoice_id, "No affiliate tracker configured");
            return false;
        };

        match tracker.record_commission(commission).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    invoice_id = %commission.invoice_id,
                    error = %e,
                    "Failed to record affiliate commission"
                );
                self.alerts
                    .notify(
                        AlertChannel::WebhookFailure,
                        &format!(
                            "Affiliate commission for invoice {} failed: {}",
                            commission.invoice_id, e
                        ),
                    )
                    .await;
                false
            }
        }
    }

    async fn run_events(&self, user_id: Option<Uuid>, events: &[String]) -> usize {
        if events.is_empty() {
            return 0;
        }
        let (Some(emitter), Some(user_id)) = (&self.emitter, user_id) else {
            return 0;
        };

        let email = match self.lookup_email(user_id).await {
            Ok(Some(email)) => email,
            Ok(None) => {
                tracing::warn!(user_id = %user_id, "No email for analytics events");
                return 0;
            }
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Failed to look up email for analytics");
                return 0;
            }
        };

        let mut emitted = 0;
        for event in events {
            match emitter.emit(&email, event).await {
                Ok(()) => emitted += 1,
                Err(e) => {
                    tracing::error!(user_id = %user_id, event = %event, error = %e, "Analytics event failed");
                    self.alerts
                        .notify(
                            AlertChannel::WebhookFailure,
                            &format!("Analytics event '{}' for user {} failed: {}", event, user_id, e),
                        )
                        .await;
                }
            }
        }
        emitted
    }

    async fn lookup_email(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        let mut tx = self.store.begin().await?;
        tx.get_user_email(user_id).await
    }
}
