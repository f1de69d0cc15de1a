//! Operational alerting
//!
//! Fire-and-forget notifications for conditions a human has to look at.
//! Delivery failures are logged and dropped; an alert is never retried,
//! never fails the caller and never makes it wait on the network.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;

/// Logical channel an alert is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertChannel {
    MissingUser,
    MissingSkuMapping,
    ExternalSyncFailure,
    PermissionConflict,
    SubscriptionChange,
    WebhookFailure,
}

impl AlertChannel {
    pub const ALL: [AlertChannel; 6] = [
        AlertChannel::MissingUser,
        AlertChannel::MissingSkuMapping,
        AlertChannel::ExternalSyncFailure,
        AlertChannel::PermissionConflict,
        AlertChannel::SubscriptionChange,
        AlertChannel::WebhookFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertChannel::MissingUser => "missing_user",
            AlertChannel::MissingSkuMapping => "missing_sku_mapping",
            AlertChannel::ExternalSyncFailure => "external_sync_failure",
            AlertChannel::PermissionConflict => "permission_conflict",
            AlertChannel::SubscriptionChange => "subscription_change",
            AlertChannel::WebhookFailure => "webhook_failure",
        }
    }

    /// Environment variable holding the Slack webhook for this channel
    pub fn env_key(&self) -> String {
        format!("SLACK_WEBHOOK_URL_{}", self.as_str().to_ascii_uppercase())
    }
}

impl std::fmt::Display for AlertChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, channel: AlertChannel, message: &str);
}

/// Alerts that only go to the log
#[derive(Debug, Clone, Default)]
pub struct LogAlerter;

#[async_trait]
impl AlertSink for LogAlerter {
    async fn notify(&self, channel: AlertChannel, message: &str) {
        tracing::warn!(channel = %channel, alert = %message, "Billing alert");
    }
}

/// Posts alerts to Slack incoming webhooks, one URL per channel with an
/// optional fallback URL for channels that have none.
#[derive(Debug, Clone)]
pub struct SlackAlerter {
    client: reqwest::Client,
    webhooks: HashMap<AlertChannel, String>,
    fallback_url: Option<String>,
}

#[derive(Serialize)]
struct SlackMessage {
    text: String,
}

impl SlackAlerter {
    pub fn new(
        client: reqwest::Client,
        webhooks: HashMap<AlertChannel, String>,
        fallback_url: Option<String>,
    ) -> Self {
        Self {
            client,
            webhooks,
            fallback_url,
        }
    }

    fn url_for(&self, channel: AlertChannel) -> Option<&str> {
        self.webhooks
            .get(&channel)
            .map(String::as_str)
            .or(self.fallback_url.as_deref())
    }
}

#[async_trait]
impl AlertSink for SlackAlerter {
    async fn notify(&self, channel: AlertChannel, message: &str) {
        tracing::warn!(channel = %channel, alert = %message, "Billing alert");

        let Some(url) = self.url_for(channel) else {
            tracing::debug!(channel = %channel, "No Slack webhook configured for alert channel");
            return;
        };

        // Callers may hold a database transaction and row locks
        let request = self.client.post(url).json(&SlackMessage {
            text: format!("[{}] {}", channel, message),
        });
        tokio::spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    tracing::error!(
                        channel = %channel,
                        status = %resp.status(),
                        "Slack rejected billing alert"
                    );
                }
                Err(e) => {
                    tracing::error!(channel = %channel, error = %e, "Failed to deliver billing alert");
                }
            }
        });
    }
}
