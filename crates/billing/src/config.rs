//! Billing configuration from environment variables

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::alerting::{AlertChannel, AlertSink, LogAlerter, SlackAlerter};
use crate::dispatch::{HttpAffiliateTracker, HttpEventEmitter};
use crate::error::{BillingError, BillingResult};
use crate::external::ExternalServiceRegistry;
use crate::permissions::parse_groups;
use crate::provider::ProviderClient;

/// Fallback Slack webhook for channels without their own URL
pub const SLACK_FALLBACK_ENV: &str = "SLACK_WEBHOOK_URL";

/// Upper bound on any outbound HTTP call, including reading the body
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;
const CONNECT_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Default)]
pub struct BillingConfig {
    pub provider_api_url: String,
    pub provider_api_key: String,
    pub slack_webhooks: HashMap<AlertChannel, String>,
    pub slack_fallback_url: Option<String>,
    pub analytics_url: Option<String>,
    pub affiliate_url: Option<String>,
    /// JSON file listing external integrations
    pub external_services_config: Option<PathBuf>,
    pub permission_conflict_groups: Vec<Vec<String>>,
    /// Falls back to `DEFAULT_HTTP_TIMEOUT_SECS`
    pub http_timeout_secs: Option<u64>,
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(key: &str) -> BillingResult<String> {
    optional(key).ok_or_else(|| BillingError::Configuration(format!("{} must be set", key)))
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let slack_webhooks = AlertChannel::ALL
            .iter()
            .filter_map(|channel| optional(&channel.env_key()).map(|url| (*channel, url)))
            .collect();

        Ok(Self {
            provider_api_url: required("BILLING_API_URL")?,
            provider_api_key: required("BILLING_API_KEY")?,
            slack_webhooks,
            slack_fallback_url: optional(SLACK_FALLBACK_ENV),
            analytics_url: optional("ANALYTICS_URL"),
            affiliate_url: optional("AFFILIATE_URL"),
            external_services_config: optional("EXTERNAL_SERVICES_CONFIG").map(PathBuf::from),
            permission_conflict_groups: optional("PERMISSION_CONFLICT_GROUPS")
                .map(|raw| parse_groups(&raw))
                .unwrap_or_default(),
            http_timeout_secs: optional("BILLING_HTTP_TIMEOUT_SECS")
                .map(|raw| {
                    raw.parse::<u64>().map_err(|_| {
                        BillingError::Configuration(format!(
                            "BILLING_HTTP_TIMEOUT_SECS must be a number of seconds, got {}",
                            raw
                        ))
                    })
                })
                .transpose()?,
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS))
    }

    /// Shared client for the provider, integrations, analytics and Slack
    pub fn http_client(&self) -> BillingResult<reqwest::Client> {
        let timeout = self.http_timeout();
        reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(CONNECT_TIMEOUT_SECS)))
            .build()
            .map_err(|e| BillingError::Configuration(format!("Failed to build HTTP client: {}", e)))
    }

    /// Slack when any webhook URL is configured, log-only otherwise
    pub fn alert_sink(&self, client: reqwest::Client) -> Arc<dyn AlertSink> {
        if self.slack_webhooks.is_empty() && self.slack_fallback_url.is_none() {
            tracing::warn!("No Slack webhooks configured, billing alerts go to the log only");
            return Arc::new(LogAlerter);
        }
        Arc::new(SlackAlerter::new(
            client,
            self.slack_webhooks.clone(),
            self.slack_fallback_url.clone(),
        ))
    }

    pub fn provider_client(&self, client: reqwest::Client) -> ProviderClient {
        ProviderClient::new(client, &self.provider_api_url, &self.provider_api_key)
    }

    pub fn service_registry(&self, client: reqwest::Client) -> BillingResult<ExternalServiceRegistry> {
        match &self.external_services_config {
            Some(path) => ExternalServiceRegistry::from_config_file(client, path),
            None => {
                tracing::warn!("EXTERNAL_SERVICES_CONFIG not set, no external integrations loaded");
                Ok(ExternalServiceRegistry::new())
            }
        }
    }

    pub fn event_emitter(&self, client: reqwest::Client) -> Option<HttpEventEmitter> {
        self.analytics_url
            .as_ref()
            .map(|url| HttpEventEmitter::new(client, url.clone()))
    }

    pub fn affiliate_tracker(&self, client: reqwest::Client) -> Option<HttpAffiliateTracker> {
        self.affiliate_url
            .as_ref()
            .map(|url| HttpAffiliateTracker::new(client, url.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const KEYS: &[&str] = &[
        "BILLING_API_URL",
        "BILLING_API_KEY",
        "SLACK_WEBHOOK_URL",
        "SLACK_WEBHOOK_URL_MISSING_USER",
        "ANALYTICS_URL",
        "AFFILIATE_URL",
        "EXTERNAL_SERVICES_CONFIG",
        "PERMISSION_CONFLICT_GROUPS",
        "BILLING_HTTP_TIMEOUT_SECS",
    ];

    fn clear_env() {
        for key in KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_requires_provider_credentials() {
        clear_env();
        std::env::set_var("BILLING_API_URL", "https://billing.example.com/v2");

        let err = BillingConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("BILLING_API_KEY"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_reads_optional_settings() {
        clear_env();
        std::env::set_var("BILLING_API_URL", "https://billing.example.com/v2");
        std::env::set_var("BILLING_API_KEY", "secret");
        std::env::set_var("SLACK_WEBHOOK_URL_MISSING_USER", "https://hooks.slack.test/a");
        std::env::set_var("ANALYTICS_URL", "   ");
        std::env::set_var("PERMISSION_CONFLICT_GROUPS", "course.pro;course.agency,course.agency_plus");

        let config = BillingConfig::from_env().unwrap();
        assert_eq!(config.provider_api_key, "secret");
        assert_eq!(
            config.slack_webhooks.get(&AlertChannel::MissingUser).map(String::as_str),
            Some("https://hooks.slack.test/a")
        );
        assert_eq!(config.slack_webhooks.len(), 1);
        assert!(config.analytics_url.is_none());
        assert!(config.external_services_config.is_none());
        assert_eq!(config.permission_conflict_groups.len(), 2);
        assert_eq!(config.http_timeout(), Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_timeout() {
        clear_env();
        std::env::set_var("BILLING_API_URL", "https://billing.example.com/v2");
        std::env::set_var("BILLING_API_KEY", "secret");
        std::env::set_var("BILLING_HTTP_TIMEOUT_SECS", "soon");

        let err = BillingConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("BILLING_HTTP_TIMEOUT_SECS"));

        std::env::set_var("BILLING_HTTP_TIMEOUT_SECS", "3");
        let config = BillingConfig::from_env().unwrap();
        assert_eq!(config.http_timeout(), Duration::from_secs(3));
        clear_env();
    }

    #[tokio::test]
    async fn test_http_client_gives_up_on_stalled_server() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/stalled")
            .with_status(200)
            .with_chunked_body(|w| {
                std::thread::sleep(std::time::Duration::from_secs(3));
                w.write_all(b"late")
            })
            .create_async()
            .await;

        let config = BillingConfig {
            http_timeout_secs: Some(1),
            ..BillingConfig::default()
        };
        let client = config.http_client().unwrap();

        let started = std::time::Instant::now();
        let result = async {
            client
                .get(format!("{}/stalled", server.url()))
                .send()
                .await?
                .text()
                .await
        }
        .await;

        assert!(result.unwrap_err().is_timeout());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_optional_collaborators_follow_urls() {
        let config = BillingConfig {
            affiliate_url: Some("https://affiliates.example.com/commissions".to_string()),
            ..BillingConfig::default()
        };
        let client = reqwest::Client::new();
        assert!(config.event_emitter(client.clone()).is_none());
        assert!(config.affiliate_tracker(client.clone()).is_some());
        assert!(config.service_registry(client).unwrap().is_empty());
    }
}
