//! Billing provider REST client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use super::wire::{PurchaseRequest, RefundType, WireInvoice, WireSubscription};
use crate::error::{BillingError, BillingResult};

/// Calls made against the billing provider
#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn get_invoice(&self, invoice_id: &str) -> BillingResult<WireInvoice>;

    async fn get_subscription(&self, subscription_id: &str) -> BillingResult<WireSubscription>;

    async fn terminate_subscription(
        &self,
        subscription_id: &str,
        refund: RefundType,
    ) -> BillingResult<WireSubscription>;

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<WireSubscription>;

    async fn create_purchase(&self, purchase: &PurchaseRequest) -> BillingResult<WireInvoice>;
}

/// Only connection failures and provider 5xx/429 are worth another attempt
fn is_transient(err: &BillingError) -> bool {
    match err {
        BillingError::Http(_) => true,
        BillingError::ProviderApi { status, .. } => *status >= 500 || *status == 429,
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct ProviderClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    retry_factor_ms: u64,
}

impl ProviderClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            retry_factor_ms: 50,
        }
    }

    /// Backoff delays are 2x, 4x this many milliseconds
    pub fn with_retry_factor_ms(mut self, millis: u64) -> Self {
        self.retry_factor_ms = millis;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn check<T: DeserializeOwned>(
        resp: reqwest::Response,
        expected: StatusCode,
    ) -> BillingResult<T> {
        let status = resp.status();
        if status != expected {
            let message = resp.text().await.unwrap_or_default();
            return Err(BillingError::ProviderApi {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.json::<T>().await?)
    }

    async fn get_once<T: DeserializeOwned>(&self, path: &str) -> BillingResult<T> {
        let resp = self
            .client
            .get(self.url(path))
            .basic_auth(&self.api_key, None::<&str>)
            .send()
            .await?;
        Self::check(resp, StatusCode::OK).await
    }

    /// GET with exponential backoff, three attempts in total
    async fn get<T: DeserializeOwned>(&self, path: &str) -> BillingResult<T> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(self.retry_factor_ms)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(2);
        RetryIf::spawn(strategy, || self.get_once(path), is_transient).await
    }

    async fn send<B: serde::Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
        expected: StatusCode,
    ) -> BillingResult<T> {
        let mut request = self
            .client
            .request(method, self.url(path))
            .basic_auth(&self.api_key, None::<&str>);
        if let Some(body) = body {
            request = request.json(body);
        }
        let resp = request.send().await?;
        Self::check(resp, expected).await
    }
}

#[async_trait]
impl ProviderApi for ProviderClient {
    async fn get_invoice(&self, invoice_id: &str) -> BillingResult<WireInvoice> {
        self.get(&format!("invoices/{}", invoice_id)).await
    }

    async fn get_subscription(&self, subscription_id: &str) -> BillingResult<WireSubscription> {
        self.get(&format!("subscriptions/{}", subscription_id)).await
    }

    async fn terminate_subscription(
        &self,
        subscription_id: &str,
        refund: RefundType,
    ) -> BillingResult<WireSubscription> {
        tracing::info!(
            subscription_id = %subscription_id,
            refund = %refund.as_str(),
            "Terminating subscription at provider"
        );
        self.send::<(), _>(
            reqwest::Method::DELETE,
            &format!("subscriptions/{}?refund={}", subscription_id, refund.as_str()),
            None,
            StatusCode::OK,
        )
        .await
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<WireSubscription> {
        tracing::info!(subscription_id = %subscription_id, "Cancelling subscription at provider");
        self.send::<(), _>(
            reqwest::Method::PUT,
            &format!("subscriptions/{}/cancel", subscription_id),
            None,
            StatusCode::OK,
        )
        .await
    }

    async fn create_purchase(&self, purchase: &PurchaseRequest) -> BillingResult<WireInvoice> {
        self.send(
            reqwest::Method::POST,
            "purchases",
            Some(purchase),
            StatusCode::CREATED,
        )
        .await
    }
}
