//! Test doubles for the billing collaborators

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::alerting::{AlertChannel, AlertSink};
use crate::dispatch::EventEmitter;
use crate::error::{BillingError, BillingResult};
use crate::external::{ExternalIntegration, IntegrationContext};
use crate::permissions::{PermissionManager, PermissionQuery, PermissionResponse};
use crate::provider::{ProviderApi, PurchaseRequest, RefundType, WireInvoice, WireSubscription};

#[derive(Default)]
pub struct RecordingAlerter {
    sent: Mutex<Vec<(AlertChannel, String)>>,
}

impl RecordingAlerter {
    pub fn messages(&self) -> Vec<(AlertChannel, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn on(&self, channel: AlertChannel) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, m)| m)
            .collect()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerter {
    async fn notify(&self, channel: AlertChannel, message: &str) {
        self.sent.lock().unwrap().push((channel, message.to_string()));
    }
}

#[derive(Default)]
pub struct StubPermissionManager {
    held: Mutex<HashSet<(Uuid, String)>>,
    queries: AtomicUsize,
}

impl StubPermissionManager {
    pub fn grant(&self, user_id: Uuid, permission: &str) {
        self.held
            .lock()
            .unwrap()
            .insert((user_id, permission.to_string()));
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionManager for StubPermissionManager {
    async fn fetch_permission_response(
        &self,
        query: &PermissionQuery,
    ) -> BillingResult<PermissionResponse> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let held = self
            .held
            .lock()
            .unwrap()
            .contains(&(query.user_id, query.permission.clone()));
        Ok(PermissionResponse::new(held))
    }
}

#[derive(Default)]
pub struct CountingIntegration {
    fail: bool,
    delay: Option<Duration>,
    activations: AtomicUsize,
    terminations: AtomicUsize,
}

impl CountingIntegration {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Each call takes `delay` after being counted
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    async fn outcome(&self) -> BillingResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            Err(BillingError::Integration("platform rejected the request".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ExternalIntegration for CountingIntegration {
    fn name(&self) -> &str {
        "counting"
    }

    async fn activate(&self, _ctx: &IntegrationContext) -> BillingResult<()> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        self.outcome().await
    }

    async fn terminate(&self, _ctx: &IntegrationContext) -> BillingResult<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.outcome().await
    }
}

#[derive(Default)]
pub struct RecordingEmitter {
    fail: bool,
    emitted: Mutex<Vec<(String, String)>>,
}

impl RecordingEmitter {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn emitted(&self) -> Vec<(String, String)> {
        self.emitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventEmitter for RecordingEmitter {
    async fn emit(&self, email: &str, event: &str) -> BillingResult<()> {
        if self.fail {
            return Err(BillingError::Http("analytics unavailable".to_string()));
        }
        self.emitted
            .lock()
            .unwrap()
            .push((email.to_string(), event.to_string()));
        Ok(())
    }
}

/// Serves canned provider objects by id
#[derive(Default)]
pub struct StubProviderApi {
    invoices: Mutex<HashMap<String, WireInvoice>>,
    subscriptions: Mutex<HashMap<String, WireSubscription>>,
    invoice_fetches: AtomicUsize,
    subscription_fetches: AtomicUsize,
}

impl StubProviderApi {
    pub fn put_invoice(&self, invoice: WireInvoice) {
        self.invoices
            .lock()
            .unwrap()
            .insert(invoice.id.clone(), invoice);
    }

    pub fn put_subscription_wire(&self, subscription: WireSubscription) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.id.clone(), subscription);
    }

    pub fn put_subscription(&self, id: &str, user_id: Uuid, plan_code: &str, state: &str) {
        self.put_subscription_wire(WireSubscription {
            id: id.to_string(),
            account_code: user_id.to_string(),
            plan_code: plan_code.to_string(),
            state: state.to_string(),
            current_term_ends_at: None,
            current_period_ends_at: None,
            affiliate_code: None,
            add_ons: Vec::new(),
        });
    }

    pub fn invoice_fetches(&self) -> usize {
        self.invoice_fetches.load(Ordering::SeqCst)
    }

    pub fn subscription_fetches(&self) -> usize {
        self.subscription_fetches.load(Ordering::SeqCst)
    }

    fn missing(kind: &str, id: &str) -> BillingError {
        BillingError::ProviderApi {
            status: 404,
            message: format!("{} {} not found", kind, id),
        }
    }
}

#[async_trait]
impl ProviderApi for StubProviderApi {
    async fn get_invoice(&self, invoice_id: &str) -> BillingResult<WireInvoice> {
        self.invoice_fetches.fetch_add(1, Ordering::SeqCst);
        self.invoices
            .lock()
            .unwrap()
            .get(invoice_id)
            .cloned()
            .ok_or_else(|| Self::missing("invoice", invoice_id))
    }

    async fn get_subscription(&self, subscription_id: &str) -> BillingResult<WireSubscription> {
        self.subscription_fetches.fetch_add(1, Ordering::SeqCst);
        self.subscriptions
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| Self::missing("subscription", subscription_id))
    }

    async fn terminate_subscription(
        &self,
        subscription_id: &str,
        _refund: RefundType,
    ) -> BillingResult<WireSubscription> {
        self.get_subscription(subscription_id).await
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<WireSubscription> {
        self.get_subscription(subscription_id).await
    }

    async fn create_purchase(&self, _purchase: &PurchaseRequest) -> BillingResult<WireInvoice> {
        Err(BillingError::Configuration(
            "purchases are not stubbed".to_string(),
        ))
    }
}
