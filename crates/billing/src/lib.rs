// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries provider messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Ledgerline Billing Module
//!
//! Reconciles billing-provider webhooks against persisted billing state.
//!
//! ## Features
//!
//! - **Webhooks**: Classify provider notifications and reconcile invoices and subscriptions
//! - **SKU Resolution**: Map provider SKUs onto catalog products, plans and add-ons
//! - **Product Grants**: Grant purchased products exactly once per invoice item
//! - **External Sync**: Activate or terminate third-party services after commit
//! - **Permission Conflicts**: Alert when a billing event changes a user's tier conflict state
//! - **Post-webhook Dispatch**: Affiliate commissions and analytics events, isolated from each other
//! - **Alerting**: Slack channels per alert kind with log fallback

pub mod alerting;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod external;
pub mod invoice;
pub mod permissions;
pub mod provider;
pub mod sku;
pub mod store;
pub mod subscription;
pub mod tiers;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
pub(crate) mod testing;

// Alerting
pub use alerting::{AlertChannel, AlertSink, LogAlerter, SlackAlerter};

// Config
pub use config::BillingConfig;

// Dispatch
pub use dispatch::{
    AffiliateCommission, AffiliateTracker, DispatchReport, EventEmitter, HttpAffiliateTracker,
    HttpEventEmitter, PostWebhookDispatcher, PostWebhookOptions,
};

// Engine
pub use engine::{BillingProvider, EventKind, WebhookEngine};

// Error
pub use error::{BillingError, BillingResult};

// External services
pub use external::{
    ExternalIntegration, ExternalServiceManager, ExternalServiceRegistry, ExternalServiceToUpdate,
    HttpIntegration, IntegrationConfig, RecordKind,
};

// Domain
pub use invoice::{Invoice, InvoiceState, LineItem, LineItemOrigin};
pub use subscription::{AddOn, ExternalSyncStatus, StatusTransition, Subscription, SubscriptionStatus};

// Permissions
pub use permissions::{PermissionConflict, PermissionManager, PgPermissionManager};

// Provider
pub use provider::{ProviderAdapter, ProviderApi, ProviderClient, RefundType};

// SKU
pub use sku::{AddOnSkuManager, ProductSkuManager, SkuCategory, SkuMapping, SubscriptionSkuManager};

// Store
pub use store::{BillingStore, BillingTransaction, InMemoryBillingStore, PgBillingStore};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome};

use std::sync::Arc;

/// Billing services wired from configuration
pub struct BillingService {
    pub provider: Arc<ProviderClient>,
    pub registry: Arc<ExternalServiceRegistry>,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create the billing service from environment variables
    pub fn from_env(
        store: Arc<dyn BillingStore>,
        permissions: Option<Arc<dyn PermissionManager>>,
    ) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        Self::new(&config, store, permissions)
    }

    /// Create the billing service with explicit config
    pub fn new(
        config: &BillingConfig,
        store: Arc<dyn BillingStore>,
        permissions: Option<Arc<dyn PermissionManager>>,
    ) -> BillingResult<Self> {
        let client = config.http_client()?;
        let alerts = config.alert_sink(client.clone());
        let provider = Arc::new(config.provider_client(client.clone()));
        let registry = Arc::new(config.service_registry(client.clone())?);
        tracing::info!(integrations = registry.len(), "External service registry loaded");

        let sync = ExternalServiceManager::new(store.clone(), registry.clone(), alerts.clone());
        let mut dispatcher = PostWebhookDispatcher::new(store.clone(), sync, alerts.clone());
        if let Some(emitter) = config.event_emitter(client.clone()) {
            dispatcher = dispatcher.with_event_emitter(Arc::new(emitter));
        }
        if let Some(tracker) = config.affiliate_tracker(client) {
            dispatcher = dispatcher.with_affiliate_tracker(Arc::new(tracker));
        }

        let mut webhooks = WebhookHandler::new(
            Arc::new(ProviderAdapter::new(provider.clone())),
            store,
            dispatcher,
            alerts.clone(),
        );
        match permissions {
            Some(manager) if !config.permission_conflict_groups.is_empty() => {
                webhooks = webhooks.with_permission_conflicts(PermissionConflict::new(
                    manager,
                    alerts,
                    config.permission_conflict_groups.clone(),
                ));
            }
            _ => tracing::info!("Permission conflict detection disabled"),
        }

        Ok(Self {
            provider,
            registry,
            webhooks,
        })
    }
}
