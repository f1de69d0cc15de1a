//! External service synchronization
//!
//! Activates or terminates a third-party integration (course platforms and
//! similar) for one user-relationship row. Runs after the billing
//! transaction has committed, in its own transaction holding a per-record
//! lock from the status read to the status write, so a slow or failing
//! integration never holds open or rolls back billing state and a record is
//! never synced twice concurrently.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alerting::{AlertChannel, AlertSink};
use crate::error::{BillingError, BillingResult};
use crate::sku::SkuCategory;
use crate::store::BillingStore;
use crate::subscription::ExternalSyncStatus;

/// Which user-relationship table a sync record lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    UserProduct,
    UserSubscription,
}

impl RecordKind {
    /// Catalog category holding the service record for this kind of row
    pub fn catalog_category(&self) -> SkuCategory {
        match self {
            RecordKind::UserProduct => SkuCategory::Product,
            RecordKind::UserSubscription => SkuCategory::Subscription,
        }
    }

    /// Lock key for syncing one row; disjoint from provider external ids
    pub fn lock_key(&self, record_id: Uuid) -> String {
        match self {
            RecordKind::UserProduct => format!("external-sync:user_product:{}", record_id),
            RecordKind::UserSubscription => format!("external-sync:user_subscription:{}", record_id),
        }
    }
}

/// Instruction to sync one user + record with an external integration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalServiceToUpdate {
    /// Catalog id of the product or subscription plan
    pub service_id: Uuid,
    pub record_kind: RecordKind,
    /// User-relationship row id
    pub record_id: Uuid,
    pub user_id: Uuid,
    pub activating: bool,
}

/// Status to persist after a sync attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatusOptions {
    pub record_kind: RecordKind,
    pub record_id: Uuid,
    status: ExternalSyncStatus,
}

impl SyncStatusOptions {
    /// Only the four outcomes of an attempt are accepted here
    pub fn new(
        record_kind: RecordKind,
        record_id: Uuid,
        status: ExternalSyncStatus,
    ) -> BillingResult<Self> {
        if status == ExternalSyncStatus::ActionRequired {
            return Err(BillingError::InvalidInput(
                "action_required is not a sync attempt outcome".to_string(),
            ));
        }
        Ok(Self {
            record_kind,
            record_id,
            status,
        })
    }

    pub fn status(&self) -> ExternalSyncStatus {
        self.status
    }
}

/// Data handed to an integration call
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationContext {
    pub service_id: Uuid,
    pub record_id: Uuid,
    pub user_id: Uuid,
    pub email: Option<String>,
}

/// Activation and termination functions for one catalog item
#[async_trait]
pub trait ExternalIntegration: Send + Sync {
    fn name(&self) -> &str;

    async fn activate(&self, ctx: &IntegrationContext) -> BillingResult<()>;

    async fn terminate(&self, ctx: &IntegrationContext) -> BillingResult<()>;
}

/// One entry of the integration configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct IntegrationConfig {
    pub catalog_id: Uuid,
    pub name: String,
    pub activate_url: String,
    pub terminate_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Integration driven by two HTTP endpoints
pub struct HttpIntegration {
    client: reqwest::Client,
    config: IntegrationConfig,
}

impl HttpIntegration {
    pub fn new(client: reqwest::Client, config: IntegrationConfig) -> Self {
        Self { client, config }
    }

    async fn call(&self, url: &str, ctx: &IntegrationContext) -> BillingResult<()> {
        let mut request = self.client.post(url).json(ctx);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| BillingError::Integration(format!("{}: {}", self.config.name, e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(BillingError::Integration(format!(
                "{} responded {}: {}",
                self.config.name, status, body
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl ExternalIntegration for HttpIntegration {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn activate(&self, ctx: &IntegrationContext) -> BillingResult<()> {
        self.call(&self.config.activate_url, ctx).await
    }

    async fn terminate(&self, ctx: &IntegrationContext) -> BillingResult<()> {
        self.call(&self.config.terminate_url, ctx).await
    }
}

/// Catalog id -> integration, built once at startup
#[derive(Default, Clone)]
pub struct ExternalServiceRegistry {
    integrations: HashMap<Uuid, Arc<dyn ExternalIntegration>>,
}

impl ExternalServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, catalog_id: Uuid, integration: Arc<dyn ExternalIntegration>) {
        self.integrations.insert(catalog_id, integration);
    }

    pub fn get(&self, catalog_id: Uuid) -> Option<Arc<dyn ExternalIntegration>> {
        self.integrations.get(&catalog_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.integrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.integrations.is_empty()
    }

    pub fn from_configs(client: reqwest::Client, configs: Vec<IntegrationConfig>) -> Self {
        let mut registry = Self::new();
        for config in configs {
            let catalog_id = config.catalog_id;
            registry.register(
                catalog_id,
                Arc::new(HttpIntegration::new(client.clone(), config)),
            );
        }
        registry
    }

    /// Load a JSON array of `IntegrationConfig` entries
    pub fn from_config_file(client: reqwest::Client, path: &Path) -> BillingResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BillingError::Configuration(format!(
                "Cannot read external services config {}: {}",
                path.display(),
                e
            ))
        })?;
        let configs: Vec<IntegrationConfig> = serde_json::from_str(&raw).map_err(|e| {
            BillingError::Configuration(format!(
                "Invalid external services config {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self::from_configs(client, configs))
    }

    /// Catalog ids flagged for external action that have no integration
    pub fn validate_against(&self, catalog_ids: &[Uuid]) -> Vec<Uuid> {
        catalog_ids
            .iter()
            .filter(|id| !self.integrations.contains_key(id))
            .copied()
            .collect()
    }
}

/// Runs sync instructions against the registry
#[derive(Clone)]
pub struct ExternalServiceManager {
    store: Arc<dyn BillingStore>,
    registry: Arc<ExternalServiceRegistry>,
    alerts: Arc<dyn AlertSink>,
}

impl ExternalServiceManager {
    pub fn new(
        store: Arc<dyn BillingStore>,
        registry: Arc<ExternalServiceRegistry>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            store,
            registry,
            alerts,
        }
    }

    /// Sync one record. Returns whether the record ends up in the desired
    /// state; never returns an error.
    pub async fn update_external_service(&self, instruction: &ExternalServiceToUpdate) -> bool {
        match self.try_update(instruction).await {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(
                    service_id = %instruction.service_id,
                    record_id = %instruction.record_id,
                    error = %e,
                    "External service sync aborted"
                );
                self.alerts
                    .notify(
                        AlertChannel::ExternalSyncFailure,
                        &format!(
                            "Sync of service {} for record {} aborted: {}",
                            instruction.service_id, instruction.record_id, e
                        ),
                    )
                    .await;
                false
            }
        }
    }

    async fn try_update(&self, instruction: &ExternalServiceToUpdate) -> BillingResult<bool> {
        let desired = ExternalSyncStatus::desired(instruction.activating);

        let mut tx = self.store.begin().await?;
        tx.lock_external_id(&instruction.record_kind.lock_key(instruction.record_id))
            .await?;
        let service = tx
            .get_catalog_record(
                instruction.record_kind.catalog_category(),
                instruction.service_id,
            )
            .await?;

        let service = match service {
            Some(s) if s.requires_external_action => s,
            _ => {
                tracing::debug!(
                    service_id = %instruction.service_id,
                    "Catalog item does not require external action"
                );
                return Ok(false);
            }
        };

        let current = tx
            .get_sync_status(instruction.record_kind, instruction.record_id)
            .await?;
        if current == Some(desired) {
            tracing::debug!(
                record_id = %instruction.record_id,
                status = %desired,
                "External service already in sync"
            );
            return Ok(true);
        }

        let email = tx.get_user_email(instruction.user_id).await?;

        let Some(integration) = self.registry.get(instruction.service_id) else {
            self.alerts
                .notify(
                    AlertChannel::ExternalSyncFailure,
                    &format!(
                        "No external integration configured for {} ({}); record {} needs {}",
                        service.name, service.id, instruction.record_id, desired
                    ),
                )
                .await;
            return Ok(false);
        };

        let ctx = IntegrationContext {
            service_id: instruction.service_id,
            record_id: instruction.record_id,
            user_id: instruction.user_id,
            email,
        };

        let outcome = if instruction.activating {
            integration.activate(&ctx).await
        } else {
            integration.terminate(&ctx).await
        };

        let (status, result) = match outcome {
            Ok(()) => {
                tracing::info!(
                    integration = %integration.name(),
                    record_id = %instruction.record_id,
                    status = %desired,
                    "External service synced"
                );
                (desired, true)
            }
            Err(e) => {
                let failed = ExternalSyncStatus::failed(instruction.activating);
                tracing::error!(
                    integration = %integration.name(),
                    record_id = %instruction.record_id,
                    error = %e,
                    "External service sync failed"
                );
                self.alerts
                    .notify(
                        AlertChannel::ExternalSyncFailure,
                        &format!(
                            "{} {} failed for user {} (record {}): {}",
                            integration.name(),
                            if instruction.activating { "activation" } else { "termination" },
                            instruction.user_id,
                            instruction.record_id,
                            e
                        ),
                    )
                    .await;
                (failed, false)
            }
        };

        let options = SyncStatusOptions::new(instruction.record_kind, instruction.record_id, status)?;
        tx.set_sync_status(&options).await?;
        tx.commit().await?;

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBillingStore;
    use crate::testing::{CountingIntegration, RecordingAlerter};

    struct Fixture {
        store: Arc<InMemoryBillingStore>,
        alerts: Arc<RecordingAlerter>,
        integration: Arc<CountingIntegration>,
        instruction: ExternalServiceToUpdate,
    }

    fn fixture(requires_action: bool, failing: bool) -> Fixture {
        let store = Arc::new(InMemoryBillingStore::new());
        let user_id = store.add_user("learner@example.com");
        let product_id = store.add_product("Course Platform", requires_action);
        let record_id = store.seed_user_product(
            user_id,
            product_id,
            Some(ExternalSyncStatus::ActionRequired),
        );

        Fixture {
            store,
            alerts: Arc::new(RecordingAlerter::default()),
            integration: Arc::new(if failing {
                CountingIntegration::failing()
            } else {
                CountingIntegration::default()
            }),
            instruction: ExternalServiceToUpdate {
                service_id: product_id,
                record_kind: RecordKind::UserProduct,
                record_id,
                user_id,
                activating: true,
            },
        }
    }

    fn manager(f: &Fixture, with_integration: bool) -> ExternalServiceManager {
        let mut registry = ExternalServiceRegistry::new();
        if with_integration {
            registry.register(f.instruction.service_id, f.integration.clone());
        }
        ExternalServiceManager::new(f.store.clone(), Arc::new(registry), f.alerts.clone())
    }

    #[tokio::test]
    async fn test_second_activation_short_circuits() {
        let f = fixture(true, false);
        let manager = manager(&f, true);

        assert!(manager.update_external_service(&f.instruction).await);
        assert!(manager.update_external_service(&f.instruction).await);

        assert_eq!(f.integration.activations(), 1);
        assert_eq!(
            f.store
                .sync_status(RecordKind::UserProduct, f.instruction.record_id),
            Some(ExternalSyncStatus::Activated)
        );
    }

    #[tokio::test]
    async fn test_concurrent_activations_call_integration_once() {
        let store = Arc::new(InMemoryBillingStore::new());
        let user_id = store.add_user("learner@example.com");
        let product_id = store.add_product("Course Platform", true);
        let record_id = store.seed_user_product(
            user_id,
            product_id,
            Some(ExternalSyncStatus::ActionRequired),
        );
        let integration = Arc::new(CountingIntegration::slow(std::time::Duration::from_millis(50)));
        let mut registry = ExternalServiceRegistry::new();
        registry.register(product_id, integration.clone());
        let manager = ExternalServiceManager::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(RecordingAlerter::default()),
        );
        let instruction = ExternalServiceToUpdate {
            service_id: product_id,
            record_kind: RecordKind::UserProduct,
            record_id,
            user_id,
            activating: true,
        };

        let (first, second) = tokio::join!(
            manager.update_external_service(&instruction),
            manager.update_external_service(&instruction)
        );

        assert!(first && second);
        assert_eq!(integration.activations(), 1);
        assert_eq!(
            store.sync_status(RecordKind::UserProduct, record_id),
            Some(ExternalSyncStatus::Activated)
        );
    }

    #[tokio::test]
    async fn test_not_requiring_action_is_noop() {
        let f = fixture(false, false);
        let manager = manager(&f, true);

        assert!(!manager.update_external_service(&f.instruction).await);
        assert_eq!(f.integration.activations(), 0);
        assert!(f.alerts.messages().is_empty());
    }

    #[tokio::test]
    async fn test_missing_integration_alerts() {
        let f = fixture(true, false);
        let manager = manager(&f, false);

        assert!(!manager.update_external_service(&f.instruction).await);
        let alerts = f.alerts.on(AlertChannel::ExternalSyncFailure);
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].contains("No external integration configured"));
    }

    #[tokio::test]
    async fn test_failure_records_failed_status() {
        let f = fixture(true, true);
        let manager = manager(&f, true);

        assert!(!manager.update_external_service(&f.instruction).await);
        assert_eq!(
            f.store
                .sync_status(RecordKind::UserProduct, f.instruction.record_id),
            Some(ExternalSyncStatus::ActivationFailed)
        );
        assert_eq!(f.alerts.on(AlertChannel::ExternalSyncFailure).len(), 1);
    }

    #[tokio::test]
    async fn test_termination_after_activation() {
        let f = fixture(true, false);
        let manager = manager(&f, true);
        assert!(manager.update_external_service(&f.instruction).await);

        let terminate = ExternalServiceToUpdate {
            activating: false,
            ..f.instruction.clone()
        };
        assert!(manager.update_external_service(&terminate).await);
        assert_eq!(f.integration.terminations(), 1);
        assert_eq!(
            f.store.sync_status(RecordKind::UserProduct, terminate.record_id),
            Some(ExternalSyncStatus::Terminated)
        );
    }

    #[test]
    fn test_sync_options_reject_action_required() {
        let result = SyncStatusOptions::new(
            RecordKind::UserSubscription,
            Uuid::new_v4(),
            ExternalSyncStatus::ActionRequired,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_registry_validation_reports_missing() {
        let covered = Uuid::new_v4();
        let missing = Uuid::new_v4();
        let mut registry = ExternalServiceRegistry::new();
        registry.register(covered, Arc::new(CountingIntegration::default()));

        assert_eq!(registry.validate_against(&[covered, missing]), vec![missing]);
    }

    #[tokio::test]
    async fn test_http_integration_posts_context() {
        let mut server = mockito::Server::new_async().await;
        let activate = server
            .mock("POST", "/activate")
            .match_header("authorization", "Bearer secret")
            .with_status(204)
            .create_async()
            .await;
        let terminate = server
            .mock("POST", "/terminate")
            .with_status(502)
            .with_body("upstream down")
            .create_async()
            .await;

        let integration = HttpIntegration::new(
            reqwest::Client::new(),
            IntegrationConfig {
                catalog_id: Uuid::new_v4(),
                name: "LMS".to_string(),
                activate_url: format!("{}/activate", server.url()),
                terminate_url: format!("{}/terminate", server.url()),
                api_key: Some("secret".to_string()),
            },
        );
        let ctx = IntegrationContext {
            service_id: Uuid::new_v4(),
            record_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            email: Some("a@example.com".to_string()),
        };

        assert!(integration.activate(&ctx).await.is_ok());
        let err = integration.terminate(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("upstream down"));

        activate.assert_async().await;
        terminate.assert_async().await;
    }
}
