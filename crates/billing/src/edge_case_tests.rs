// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing Reconciliation
//!
//! Tests boundary conditions across whole webhook runs:
//! - Invoice totals and lazy SKU loading
//! - Concurrent redelivery of the same event
//! - Subscription reactivation and add-on replacement
//! - External sync retries after failure

#[cfg(test)]
mod fixtures {
    use std::sync::Arc;

    use uuid::Uuid;

    use crate::dispatch::PostWebhookDispatcher;
    use crate::external::{ExternalServiceManager, ExternalServiceRegistry};
    use crate::provider::wire::{WireInvoice, WireLineItem, WireSubscription};
    use crate::provider::ProviderAdapter;
    use crate::sku::SkuCategory;
    use crate::store::InMemoryBillingStore;
    use crate::testing::{CountingIntegration, RecordingAlerter, RecordingEmitter, StubProviderApi};
    use crate::webhooks::WebhookHandler;

    pub struct Harness {
        pub store: Arc<InMemoryBillingStore>,
        pub api: Arc<StubProviderApi>,
        pub alerts: Arc<RecordingAlerter>,
        pub emitter: Arc<RecordingEmitter>,
        pub integration: Arc<CountingIntegration>,
        pub user: Uuid,
        pub plan: Uuid,
        pub course: Uuid,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_integration(CountingIntegration::default())
        }

        pub fn with_integration(integration: CountingIntegration) -> Self {
            let store = Arc::new(InMemoryBillingStore::new());
            let user = store.add_user("student@example.com");
            let plan = store.add_subscription_plan("Pro Sessions", true);
            store.add_sku(SkuCategory::Subscription, "pro_monthly", plan);
            let course = store.add_product("Course A", false);
            store.add_sku(SkuCategory::Product, "course_a", course);

            Self {
                store,
                api: Arc::new(StubProviderApi::default()),
                alerts: Arc::new(RecordingAlerter::default()),
                emitter: Arc::new(RecordingEmitter::default()),
                integration: Arc::new(integration),
                user,
                plan,
                course,
            }
        }

        pub fn sync_manager(&self) -> ExternalServiceManager {
            let mut registry = ExternalServiceRegistry::new();
            registry.register(self.plan, self.integration.clone());
            ExternalServiceManager::new(self.store.clone(), Arc::new(registry), self.alerts.clone())
        }

        pub fn handler(&self) -> WebhookHandler {
            let dispatcher =
                PostWebhookDispatcher::new(self.store.clone(), self.sync_manager(), self.alerts.clone())
                    .with_event_emitter(self.emitter.clone());
            WebhookHandler::new(
                Arc::new(ProviderAdapter::new(self.api.clone())),
                self.store.clone(),
                dispatcher,
                self.alerts.clone(),
            )
        }

        pub fn put_subscription(&self, id: &str, state: &str) -> WireSubscription {
            let wire = WireSubscription {
                id: id.to_string(),
                account_code: self.user.to_string(),
                plan_code: "pro_monthly".to_string(),
                state: state.to_string(),
                current_term_ends_at: None,
                current_period_ends_at: None,
                affiliate_code: None,
                add_ons: Vec::new(),
            };
            self.api.put_subscription_wire(wire.clone());
            wire
        }

        pub fn put_invoice(&self, id: &str, charge: i64, credit: i64, skus: &[&str]) {
            let line_items = skus
                .iter()
                .enumerate()
                .map(|(i, sku)| WireLineItem {
                    id: format!("{}_li_{}", id, i),
                    origin: "plan".to_string(),
                    subscription_id: None,
                    description: None,
                    sku: Some(sku.to_string()),
                    amount_cents: charge,
                    quantity: 1,
                })
                .collect();
            self.api.put_invoice(WireInvoice {
                id: id.to_string(),
                account_code: self.user.to_string(),
                state: "paid".to_string(),
                charge_total_cents: charge,
                credit_total_cents: credit,
                currency: "USD".to_string(),
                closed_at: None,
                line_items,
            });
        }
    }

    pub fn subscription_event(kind: &str, id: &str) -> Vec<u8> {
        serde_json::json!({ "type": kind, "subscription": { "id": id } })
            .to_string()
            .into_bytes()
    }

    pub fn invoice_event(id: &str) -> Vec<u8> {
        serde_json::json!({ "type": "paid_charge_invoice_notification", "invoice": { "id": id } })
            .to_string()
            .into_bytes()
    }
}

#[cfg(test)]
mod invoice_tests {
    use super::fixtures::*;

    // =========================================================================
    // Credits larger than charges: stored total clamps at zero, no commission
    // =========================================================================
    #[tokio::test]
    async fn test_credit_exceeding_charge_stores_zero() {
        let h = Harness::new();
        h.put_invoice("inv_credit", 500, 700, &[]);

        let options = h
            .handler()
            .reconcile(&invoice_event("inv_credit"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(h.store.invoice("inv_credit").unwrap().total_cents, 0);
        assert!(options.affiliate_commission.is_none());
    }

    // =========================================================================
    // Only resolvers for categories present on the invoice are loaded
    // =========================================================================
    #[tokio::test]
    async fn test_only_needed_resolvers_load() {
        let h = Harness::new();
        let handler = h.handler();

        h.put_invoice("inv_empty", 0, 0, &[]);
        handler.reconcile(&invoice_event("inv_empty")).await.unwrap();
        assert_eq!(h.store.sku_bulk_loads(), 0);

        h.put_invoice("inv_course", 4900, 0, &["course_a"]);
        handler.reconcile(&invoice_event("inv_course")).await.unwrap();
        assert_eq!(h.store.sku_bulk_loads(), 1);
    }

    // =========================================================================
    // Wrapped envelope with a `uuid` object id
    // =========================================================================
    #[tokio::test]
    async fn test_wrapped_envelope_with_uuid() {
        let h = Harness::new();
        h.put_invoice("inv_9", 4900, 0, &["COURSE_A"]);

        let raw = br#"{"paid_charge_invoice_notification":{"invoice":{"uuid":"inv_9"}}}"#;
        let outcome = h.handler().handle_webhook(raw).await;

        assert!(outcome.success);
        assert_eq!(h.store.user_products(h.user).len(), 1);
        assert_eq!(h.store.user_products(h.user)[0].product_id, h.course);
    }

    // =========================================================================
    // Two deliveries of the same invoice in flight at once grant once
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_redelivery_grants_once() {
        let h = Harness::new();
        h.put_invoice("inv_1", 4900, 0, &["course_a"]);
        let handler = h.handler();
        let raw = invoice_event("inv_1");

        let (first, second) = tokio::join!(handler.handle_webhook(&raw), handler.handle_webhook(&raw));

        assert!(first.success && second.success);
        assert_eq!(h.store.invoice_count(), 1);
        assert_eq!(h.store.line_item_count(), 1);
        assert_eq!(h.store.user_products(h.user).len(), 1);
        assert_eq!(h.emitter.emitted().len(), 1);
    }
}

#[cfg(test)]
mod subscription_tests {
    use super::fixtures::*;
    use crate::provider::wire::WireAddOn;
    use crate::sku::SkuCategory;

    fn add_on(code: &str, quantity: i32) -> WireAddOn {
        WireAddOn {
            add_on_code: code.to_string(),
            add_on_type: "fixed".to_string(),
            unit_amount_cents: 500,
            quantity,
            revenue_schedule_type: Some("evenly".to_string()),
        }
    }

    // =========================================================================
    // Inactive -> active on a pro tier applies the tier effects on update
    // =========================================================================
    #[tokio::test]
    async fn test_reactivation_applies_tier_effects() {
        let h = Harness::new();
        h.store.seed_pending_range_tracking(h.user);
        let handler = h.handler();

        h.put_subscription("sub_1", "expired");
        handler
            .reconcile(&subscription_event("new_subscription_notification", "sub_1"))
            .await
            .unwrap();
        assert!(h.store.has_pending_range_tracking(h.user));

        h.put_subscription("sub_1", "active");
        let options = handler
            .reconcile(&subscription_event("reactivated_account_notification", "sub_1"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(options.events, vec!["Subscription Enabled".to_string()]);
        assert!(!h.store.has_pending_range_tracking(h.user));
        assert_eq!(options.services_to_update.len(), 1);
        assert!(options.services_to_update[0].activating);
    }

    // =========================================================================
    // Add-on rows are replaced wholesale, not diffed
    // =========================================================================
    #[tokio::test]
    async fn test_add_ons_replaced_on_update() {
        let h = Harness::new();
        let seat = h.store.add_add_on("Extra seat");
        let storage = h.store.add_add_on("Storage");
        h.store.add_sku(SkuCategory::AddOn, "extra_seat", seat);
        h.store.add_sku(SkuCategory::AddOn, "storage", storage);
        let handler = h.handler();

        let mut wire = h.put_subscription("sub_1", "active");
        wire.add_ons = vec![add_on("extra_seat", 2), add_on("storage", 1)];
        h.api.put_subscription_wire(wire.clone());
        handler
            .reconcile(&subscription_event("new_subscription_notification", "sub_1"))
            .await
            .unwrap();

        let record = h.store.user_subscription("sub_1").unwrap();
        assert_eq!(h.store.subscription_add_ons(record.id).len(), 2);

        wire.add_ons = vec![add_on("storage", 3)];
        h.api.put_subscription_wire(wire);
        handler
            .reconcile(&subscription_event("updated_subscription_notification", "sub_1"))
            .await
            .unwrap();

        let add_ons = h.store.subscription_add_ons(record.id);
        assert_eq!(add_ons.len(), 1);
        assert_eq!(add_ons[0].code, "storage");
        assert_eq!(add_ons[0].quantity, 3);
    }

    // =========================================================================
    // Cancelling -> cancelling is silent
    // =========================================================================
    #[tokio::test]
    async fn test_repeated_cancellation_is_silent() {
        let h = Harness::new();
        let handler = h.handler();
        h.put_subscription("sub_1", "canceled");
        handler
            .reconcile(&subscription_event("new_subscription_notification", "sub_1"))
            .await
            .unwrap();

        let options = handler
            .reconcile(&subscription_event("canceled_subscription_notification", "sub_1"))
            .await
            .unwrap()
            .unwrap();

        assert!(options.events.is_empty());
        assert!(h.alerts.messages().is_empty());
    }
}

#[cfg(test)]
mod sync_tests {
    use super::fixtures::*;
    use crate::subscription::ExternalSyncStatus;
    use crate::testing::CountingIntegration;

    // =========================================================================
    // A failed activation is attempted again by the next instruction
    // =========================================================================
    #[tokio::test]
    async fn test_failed_activation_is_retried() {
        let h = Harness::with_integration(CountingIntegration::failing());
        h.put_subscription("sub_1", "active");

        let options = h
            .handler()
            .reconcile(&subscription_event("new_subscription_notification", "sub_1"))
            .await
            .unwrap()
            .unwrap();
        let instruction = &options.services_to_update[0];
        let manager = h.sync_manager();

        assert!(!manager.update_external_service(instruction).await);
        assert!(!manager.update_external_service(instruction).await);
        assert_eq!(h.integration.activations(), 2);
        assert_eq!(
            h.store.user_subscription("sub_1").unwrap().external_sync_status,
            Some(ExternalSyncStatus::ActivationFailed)
        );
    }

    // =========================================================================
    // Sync failures never fail the webhook itself
    // =========================================================================
    #[tokio::test]
    async fn test_sync_failure_keeps_webhook_successful() {
        let h = Harness::with_integration(CountingIntegration::failing());
        h.put_subscription("sub_1", "active");

        let outcome = h
            .handler()
            .handle_webhook(&subscription_event("new_subscription_notification", "sub_1"))
            .await;

        assert!(outcome.success);
        let report = outcome.dispatch.unwrap();
        assert_eq!(report.services_failed, 1);
        assert!(h.store.user_subscription("sub_1").is_some());
    }
}
