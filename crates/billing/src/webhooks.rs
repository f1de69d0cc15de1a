//! Billing webhook reconciliation
//!
//! Turns one provider notification into persisted billing state. Invoice
//! events store the invoice and its line items and grant purchased
//! products; subscription events create or update the user's subscription
//! row and its add-ons. Everything the event changes is written in a single
//! transaction; external provisioning, affiliate commission and analytics
//! run afterwards through the dispatcher.

use std::sync::Arc;

use uuid::Uuid;

use crate::alerting::{AlertChannel, AlertSink};
use crate::dispatch::{AffiliateCommission, DispatchReport, PostWebhookDispatcher, PostWebhookOptions};
use crate::engine::{BillingProvider, EventKind, WebhookEngine};
use crate::error::{BillingError, BillingResult};
use crate::external::{ExternalServiceToUpdate, RecordKind};
use crate::invoice::{Invoice, LineItem};
use crate::permissions::PermissionConflict;
use crate::sku::{
    AddOnSkuManager, CatalogKind, ProductSkuManager, SkuCategory, SkuManager,
    SubscriptionSkuManager,
};
use crate::store::{BillingStore, BillingTransaction, InvoiceRecord, UserSubscriptionRecord};
use crate::subscription::{ExternalSyncStatus, StatusTransition, Subscription};
use crate::tiers::effects_for_sku;

/// Result of handling one webhook. Never an error: failures are logged,
/// alerted and reported through `success`.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookOutcome {
    pub success: bool,
    pub event_kind: Option<EventKind>,
    pub error: Option<String>,
    pub dispatch: Option<DispatchReport>,
}

impl WebhookOutcome {
    fn failed(event_kind: Option<EventKind>, error: &BillingError) -> Self {
        Self {
            success: false,
            event_kind,
            error: Some(error.to_string()),
            dispatch: None,
        }
    }
}

/// Invoice state carried from `invoice_handler` to `product_handler`
struct InvoiceContext {
    invoice: Invoice,
    record: InvoiceRecord,
    products: ProductSkuManager,
}

/// Webhook handler for billing provider notifications
pub struct WebhookHandler {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn BillingStore>,
    dispatcher: PostWebhookDispatcher,
    alerts: Arc<dyn AlertSink>,
    conflicts: Option<PermissionConflict>,
}

impl WebhookHandler {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn BillingStore>,
        dispatcher: PostWebhookDispatcher,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            provider,
            store,
            dispatcher,
            alerts,
            conflicts: None,
        }
    }

    pub fn with_permission_conflicts(mut self, conflicts: PermissionConflict) -> Self {
        self.conflicts = Some(conflicts);
        self
    }

    /// Reconcile one raw notification and run its side effects
    pub async fn handle_webhook(&self, raw: &[u8]) -> WebhookOutcome {
        let event_kind = self.provider.classify(raw).ok();

        match self.reconcile(raw).await {
            Ok(Some(options)) => {
                let report = self.dispatcher.dispatch(&options).await;
                WebhookOutcome {
                    success: true,
                    event_kind,
                    error: None,
                    dispatch: Some(report),
                }
            }
            Ok(None) => {
                tracing::debug!(
                    event_kind = ?event_kind,
                    "Ignoring billing notification"
                );
                WebhookOutcome {
                    success: false,
                    event_kind,
                    error: None,
                    dispatch: None,
                }
            }
            Err(e) => {
                tracing::error!(
                    event_kind = ?event_kind,
                    error = %e,
                    "Billing webhook failed"
                );
                if !e.is_failed_to_complete() {
                    self.alerts
                        .notify(AlertChannel::WebhookFailure, &e.to_string())
                        .await;
                }
                WebhookOutcome::failed(event_kind, &e)
            }
        }
    }

    /// Primary reconciliation only. `None` for notifications that are not
    /// reconciled.
    pub async fn reconcile(&self, raw: &[u8]) -> BillingResult<Option<PostWebhookOptions>> {
        let engine = self.provider.engine_for(raw)?;
        let kind = engine.event_kind().clone();

        tracing::info!(
            event_kind = %kind,
            external_id = ?engine.external_id(),
            "Processing billing webhook"
        );

        if kind.is_invoice_event() {
            self.reconcile_invoice(engine.as_ref()).await.map(Some)
        } else if kind.is_subscription_event() {
            self.reconcile_subscription(engine.as_ref()).await.map(Some)
        } else {
            Ok(None)
        }
    }

    async fn reconcile_invoice(&self, engine: &dyn WebhookEngine) -> BillingResult<PostWebhookOptions> {
        let invoice = engine.fetch_invoice().await?;
        let user_id = invoice.user_id();
        let before = self.conflict_snapshot(user_id).await;

        let mut tx = self.store.begin().await?;
        tx.lock_external_id(invoice.external_id()).await?;

        let mut options = PostWebhookOptions::for_user(user_id);
        let mut ctx = self.invoice_handler(tx.as_mut(), engine).await?;
        self.product_handler(tx.as_mut(), &mut ctx, &mut options).await?;

        let net_total = ctx.invoice.net_total_cents();
        if net_total > 0 {
            options.affiliate_commission = Some(AffiliateCommission {
                invoice_id: ctx.invoice.external_id().to_string(),
                user_id,
                amount_cents: net_total,
                currency: ctx.invoice.currency().to_string(),
                affiliate_code: tx.latest_affiliate_code(user_id).await?,
            });
        }

        tx.commit().await?;

        tracing::info!(
            invoice_id = %ctx.invoice.external_id(),
            user_id = %user_id,
            line_items = ctx.invoice.line_item_count(),
            grants = options.events.len(),
            "Invoice reconciled"
        );

        self.conflict_diff(user_id, before).await;
        Ok(options)
    }

    async fn reconcile_subscription(
        &self,
        engine: &dyn WebhookEngine,
    ) -> BillingResult<PostWebhookOptions> {
        let subscription = engine.fetch_subscription().await?;
        let user_id = subscription.user_id();
        let before = self.conflict_snapshot(user_id).await;

        let mut tx = self.store.begin().await?;
        tx.lock_external_id(subscription.external_id()).await?;

        let mut options = PostWebhookOptions::for_user(user_id);
        self.handle_subscription(tx.as_mut(), engine, &mut options)
            .await?;
        tx.commit().await?;

        self.conflict_diff(user_id, before).await;
        Ok(options)
    }

    async fn require_user(&self, tx: &mut dyn BillingTransaction, user_id: Uuid, context: &str) -> BillingResult<()> {
        if tx.user_exists(user_id).await? {
            return Ok(());
        }
        let message = format!("User {} referenced by {} does not exist", user_id, context);
        self.alerts.notify(AlertChannel::MissingUser, &message).await;
        Err(BillingError::failed_to_complete(message))
    }

    /// Store the invoice and every line item
    async fn invoice_handler(
        &self,
        tx: &mut dyn BillingTransaction,
        engine: &dyn WebhookEngine,
    ) -> BillingResult<InvoiceContext> {
        let invoice = engine.fetch_invoice().await?;
        self.require_user(tx, invoice.user_id(), &format!("invoice {}", invoice.external_id()))
            .await?;

        let record = tx.store_invoice(&invoice).await?;

        let mut subscriptions = SubscriptionSkuManager::new();
        let mut products = ProductSkuManager::new();
        let mut add_ons = AddOnSkuManager::new();
        if invoice.has_subscription_items() {
            subscriptions.fetch_all_skus(tx).await?;
        }
        if invoice.has_product_items() {
            products.fetch_all_skus(tx).await?;
        }
        if invoice.has_add_on_items() {
            add_ons.fetch_all_skus(tx).await?;
        }

        // Storage order is fixed: subscription, product, add-on
        self.store_line_items(tx, &record, invoice.subscription_items(), &subscriptions)
            .await?;
        self.store_line_items(tx, &record, invoice.product_items(), &products)
            .await?;
        self.store_line_items(tx, &record, invoice.add_on_items(), &add_ons)
            .await?;

        Ok(InvoiceContext {
            invoice,
            record,
            products,
        })
    }

    async fn store_line_items<C: CatalogKind>(
        &self,
        tx: &mut dyn BillingTransaction,
        invoice: &InvoiceRecord,
        items: &[LineItem],
        resolver: &SkuManager<C>,
    ) -> BillingResult<()> {
        for item in items {
            let mapping = match item.sku.as_deref() {
                Some(sku) => {
                    let mapping = resolver.get_mapping_for_sku(sku)?.cloned();
                    if mapping.is_none() {
                        tracing::warn!(
                            invoice_id = %invoice.external_id,
                            line_item = %item.external_id,
                            sku = %sku,
                            "No SKU mapping for invoice line item"
                        );
                        self.alerts
                            .notify(
                                AlertChannel::MissingSkuMapping,
                                &format!(
                                    "Invoice {} line item {} has unmapped {} SKU '{}'",
                                    invoice.external_id,
                                    item.external_id,
                                    resolver.category(),
                                    sku
                                ),
                            )
                            .await;
                    }
                    mapping
                }
                None => None,
            };

            tx.store_line_item(invoice.id, item, mapping.as_ref()).await?;
        }
        Ok(())
    }

    /// Grant products bought on the invoice
    async fn product_handler(
        &self,
        tx: &mut dyn BillingTransaction,
        ctx: &mut InvoiceContext,
        options: &mut PostWebhookOptions,
    ) -> BillingResult<()> {
        if !ctx.invoice.has_product_items() {
            return Ok(());
        }

        let user_id = ctx.invoice.user_id();
        tx.get_invoice_item_ids_for_line_items(ctx.invoice.product_items_mut())
            .await?;

        for item in ctx.invoice.product_items() {
            let Some(sku) = item.sku.as_deref() else {
                continue;
            };
            let Some(product_id) = ctx.products.get_target_id_by_sku(sku)? else {
                continue;
            };
            let Some(invoice_item_id) = item.stored_id else {
                tracing::warn!(
                    invoice_id = %ctx.record.external_id,
                    line_item = %item.external_id,
                    "Stored invoice item not found for product grant"
                );
                continue;
            };

            if tx
                .user_product_exists(user_id, product_id, invoice_item_id)
                .await?
            {
                continue;
            }

            let product = tx
                .get_catalog_record(SkuCategory::Product, product_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("Product {}", product_id)))?;

            let sync_status = product
                .requires_external_action
                .then_some(ExternalSyncStatus::ActionRequired);
            let record_id = tx
                .grant_user_product(user_id, product_id, invoice_item_id, sync_status)
                .await?;

            tracing::info!(
                user_id = %user_id,
                product = %product.name,
                "Granted product"
            );
            options.events.push(format!("Purchased {}", product.name));

            if product.requires_external_action {
                options.services_to_update.push(ExternalServiceToUpdate {
                    service_id: product_id,
                    record_kind: RecordKind::UserProduct,
                    record_id,
                    user_id,
                    activating: true,
                });
            }
        }
        Ok(())
    }

    /// Create or update the user's subscription row and its add-ons
    async fn handle_subscription(
        &self,
        tx: &mut dyn BillingTransaction,
        engine: &dyn WebhookEngine,
        options: &mut PostWebhookOptions,
    ) -> BillingResult<()> {
        let mut subscription = engine.fetch_subscription().await?;
        let user_id = subscription.user_id();
        self.require_user(
            tx,
            user_id,
            &format!("subscription {}", subscription.external_id()),
        )
        .await?;

        let existing = tx
            .get_user_subscription_record(subscription.external_id())
            .await?;

        let resolver = SubscriptionSkuManager::new();
        let Some(mapping) = resolver.fetch_one(tx, subscription.sku()).await? else {
            return Err(self
                .unmapped(SkuCategory::Subscription, subscription.sku(), subscription.external_id())
                .await);
        };
        self.resolve_add_ons(tx, &mut subscription).await?;

        let plan = tx
            .get_catalog_record(SkuCategory::Subscription, mapping.target_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("Subscription plan {}", mapping.target_id))
            })?;

        let record = match existing {
            None => {
                if plan.requires_external_action {
                    subscription.set_external_sync_status(Some(ExternalSyncStatus::ActionRequired));
                }
                let record = tx.store_user_subscription(&subscription, plan.id).await?;
                if subscription.is_active() {
                    self.apply_tier_effects(tx, &subscription).await?;
                }
                tracing::info!(
                    subscription_id = %subscription.external_id(),
                    user_id = %user_id,
                    status = %subscription.status(),
                    "Created user subscription"
                );
                record
            }
            Some(previous) => self.update_subscription(tx, &mut subscription, previous, plan.id, options).await?,
        };

        tx.replace_subscription_add_ons(record.id, subscription.add_ons())
            .await?;

        if plan.requires_external_action && !subscription.is_in_sync() {
            options.services_to_update.push(ExternalServiceToUpdate {
                service_id: plan.id,
                record_kind: RecordKind::UserSubscription,
                record_id: record.id,
                user_id,
                activating: subscription.is_active(),
            });
        }
        Ok(())
    }

    async fn update_subscription(
        &self,
        tx: &mut dyn BillingTransaction,
        subscription: &mut Subscription,
        previous: UserSubscriptionRecord,
        plan_id: Uuid,
        options: &mut PostWebhookOptions,
    ) -> BillingResult<UserSubscriptionRecord> {
        subscription.set_external_sync_status(previous.external_sync_status);
        let record = tx
            .update_user_subscription(previous.id, subscription, plan_id)
            .await?;

        let Some(transition) = StatusTransition::between(previous.status, subscription.status()) else {
            return Ok(record);
        };

        tracing::info!(
            subscription_id = %subscription.external_id(),
            user_id = %subscription.user_id(),
            from = %previous.status,
            to = %subscription.status(),
            "Subscription status changed"
        );
        self.alerts
            .notify(
                AlertChannel::SubscriptionChange,
                &format!(
                    "Subscription {} ({}) for user {}: {}",
                    subscription.external_id(),
                    subscription.sku(),
                    subscription.user_id(),
                    transition.label()
                ),
            )
            .await;
        options
            .events
            .push(format!("Subscription {}", transition.label()));

        if transition == StatusTransition::Enabled {
            self.apply_tier_effects(tx, subscription).await?;
        }
        Ok(record)
    }

    /// Every add-on must map to a catalog add-on
    async fn resolve_add_ons(
        &self,
        tx: &mut dyn BillingTransaction,
        subscription: &mut Subscription,
    ) -> BillingResult<()> {
        if subscription.add_ons().is_empty() {
            return Ok(());
        }

        let mut resolver = AddOnSkuManager::new();
        resolver.fetch_all_skus(tx).await?;

        let external_id = subscription.external_id().to_string();
        for add_on in subscription.add_ons_mut() {
            match resolver.get_target_id_by_sku(&add_on.code)? {
                Some(record_id) => add_on.resolve(record_id),
                None => {
                    return Err(self
                        .unmapped(SkuCategory::AddOn, &add_on.code, &external_id)
                        .await)
                }
            }
        }
        Ok(())
    }

    async fn unmapped(&self, category: SkuCategory, sku: &str, subscription_id: &str) -> BillingError {
        let err = BillingError::UnmappedSku {
            category,
            sku: sku.to_string(),
        };
        let message = format!("Subscription {}: {}", subscription_id, err);
        self.alerts
            .notify(AlertChannel::MissingSkuMapping, &message)
            .await;
        BillingError::failed_to_complete(message)
    }

    async fn apply_tier_effects(
        &self,
        tx: &mut dyn BillingTransaction,
        subscription: &Subscription,
    ) -> BillingResult<()> {
        for effect in effects_for_sku(subscription.sku()) {
            tracing::debug!(
                user_id = %subscription.user_id(),
                effect = ?effect,
                "Applying tier effect"
            );
            tx.apply_tier_effect(subscription.user_id(), *effect).await?;
        }
        Ok(())
    }

    async fn conflict_snapshot(&self, user_id: Uuid) -> Option<bool> {
        let conflicts = self.conflicts.as_ref()?;
        match conflicts.snapshot(user_id).await {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Permission snapshot failed");
                None
            }
        }
    }

    async fn conflict_diff(&self, user_id: Uuid, before: Option<bool>) {
        let (Some(conflicts), Some(before)) = (self.conflicts.as_ref(), before) else {
            return;
        };
        if let Err(e) = conflicts.notify_if_changed(user_id, before).await {
            tracing::warn!(user_id = %user_id, error = %e, "Permission conflict check failed");
        }
    }
}
