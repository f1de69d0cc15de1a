//! Persistence contract for reconciliation
//!
//! Every webhook runs its primary reconciliation inside one
//! `BillingTransaction`. Dropping a transaction without calling `commit`
//! discards all of its writes. Upserts are keyed by provider external id so
//! redelivered events converge on the same rows.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::external::{RecordKind, SyncStatusOptions};
use crate::invoice::{Invoice, LineItem};
use crate::sku::{SkuCategory, SkuMapping};
use crate::subscription::{AddOn, ExternalSyncStatus, Subscription, SubscriptionStatus};
use crate::tiers::TierEffect;

pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;

/// Persisted invoice row
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct InvoiceRecord {
    pub id: Uuid,
    pub external_id: String,
    pub user_id: Uuid,
    pub total_cents: i64,
}

/// Persisted invoice item row
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct LineItemRecord {
    pub id: Uuid,
    pub external_id: String,
    pub invoice_id: Uuid,
}

/// Persisted user subscription row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSubscriptionRecord {
    pub id: Uuid,
    pub external_id: String,
    pub user_id: Uuid,
    /// Catalog subscription the row is linked to
    pub subscription_id: Uuid,
    pub sku: String,
    pub status: SubscriptionStatus,
    pub affiliate_code: Option<String>,
    pub external_sync_status: Option<ExternalSyncStatus>,
}

/// Catalog product / subscription / add-on
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct CatalogRecord {
    pub id: Uuid,
    pub name: String,
    pub requires_external_action: bool,
}

/// Opens reconciliation transactions
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn begin(&self) -> BillingResult<Box<dyn BillingTransaction>>;
}

/// Reads and writes performed while reconciling one webhook
#[async_trait]
pub trait BillingTransaction: Send {
    /// Serialize reconciliation of one provider object until commit
    async fn lock_external_id(&mut self, external_id: &str) -> BillingResult<()>;

    async fn user_exists(&mut self, user_id: Uuid) -> BillingResult<bool>;

    async fn get_user_email(&mut self, user_id: Uuid) -> BillingResult<Option<String>>;

    async fn load_sku_mappings(&mut self, category: SkuCategory) -> BillingResult<Vec<SkuMapping>>;

    /// `sku` is already canonical (lower case)
    async fn find_sku_mapping(
        &mut self,
        category: SkuCategory,
        sku: &str,
    ) -> BillingResult<Option<SkuMapping>>;

    async fn get_catalog_record(
        &mut self,
        category: SkuCategory,
        id: Uuid,
    ) -> BillingResult<Option<CatalogRecord>>;

    /// Upsert by external id
    async fn store_invoice(&mut self, invoice: &Invoice) -> BillingResult<InvoiceRecord>;

    /// Upsert by external id. The mapping is linked into the column matching
    /// the item's category; `None` leaves the link null.
    async fn store_line_item(
        &mut self,
        invoice_id: Uuid,
        item: &LineItem,
        mapping: Option<&SkuMapping>,
    ) -> BillingResult<LineItemRecord>;

    /// Fill `stored_id` on items that already have a row; others are left untouched
    async fn get_invoice_item_ids_for_line_items(
        &mut self,
        items: &mut [LineItem],
    ) -> BillingResult<()>;

    async fn user_product_exists(
        &mut self,
        user_id: Uuid,
        product_id: Uuid,
        invoice_item_id: Uuid,
    ) -> BillingResult<bool>;

    async fn grant_user_product(
        &mut self,
        user_id: Uuid,
        product_id: Uuid,
        invoice_item_id: Uuid,
        sync_status: Option<ExternalSyncStatus>,
    ) -> BillingResult<Uuid>;

    async fn get_user_subscription_record(
        &mut self,
        external_id: &str,
    ) -> BillingResult<Option<UserSubscriptionRecord>>;

    async fn store_user_subscription(
        &mut self,
        subscription: &Subscription,
        catalog_id: Uuid,
    ) -> BillingResult<UserSubscriptionRecord>;

    async fn update_user_subscription(
        &mut self,
        record_id: Uuid,
        subscription: &Subscription,
        catalog_id: Uuid,
    ) -> BillingResult<UserSubscriptionRecord>;

    /// Delete every add-on row of the subscription, then insert `add_ons`
    async fn replace_subscription_add_ons(
        &mut self,
        record_id: Uuid,
        add_ons: &[AddOn],
    ) -> BillingResult<()>;

    /// Affiliate code on the user's most recently updated subscription
    async fn latest_affiliate_code(&mut self, user_id: Uuid) -> BillingResult<Option<String>>;

    async fn apply_tier_effect(&mut self, user_id: Uuid, effect: TierEffect) -> BillingResult<()>;

    async fn get_sync_status(
        &mut self,
        kind: RecordKind,
        record_id: Uuid,
    ) -> BillingResult<Option<ExternalSyncStatus>>;

    async fn set_sync_status(&mut self, options: &SyncStatusOptions) -> BillingResult<()>;

    async fn commit(self: Box<Self>) -> BillingResult<()>;
}
