//! PostgreSQL billing store

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{
    BillingStore, BillingTransaction, CatalogRecord, InvoiceRecord, LineItemRecord,
    UserSubscriptionRecord,
};
use crate::error::{BillingError, BillingResult};
use crate::external::{RecordKind, SyncStatusOptions};
use crate::invoice::{Invoice, LineItem, LineItemKind};
use crate::sku::{SkuCategory, SkuMapping};
use crate::subscription::{AddOn, ExternalSyncStatus, Subscription, SubscriptionStatus};
use crate::tiers::TierEffect;

fn sku_table(category: SkuCategory) -> &'static str {
    match category {
        SkuCategory::Product => "product_skus",
        SkuCategory::Subscription => "subscription_skus",
        SkuCategory::AddOn => "add_on_skus",
    }
}

fn catalog_table(category: SkuCategory) -> &'static str {
    match category {
        SkuCategory::Product => "catalog_products",
        SkuCategory::Subscription => "catalog_subscriptions",
        SkuCategory::AddOn => "catalog_add_ons",
    }
}

fn record_table(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::UserProduct => "user_products",
        RecordKind::UserSubscription => "user_subscriptions",
    }
}

#[derive(sqlx::FromRow)]
struct SkuRow {
    id: Uuid,
    sku: String,
    target_id: Uuid,
}

impl From<SkuRow> for SkuMapping {
    fn from(row: SkuRow) -> Self {
        SkuMapping::new(&row.sku, row.id, row.target_id)
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    external_id: String,
    user_id: Uuid,
    subscription_id: Uuid,
    sku: String,
    status: String,
    affiliate_code: Option<String>,
    external_sync_status: Option<String>,
}

impl TryFrom<SubscriptionRow> for UserSubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        Ok(UserSubscriptionRecord {
            id: row.id,
            external_id: row.external_id,
            user_id: row.user_id,
            subscription_id: row.subscription_id,
            sku: row.sku,
            status: SubscriptionStatus::parse(&row.status)?,
            affiliate_code: row.affiliate_code,
            external_sync_status: row
                .external_sync_status
                .as_deref()
                .map(ExternalSyncStatus::parse)
                .transpose()?,
        })
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, external_id, user_id, subscription_id, sku, status, \
                                    affiliate_code, external_sync_status";

/// `BillingStore` over a Postgres pool
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Catalog ids flagged for external action, used to validate the
    /// integration registry at startup
    pub async fn catalog_ids_requiring_action(&self) -> BillingResult<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM catalog_products WHERE requires_external_action
            UNION ALL
            SELECT id FROM catalog_subscriptions WHERE requires_external_action
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn begin(&self) -> BillingResult<Box<dyn BillingTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl BillingTransaction for PgTransaction {
    async fn lock_external_id(&mut self, external_id: &str) -> BillingResult<()> {
        // Released automatically at commit or rollback
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(external_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn user_exists(&mut self, user_id: Uuid) -> BillingResult<bool> {
        let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)")
            .bind(user_id)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(exists.0)
    }

    async fn get_user_email(&mut self, user_id: Uuid) -> BillingResult<Option<String>> {
        let email: Option<(String,)> = sqlx::query_as("SELECT email FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(email.map(|(e,)| e))
    }

    async fn load_sku_mappings(&mut self, category: SkuCategory) -> BillingResult<Vec<SkuMapping>> {
        let rows: Vec<SkuRow> = sqlx::query_as(&format!(
            "SELECT id, sku, target_id FROM {}",
            sku_table(category)
        ))
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(SkuMapping::from).collect())
    }

    async fn find_sku_mapping(
        &mut self,
        category: SkuCategory,
        sku: &str,
    ) -> BillingResult<Option<SkuMapping>> {
        let row: Option<SkuRow> = sqlx::query_as(&format!(
            "SELECT id, sku, target_id FROM {} WHERE LOWER(sku) = $1",
            sku_table(category)
        ))
        .bind(sku)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(SkuMapping::from))
    }

    async fn get_catalog_record(
        &mut self,
        category: SkuCategory,
        id: Uuid,
    ) -> BillingResult<Option<CatalogRecord>> {
        let record: Option<CatalogRecord> = sqlx::query_as(&format!(
            "SELECT id, name, requires_external_action FROM {} WHERE id = $1",
            catalog_table(category)
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(record)
    }

    async fn store_invoice(&mut self, invoice: &Invoice) -> BillingResult<InvoiceRecord> {
        let record: InvoiceRecord = sqlx::query_as(
            r#"
            INSERT INTO invoices
                (external_id, user_id, state, charge_cents, credit_cents, total_cents, currency, closed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (external_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                state = EXCLUDED.state,
                charge_cents = EXCLUDED.charge_cents,
                credit_cents = EXCLUDED.credit_cents,
                total_cents = EXCLUDED.total_cents,
                currency = EXCLUDED.currency,
                closed_at = EXCLUDED.closed_at,
                updated_at = NOW()
            RETURNING id, external_id, user_id, total_cents
            "#,
        )
        .bind(invoice.external_id())
        .bind(invoice.user_id())
        .bind(invoice.state().as_str())
        .bind(invoice.charge_cents())
        .bind(invoice.credit_cents())
        .bind(invoice.net_total_cents())
        .bind(invoice.currency())
        .bind(invoice.closed_at())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(record)
    }

    async fn store_line_item(
        &mut self,
        invoice_id: Uuid,
        item: &LineItem,
        mapping: Option<&SkuMapping>,
    ) -> BillingResult<LineItemRecord> {
        let mapping_id = mapping.map(|m| m.mapping_id);
        let (product_sku, subscription_sku, add_on_sku) = match item.kind() {
            LineItemKind::Product => (mapping_id, None, None),
            LineItemKind::Subscription => (None, mapping_id, None),
            LineItemKind::AddOn => (None, None, mapping_id),
        };

        let record: LineItemRecord = sqlx::query_as(
            r#"
            INSERT INTO invoice_items
                (external_id, invoice_id, subscription_external_id, description, sku,
                 total_cents, quantity, origin, product_sku_id, subscription_sku_id, add_on_sku_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (external_id) DO UPDATE SET
                invoice_id = EXCLUDED.invoice_id,
                subscription_external_id = EXCLUDED.subscription_external_id,
                description = EXCLUDED.description,
                sku = EXCLUDED.sku,
                total_cents = EXCLUDED.total_cents,
                quantity = EXCLUDED.quantity,
                origin = EXCLUDED.origin,
                product_sku_id = EXCLUDED.product_sku_id,
                subscription_sku_id = EXCLUDED.subscription_sku_id,
                add_on_sku_id = EXCLUDED.add_on_sku_id,
                updated_at = NOW()
            RETURNING id, external_id, invoice_id
            "#,
        )
        .bind(&item.external_id)
        .bind(invoice_id)
        .bind(item.subscription_id.as_deref())
        .bind(&item.description)
        .bind(item.sku.as_deref())
        .bind(item.total_cents)
        .bind(item.quantity)
        .bind(item.origin.as_str())
        .bind(product_sku)
        .bind(subscription_sku)
        .bind(add_on_sku)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(record)
    }

    async fn get_invoice_item_ids_for_line_items(
        &mut self,
        items: &mut [LineItem],
    ) -> BillingResult<()> {
        if items.is_empty() {
            return Ok(());
        }

        let external_ids: Vec<String> = items.iter().map(|i| i.external_id.clone()).collect();
        let rows: Vec<(Uuid, String)> =
            sqlx::query_as("SELECT id, external_id FROM invoice_items WHERE external_id = ANY($1)")
                .bind(&external_ids)
                .fetch_all(&mut *self.tx)
                .await?;

        for item in items.iter_mut() {
            if let Some((id, _)) = rows.iter().find(|(_, ext)| *ext == item.external_id) {
                item.stored_id = Some(*id);
            }
        }
        Ok(())
    }

    async fn user_product_exists(
        &mut self,
        user_id: Uuid,
        product_id: Uuid,
        invoice_item_id: Uuid,
    ) -> BillingResult<bool> {
        let exists: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM user_products
                WHERE user_id = $1 AND product_id = $2 AND invoice_item_id = $3
            )
            "#,
        )
        .bind(user_id)
        .bind(product_id)
        .bind(invoice_item_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(exists.0)
    }

    async fn grant_user_product(
        &mut self,
        user_id: Uuid,
        product_id: Uuid,
        invoice_item_id: Uuid,
        sync_status: Option<ExternalSyncStatus>,
    ) -> BillingResult<Uuid> {
        // The no-op update makes RETURNING yield the existing row on conflict
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO user_products (user_id, product_id, invoice_item_id, external_sync_status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, product_id, invoice_item_id) DO UPDATE SET
                user_id = EXCLUDED.user_id
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(product_id)
        .bind(invoice_item_id)
        .bind(sync_status.map(|s| s.as_str()))
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn get_user_subscription_record(
        &mut self,
        external_id: &str,
    ) -> BillingResult<Option<UserSubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM user_subscriptions WHERE external_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(external_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(UserSubscriptionRecord::try_from).transpose()
    }

    async fn store_user_subscription(
        &mut self,
        subscription: &Subscription,
        catalog_id: Uuid,
    ) -> BillingResult<UserSubscriptionRecord> {
        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO user_subscriptions
                (external_id, user_id, subscription_id, sku, status, term_ends_at,
                 current_period_ends_at, affiliate_code, external_sync_status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (external_id) DO UPDATE SET
                subscription_id = EXCLUDED.subscription_id,
                sku = EXCLUDED.sku,
                status = EXCLUDED.status,
                term_ends_at = EXCLUDED.term_ends_at,
                current_period_ends_at = EXCLUDED.current_period_ends_at,
                affiliate_code = COALESCE(EXCLUDED.affiliate_code, user_subscriptions.affiliate_code),
                updated_at = NOW()
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription.external_id())
        .bind(subscription.user_id())
        .bind(catalog_id)
        .bind(subscription.sku())
        .bind(subscription.status().as_str())
        .bind(subscription.term_ends_at())
        .bind(subscription.current_period_ends_at())
        .bind(subscription.affiliate_code())
        .bind(subscription.external_sync_status().map(|s| s.as_str()))
        .fetch_one(&mut *self.tx)
        .await?;
        row.try_into()
    }

    async fn update_user_subscription(
        &mut self,
        record_id: Uuid,
        subscription: &Subscription,
        catalog_id: Uuid,
    ) -> BillingResult<UserSubscriptionRecord> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE user_subscriptions SET
                subscription_id = $2,
                sku = $3,
                status = $4,
                term_ends_at = $5,
                current_period_ends_at = $6,
                affiliate_code = COALESCE($7, affiliate_code),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(record_id)
        .bind(catalog_id)
        .bind(subscription.sku())
        .bind(subscription.status().as_str())
        .bind(subscription.term_ends_at())
        .bind(subscription.current_period_ends_at())
        .bind(subscription.affiliate_code())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.ok_or_else(|| {
            BillingError::NotFound(format!("User subscription {}", record_id))
        })?
        .try_into()
    }

    async fn replace_subscription_add_ons(
        &mut self,
        record_id: Uuid,
        add_ons: &[AddOn],
    ) -> BillingResult<()> {
        sqlx::query("DELETE FROM user_subscription_add_ons WHERE user_subscription_id = $1")
            .bind(record_id)
            .execute(&mut *self.tx)
            .await?;

        for add_on in add_ons {
            sqlx::query(
                r#"
                INSERT INTO user_subscription_add_ons
                    (user_subscription_id, add_on_id, add_on_type, code, unit_amount_cents,
                     quantity, revenue_schedule_type)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(record_id)
            .bind(add_on.record_id()?)
            .bind(add_on.add_on_type.as_str())
            .bind(&add_on.code)
            .bind(add_on.unit_amount_cents)
            .bind(add_on.quantity)
            .bind(add_on.revenue_schedule_type.map(|r| r.as_str()))
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn latest_affiliate_code(&mut self, user_id: Uuid) -> BillingResult<Option<String>> {
        let code: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT affiliate_code FROM user_subscriptions
            WHERE user_id = $1 AND affiliate_code IS NOT NULL
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(code.map(|(c,)| c))
    }

    async fn apply_tier_effect(&mut self, user_id: Uuid, effect: TierEffect) -> BillingResult<()> {
        match effect {
            TierEffect::ClearPendingRangeTracking => {
                sqlx::query("DELETE FROM pending_range_tracking WHERE user_id = $1")
                    .bind(user_id)
                    .execute(&mut *self.tx)
                    .await?;
            }
            TierEffect::SetUserMeta(key) => {
                sqlx::query(
                    r#"
                    INSERT INTO user_meta (user_id, meta_key, meta_value)
                    VALUES ($1, $2, 'true')
                    ON CONFLICT (user_id, meta_key) DO UPDATE SET
                        meta_value = 'true',
                        updated_at = NOW()
                    "#,
                )
                .bind(user_id)
                .bind(key)
                .execute(&mut *self.tx)
                .await?;
            }
            TierEffect::ClearUserMeta(key) => {
                sqlx::query("DELETE FROM user_meta WHERE user_id = $1 AND meta_key = $2")
                    .bind(user_id)
                    .bind(key)
                    .execute(&mut *self.tx)
                    .await?;
            }
            TierEffect::EnableProjectTracking => {
                sqlx::query(
                    r#"
                    INSERT INTO project_tracking (user_id, enabled)
                    VALUES ($1, TRUE)
                    ON CONFLICT (user_id) DO UPDATE SET
                        enabled = TRUE,
                        updated_at = NOW()
                    "#,
                )
                .bind(user_id)
                .execute(&mut *self.tx)
                .await?;
            }
        }
        Ok(())
    }

    async fn get_sync_status(
        &mut self,
        kind: RecordKind,
        record_id: Uuid,
    ) -> BillingResult<Option<ExternalSyncStatus>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(&format!(
            "SELECT external_sync_status FROM {} WHERE id = $1",
            record_table(kind)
        ))
        .bind(record_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        let (status,) = row.ok_or_else(|| {
            BillingError::NotFound(format!("{} {}", record_table(kind), record_id))
        })?;
        status.as_deref().map(ExternalSyncStatus::parse).transpose()
    }

    async fn set_sync_status(&mut self, options: &SyncStatusOptions) -> BillingResult<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET external_sync_status = $1 WHERE id = $2",
            record_table(options.record_kind)
        ))
        .bind(options.status().as_str())
        .bind(options.record_id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "{} {}",
                record_table(options.record_kind),
                options.record_id
            )));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
