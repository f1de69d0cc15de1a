//! In-memory billing store
//!
//! Used by the test suite and by the API when started without a database.
//! A transaction works on a private copy of the state taken at `begin`. On
//! `commit` only the rows it changed relative to that copy are applied to
//! the current shared state, so transactions touching different rows never
//! overwrite each other. Dropping it discards the copy.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::{
    BillingStore, BillingTransaction, CatalogRecord, InvoiceRecord, LineItemRecord,
    UserSubscriptionRecord,
};
use crate::error::{BillingError, BillingResult};
use crate::external::{RecordKind, SyncStatusOptions};
use crate::invoice::{Invoice, LineItem, LineItemKind};
use crate::sku::{SkuCategory, SkuMapping};
use crate::subscription::{AddOn, ExternalSyncStatus, Subscription};
use crate::tiers::TierEffect;

/// Stored user product grant
#[derive(Debug, Clone, PartialEq)]
pub struct UserProductRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub product_id: Uuid,
    pub invoice_item_id: Uuid,
    pub external_sync_status: Option<ExternalSyncStatus>,
}

#[derive(Debug, Clone, PartialEq)]
struct LineItemRow {
    record: LineItemRecord,
    sku_link: Option<(LineItemKind, Uuid)>,
}

#[derive(Debug, Clone, PartialEq)]
struct SubscriptionRow {
    record: UserSubscriptionRecord,
    updated_seq: u64,
}

#[derive(Debug, Clone, Default)]
struct State {
    users: HashMap<Uuid, String>,
    user_meta: HashMap<(Uuid, String), String>,
    catalog: HashMap<(SkuCategory, Uuid), CatalogRecord>,
    sku_mappings: Vec<(SkuCategory, SkuMapping)>,
    invoices: HashMap<String, InvoiceRecord>,
    line_items: HashMap<String, LineItemRow>,
    user_products: Vec<UserProductRow>,
    subscriptions: HashMap<String, SubscriptionRow>,
    subscription_add_ons: HashMap<Uuid, Vec<AddOn>>,
    pending_range_tracking: HashSet<Uuid>,
    project_tracking: HashMap<Uuid, bool>,
    seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn subscription_by_id(&mut self, record_id: Uuid) -> BillingResult<&mut SubscriptionRow> {
        self.subscriptions
            .values_mut()
            .find(|row| row.record.id == record_id)
            .ok_or_else(|| BillingError::NotFound(format!("User subscription {}", record_id)))
    }

    fn user_product_by_id(&mut self, record_id: Uuid) -> BillingResult<&mut UserProductRow> {
        self.user_products
            .iter_mut()
            .find(|row| row.id == record_id)
            .ok_or_else(|| BillingError::NotFound(format!("User product {}", record_id)))
    }

    /// Apply the rows `mine` changed relative to `base` onto `self`
    fn merge_changes(&mut self, base: &State, mine: &State) {
        merge_map(&mut self.users, &base.users, &mine.users);
        merge_map(&mut self.user_meta, &base.user_meta, &mine.user_meta);
        merge_map(&mut self.catalog, &base.catalog, &mine.catalog);
        merge_map(&mut self.invoices, &base.invoices, &mine.invoices);
        merge_map(&mut self.line_items, &base.line_items, &mine.line_items);
        merge_map(&mut self.subscriptions, &base.subscriptions, &mine.subscriptions);
        merge_map(
            &mut self.subscription_add_ons,
            &base.subscription_add_ons,
            &mine.subscription_add_ons,
        );
        merge_map(&mut self.project_tracking, &base.project_tracking, &mine.project_tracking);
        merge_set(
            &mut self.pending_range_tracking,
            &base.pending_range_tracking,
            &mine.pending_range_tracking,
        );

        for row in &mine.user_products {
            let unchanged = base.user_products.iter().any(|b| b == row);
            if unchanged {
                continue;
            }
            match self.user_products.iter_mut().find(|r| r.id == row.id) {
                Some(current) => *current = row.clone(),
                None => self.user_products.push(row.clone()),
            }
        }

        self.seq = self.seq.max(mine.seq);
    }
}

fn merge_map<K, V>(current: &mut HashMap<K, V>, base: &HashMap<K, V>, mine: &HashMap<K, V>)
where
    K: Eq + Hash + Clone,
    V: PartialEq + Clone,
{
    for (key, value) in mine {
        if base.get(key) != Some(value) {
            current.insert(key.clone(), value.clone());
        }
    }
    for key in base.keys() {
        if !mine.contains_key(key) {
            current.remove(key);
        }
    }
}

fn merge_set<T: Eq + Hash + Clone>(current: &mut HashSet<T>, base: &HashSet<T>, mine: &HashSet<T>) {
    for added in mine.difference(base) {
        current.insert(added.clone());
    }
    for removed in base.difference(mine) {
        current.remove(removed);
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    sku_bulk_loads: AtomicUsize,
    fail_add_on_writes: AtomicBool,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `BillingStore` backed by process memory
#[derive(Clone, Default)]
pub struct InMemoryBillingStore {
    shared: Arc<Shared>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, email: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.shared.state().users.insert(id, email.to_string());
        id
    }

    fn add_catalog(&self, category: SkuCategory, name: &str, requires_external_action: bool) -> Uuid {
        let id = Uuid::new_v4();
        self.shared.state().catalog.insert(
            (category, id),
            CatalogRecord {
                id,
                name: name.to_string(),
                requires_external_action,
            },
        );
        id
    }

    pub fn add_product(&self, name: &str, requires_external_action: bool) -> Uuid {
        self.add_catalog(SkuCategory::Product, name, requires_external_action)
    }

    pub fn add_subscription_plan(&self, name: &str, requires_external_action: bool) -> Uuid {
        self.add_catalog(SkuCategory::Subscription, name, requires_external_action)
    }

    pub fn add_add_on(&self, name: &str) -> Uuid {
        self.add_catalog(SkuCategory::AddOn, name, false)
    }

    /// Map a SKU to a catalog record; returns the mapping row id
    pub fn add_sku(&self, category: SkuCategory, sku: &str, target_id: Uuid) -> Uuid {
        let mapping_id = Uuid::new_v4();
        self.shared
            .state()
            .sku_mappings
            .push((category, SkuMapping::new(sku, mapping_id, target_id)));
        mapping_id
    }

    /// Insert a product grant directly, bypassing invoice reconciliation
    pub fn seed_user_product(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        sync_status: Option<ExternalSyncStatus>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.shared.state().user_products.push(UserProductRow {
            id,
            user_id,
            product_id,
            invoice_item_id: Uuid::new_v4(),
            external_sync_status: sync_status,
        });
        id
    }

    pub fn seed_pending_range_tracking(&self, user_id: Uuid) {
        self.shared.state().pending_range_tracking.insert(user_id);
    }

    pub fn set_user_meta(&self, user_id: Uuid, key: &str, value: &str) {
        self.shared
            .state()
            .user_meta
            .insert((user_id, key.to_string()), value.to_string());
    }

    /// Make every subsequent add-on replacement fail
    pub fn fail_add_on_writes(&self, fail: bool) {
        self.shared.fail_add_on_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of full-category SKU loads served so far
    pub fn sku_bulk_loads(&self) -> usize {
        self.shared.sku_bulk_loads.load(Ordering::SeqCst)
    }

    pub fn invoice(&self, external_id: &str) -> Option<InvoiceRecord> {
        self.shared.state().invoices.get(external_id).cloned()
    }

    pub fn invoice_count(&self) -> usize {
        self.shared.state().invoices.len()
    }

    pub fn line_item(&self, external_id: &str) -> Option<LineItemRecord> {
        self.shared
            .state()
            .line_items
            .get(external_id)
            .map(|row| row.record.clone())
    }

    pub fn line_item_count(&self) -> usize {
        self.shared.state().line_items.len()
    }

    /// SKU mapping row linked from an invoice item
    pub fn line_item_sku_link(&self, external_id: &str) -> Option<Uuid> {
        self.shared
            .state()
            .line_items
            .get(external_id)
            .and_then(|row| row.sku_link.map(|(_, id)| id))
    }

    pub fn user_products(&self, user_id: Uuid) -> Vec<UserProductRow> {
        self.shared
            .state()
            .user_products
            .iter()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn user_subscription(&self, external_id: &str) -> Option<UserSubscriptionRecord> {
        self.shared
            .state()
            .subscriptions
            .get(external_id)
            .map(|row| row.record.clone())
    }

    pub fn subscription_add_ons(&self, record_id: Uuid) -> Vec<AddOn> {
        self.shared
            .state()
            .subscription_add_ons
            .get(&record_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn user_meta(&self, user_id: Uuid, key: &str) -> Option<String> {
        self.shared
            .state()
            .user_meta
            .get(&(user_id, key.to_string()))
            .cloned()
    }

    pub fn has_pending_range_tracking(&self, user_id: Uuid) -> bool {
        self.shared.state().pending_range_tracking.contains(&user_id)
    }

    pub fn project_tracking_enabled(&self, user_id: Uuid) -> Option<bool> {
        self.shared.state().project_tracking.get(&user_id).copied()
    }

    pub fn sync_status(&self, kind: RecordKind, record_id: Uuid) -> Option<ExternalSyncStatus> {
        let mut state = self.shared.state();
        match kind {
            RecordKind::UserProduct => state
                .user_product_by_id(record_id)
                .ok()
                .and_then(|row| row.external_sync_status),
            RecordKind::UserSubscription => state
                .subscription_by_id(record_id)
                .ok()
                .and_then(|row| row.record.external_sync_status),
        }
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn begin(&self) -> BillingResult<Box<dyn BillingTransaction>> {
        let state = self.shared.state().clone();
        Ok(Box::new(InMemoryTransaction {
            shared: self.shared.clone(),
            base: state.clone(),
            state,
            dirty: false,
            held_locks: Vec::new(),
        }))
    }
}

struct InMemoryTransaction {
    shared: Arc<Shared>,
    base: State,
    state: State,
    dirty: bool,
    held_locks: Vec<OwnedMutexGuard<()>>,
}

impl InMemoryTransaction {
    fn write(&mut self) -> &mut State {
        self.dirty = true;
        &mut self.state
    }
}

#[async_trait]
impl BillingTransaction for InMemoryTransaction {
    async fn lock_external_id(&mut self, external_id: &str) -> BillingResult<()> {
        let lock = {
            let mut locks = self.shared.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(external_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        self.held_locks.push(lock.lock_owned().await);

        // Whoever held the lock before may have committed since `begin`
        if !self.dirty {
            self.state = self.shared.state().clone();
            self.base = self.state.clone();
        }
        Ok(())
    }

    async fn user_exists(&mut self, user_id: Uuid) -> BillingResult<bool> {
        Ok(self.state.users.contains_key(&user_id))
    }

    async fn get_user_email(&mut self, user_id: Uuid) -> BillingResult<Option<String>> {
        Ok(self.state.users.get(&user_id).cloned())
    }

    async fn load_sku_mappings(&mut self, category: SkuCategory) -> BillingResult<Vec<SkuMapping>> {
        self.shared.sku_bulk_loads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .sku_mappings
            .iter()
            .filter(|(c, _)| *c == category)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn find_sku_mapping(
        &mut self,
        category: SkuCategory,
        sku: &str,
    ) -> BillingResult<Option<SkuMapping>> {
        Ok(self
            .state
            .sku_mappings
            .iter()
            .find(|(c, m)| *c == category && m.sku() == sku)
            .map(|(_, m)| m.clone()))
    }

    async fn get_catalog_record(
        &mut self,
        category: SkuCategory,
        id: Uuid,
    ) -> BillingResult<Option<CatalogRecord>> {
        Ok(self.state.catalog.get(&(category, id)).cloned())
    }

    async fn store_invoice(&mut self, invoice: &Invoice) -> BillingResult<InvoiceRecord> {
        let state = self.write();
        let record = state
            .invoices
            .entry(invoice.external_id().to_string())
            .and_modify(|r| {
                r.user_id = invoice.user_id();
                r.total_cents = invoice.net_total_cents();
            })
            .or_insert_with(|| InvoiceRecord {
                id: Uuid::new_v4(),
                external_id: invoice.external_id().to_string(),
                user_id: invoice.user_id(),
                total_cents: invoice.net_total_cents(),
            });
        Ok(record.clone())
    }

    async fn store_line_item(
        &mut self,
        invoice_id: Uuid,
        item: &LineItem,
        mapping: Option<&SkuMapping>,
    ) -> BillingResult<LineItemRecord> {
        let sku_link = mapping.map(|m| (item.kind(), m.mapping_id));
        let state = self.write();
        let row = state
            .line_items
            .entry(item.external_id.clone())
            .and_modify(|row| {
                row.record.invoice_id = invoice_id;
                row.sku_link = sku_link;
            })
            .or_insert_with(|| LineItemRow {
                record: LineItemRecord {
                    id: Uuid::new_v4(),
                    external_id: item.external_id.clone(),
                    invoice_id,
                },
                sku_link,
            });
        Ok(row.record.clone())
    }

    async fn get_invoice_item_ids_for_line_items(
        &mut self,
        items: &mut [LineItem],
    ) -> BillingResult<()> {
        for item in items.iter_mut() {
            if let Some(row) = self.state.line_items.get(&item.external_id) {
                item.stored_id = Some(row.record.id);
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
        Ok(self.state.user_products.iter().any(|row| {
            row.user_id == user_id
                && row.product_id == product_id
                && row.invoice_item_id == invoice_item_id
        }))
    }

    async fn grant_user_product(
        &mut self,
        user_id: Uuid,
        product_id: Uuid,
        invoice_item_id: Uuid,
        sync_status: Option<ExternalSyncStatus>,
    ) -> BillingResult<Uuid> {
        let state = self.write();
        if let Some(existing) = state.user_products.iter().find(|row| {
            row.user_id == user_id
                && row.product_id == product_id
                && row.invoice_item_id == invoice_item_id
        }) {
            return Ok(existing.id);
        }

        let id = Uuid::new_v4();
        state.user_products.push(UserProductRow {
            id,
            user_id,
            product_id,
            invoice_item_id,
            external_sync_status: sync_status,
        });
        Ok(id)
    }

    async fn get_user_subscription_record(
        &mut self,
        external_id: &str,
    ) -> BillingResult<Option<UserSubscriptionRecord>> {
        Ok(self
            .state
            .subscriptions
            .get(external_id)
            .map(|row| row.record.clone()))
    }

    async fn store_user_subscription(
        &mut self,
        subscription: &Subscription,
        catalog_id: Uuid,
    ) -> BillingResult<UserSubscriptionRecord> {
        let existing = self
            .state
            .subscriptions
            .get(subscription.external_id())
            .map(|row| row.record.id);
        if let Some(record_id) = existing {
            return self
                .update_user_subscription(record_id, subscription, catalog_id)
                .await;
        }

        let state = self.write();
        let updated_seq = state.next_seq();
        let record = UserSubscriptionRecord {
            id: Uuid::new_v4(),
            external_id: subscription.external_id().to_string(),
            user_id: subscription.user_id(),
            subscription_id: catalog_id,
            sku: subscription.sku().to_string(),
            status: subscription.status(),
            affiliate_code: subscription.affiliate_code().map(str::to_string),
            external_sync_status: subscription.external_sync_status(),
        };
        state.subscriptions.insert(
            record.external_id.clone(),
            SubscriptionRow {
                record: record.clone(),
                updated_seq,
            },
        );
        Ok(record)
    }

    async fn update_user_subscription(
        &mut self,
        record_id: Uuid,
        subscription: &Subscription,
        catalog_id: Uuid,
    ) -> BillingResult<UserSubscriptionRecord> {
        let state = self.write();
        let updated_seq = state.next_seq();
        let row = state.subscription_by_id(record_id)?;
        row.record.subscription_id = catalog_id;
        row.record.sku = subscription.sku().to_string();
        row.record.status = subscription.status();
        if let Some(code) = subscription.affiliate_code() {
            row.record.affiliate_code = Some(code.to_string());
        }
        row.updated_seq = updated_seq;
        Ok(row.record.clone())
    }

    async fn replace_subscription_add_ons(
        &mut self,
        record_id: Uuid,
        add_ons: &[AddOn],
    ) -> BillingResult<()> {
        if self.shared.fail_add_on_writes.load(Ordering::SeqCst) {
            return Err(BillingError::Database(
                "insert into user_subscription_add_ons failed".to_string(),
            ));
        }
        for add_on in add_ons {
            add_on.record_id()?;
        }
        self.write()
            .subscription_add_ons
            .insert(record_id, add_ons.to_vec());
        Ok(())
    }

    async fn latest_affiliate_code(&mut self, user_id: Uuid) -> BillingResult<Option<String>> {
        Ok(self
            .state
            .subscriptions
            .values()
            .filter(|row| row.record.user_id == user_id && row.record.affiliate_code.is_some())
            .max_by_key(|row| row.updated_seq)
            .and_then(|row| row.record.affiliate_code.clone()))
    }

    async fn apply_tier_effect(&mut self, user_id: Uuid, effect: TierEffect) -> BillingResult<()> {
        let state = self.write();
        match effect {
            TierEffect::ClearPendingRangeTracking => {
                state.pending_range_tracking.remove(&user_id);
            }
            TierEffect::SetUserMeta(key) => {
                state
                    .user_meta
                    .insert((user_id, key.to_string()), "true".to_string());
            }
            TierEffect::ClearUserMeta(key) => {
                state.user_meta.remove(&(user_id, key.to_string()));
            }
            TierEffect::EnableProjectTracking => {
                state.project_tracking.insert(user_id, true);
            }
        }
        Ok(())
    }

    async fn get_sync_status(
        &mut self,
        kind: RecordKind,
        record_id: Uuid,
    ) -> BillingResult<Option<ExternalSyncStatus>> {
        match kind {
            RecordKind::UserProduct => Ok(self
                .state
                .user_product_by_id(record_id)?
                .external_sync_status),
            RecordKind::UserSubscription => Ok(self
                .state
                .subscription_by_id(record_id)?
                .record
                .external_sync_status),
        }
    }

    async fn set_sync_status(&mut self, options: &SyncStatusOptions) -> BillingResult<()> {
        let status = Some(options.status());
        let state = self.write();
        match options.record_kind {
            RecordKind::UserProduct => {
                state.user_product_by_id(options.record_id)?.external_sync_status = status;
            }
            RecordKind::UserSubscription => {
                state
                    .subscription_by_id(options.record_id)?
                    .record
                    .external_sync_status = status;
            }
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        let this = *self;
        if this.dirty {
            this.shared.state().merge_changes(&this.base, &this.state);
        }
        drop(this.held_locks);
        Ok(())
    }
}
