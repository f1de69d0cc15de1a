//! SKU resolvers
//!
//! Map provider SKU codes to internal catalog ids. A resolver lives for a
//! single reconciliation call: `fetch_all_skus` bulk-loads the category once
//! (useful for invoices with many line items), `fetch_one` resolves a single
//! SKU without touching the rest of the catalog.

use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::BillingTransaction;

/// Catalog category a SKU belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkuCategory {
    Product,
    Subscription,
    AddOn,
}

impl SkuCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkuCategory::Product => "product",
            SkuCategory::Subscription => "subscription",
            SkuCategory::AddOn => "add-on",
        }
    }
}

impl std::fmt::Display for SkuCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved external SKU -> internal catalog id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkuMapping {
    sku: String,
    /// Row id of the mapping itself (linked from invoice items)
    pub mapping_id: Uuid,
    /// Catalog record the SKU points at
    pub target_id: Uuid,
}

impl SkuMapping {
    pub fn new(sku: &str, mapping_id: Uuid, target_id: Uuid) -> Self {
        Self {
            sku: canonical_sku(sku),
            mapping_id,
            target_id,
        }
    }

    pub fn sku(&self) -> &str {
        &self.sku
    }
}

/// SKUs compare case-insensitively
pub fn canonical_sku(sku: &str) -> String {
    sku.trim().to_lowercase()
}

/// Marker for a resolver's catalog category
pub trait CatalogKind: Send + Sync {
    const CATEGORY: SkuCategory;
}

/// Categories that support single-SKU resolution outside the bulk cache
pub trait SingleFetch: CatalogKind {}

#[derive(Debug)]
pub struct Products;
#[derive(Debug)]
pub struct Subscriptions;
#[derive(Debug)]
pub struct AddOns;

impl CatalogKind for Products {
    const CATEGORY: SkuCategory = SkuCategory::Product;
}
impl CatalogKind for Subscriptions {
    const CATEGORY: SkuCategory = SkuCategory::Subscription;
}
impl CatalogKind for AddOns {
    const CATEGORY: SkuCategory = SkuCategory::AddOn;
}

impl SingleFetch for Products {}
impl SingleFetch for Subscriptions {}

pub type ProductSkuManager = SkuManager<Products>;
pub type SubscriptionSkuManager = SkuManager<Subscriptions>;
pub type AddOnSkuManager = SkuManager<AddOns>;

/// Lazily initialized SKU cache for one catalog category
#[derive(Debug)]
pub struct SkuManager<C: CatalogKind> {
    mappings: Option<Vec<SkuMapping>>,
    _kind: PhantomData<C>,
}

impl<C: CatalogKind> Default for SkuManager<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: CatalogKind> SkuManager<C> {
    pub fn new() -> Self {
        Self {
            mappings: None,
            _kind: PhantomData,
        }
    }

    /// Resolver pre-populated with known mappings
    pub fn with_mappings(mappings: Vec<SkuMapping>) -> Self {
        Self {
            mappings: Some(mappings),
            _kind: PhantomData,
        }
    }

    pub fn category(&self) -> SkuCategory {
        C::CATEGORY
    }

    pub fn is_initialized(&self) -> bool {
        self.mappings.is_some()
    }

    /// Load every mapping for the category. Later calls are no-ops.
    pub async fn fetch_all_skus(&mut self, tx: &mut dyn BillingTransaction) -> BillingResult<()> {
        if self.mappings.is_some() {
            return Ok(());
        }

        let mappings = tx.load_sku_mappings(C::CATEGORY).await?;
        tracing::debug!(
            category = %C::CATEGORY,
            count = mappings.len(),
            "Loaded SKU mappings"
        );
        self.mappings = Some(mappings);
        Ok(())
    }

    fn initialized(&self) -> BillingResult<&[SkuMapping]> {
        self.mappings.as_deref().ok_or_else(|| {
            BillingError::Configuration(format!(
                "{} SKU resolver used before fetch_all_skus",
                C::CATEGORY
            ))
        })
    }

    pub fn has_mapping_for_sku(&self, sku: &str) -> BillingResult<bool> {
        Ok(self.get_mapping_for_sku(sku)?.is_some())
    }

    pub fn get_mapping_for_sku(&self, sku: &str) -> BillingResult<Option<&SkuMapping>> {
        let wanted = canonical_sku(sku);
        Ok(self.initialized()?.iter().find(|m| m.sku == wanted))
    }

    pub fn get_target_id_by_sku(&self, sku: &str) -> BillingResult<Option<Uuid>> {
        Ok(self.get_mapping_for_sku(sku)?.map(|m| m.target_id))
    }

    pub fn get_mapping_id_by_sku(&self, sku: &str) -> BillingResult<Option<Uuid>> {
        Ok(self.get_mapping_for_sku(sku)?.map(|m| m.mapping_id))
    }
}

impl<C: SingleFetch> SkuManager<C> {
    /// Resolve one SKU without loading the full catalog.
    ///
    /// Served from the cache when it has already been populated.
    pub async fn fetch_one(
        &self,
        tx: &mut dyn BillingTransaction,
        sku: &str,
    ) -> BillingResult<Option<SkuMapping>> {
        if let Some(mappings) = &self.mappings {
            let wanted = canonical_sku(sku);
            return Ok(mappings.iter().find(|m| m.sku == wanted).cloned());
        }
        tx.find_sku_mapping(C::CATEGORY, &canonical_sku(sku)).await
    }
}
