//! Invoice and line item domain objects
//!
//! Built fresh from the provider payload for every webhook. Line items are
//! filed into subscription / product / add-on collections as they are added,
//! so reconciliation never has to re-derive the category.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Provider-side invoice state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceState {
    Pending,
    Paid,
    Failed,
    PastDue,
    Voided,
}

impl InvoiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceState::Pending => "pending",
            InvoiceState::Paid => "paid",
            InvoiceState::Failed => "failed",
            InvoiceState::PastDue => "past_due",
            InvoiceState::Voided => "voided",
        }
    }

    pub fn from_provider(s: &str) -> BillingResult<Self> {
        match s {
            "pending" | "open" => Ok(InvoiceState::Pending),
            "paid" | "collected" => Ok(InvoiceState::Paid),
            "failed" => Ok(InvoiceState::Failed),
            "past_due" => Ok(InvoiceState::PastDue),
            "voided" => Ok(InvoiceState::Voided),
            other => Err(BillingError::InvalidInput(format!(
                "Unknown invoice state '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for InvoiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a line item came from on the provider side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemOrigin {
    Plan,
    AddOn,
}

impl LineItemOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineItemOrigin::Plan => "plan",
            LineItemOrigin::AddOn => "add_on",
        }
    }
}

/// Collection a line item is filed under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineItemKind {
    Subscription,
    Product,
    AddOn,
}

/// One charge or credit row on an invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub external_id: String,
    /// External id of the subscription this charge belongs to, if any
    pub subscription_id: Option<String>,
    pub description: String,
    /// `None` for charges that are not catalog items (manual adjustments, taxes)
    pub sku: Option<String>,
    pub total_cents: i64,
    pub quantity: i32,
    pub origin: LineItemOrigin,
    /// Row id once the item has been stored or looked up
    #[serde(skip)]
    pub stored_id: Option<Uuid>,
}

impl LineItem {
    pub fn new(external_id: impl Into<String>, origin: LineItemOrigin) -> Self {
        Self {
            external_id: external_id.into(),
            subscription_id: None,
            description: String::new(),
            sku: None,
            total_cents: 0,
            quantity: 1,
            origin,
            stored_id: None,
        }
    }

    pub fn with_sku(mut self, sku: impl Into<String>) -> Self {
        self.sku = Some(sku.into());
        self
    }

    pub fn with_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.subscription_id = Some(subscription_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_total(mut self, total_cents: i64, quantity: i32) -> Self {
        self.total_cents = total_cents;
        self.quantity = quantity;
        self
    }

    pub fn is_add_on(&self) -> bool {
        self.origin == LineItemOrigin::AddOn
    }

    pub fn kind(&self) -> LineItemKind {
        if self.is_add_on() {
            LineItemKind::AddOn
        } else if self.subscription_id.is_some() {
            LineItemKind::Subscription
        } else {
            LineItemKind::Product
        }
    }
}

/// A billing-provider invoice
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Invoice {
    external_id: String,
    user_id: Uuid,
    state: InvoiceState,
    charge_cents: i64,
    credit_cents: i64,
    currency: String,
    closed_at: Option<OffsetDateTime>,
    subscription_items: Vec<LineItem>,
    product_items: Vec<LineItem>,
    add_on_items: Vec<LineItem>,
}

impl Invoice {
    pub fn new(external_id: impl Into<String>, user_id: Uuid) -> Self {
        Self {
            external_id: external_id.into(),
            user_id,
            state: InvoiceState::Pending,
            charge_cents: 0,
            credit_cents: 0,
            currency: "USD".to_string(),
            closed_at: None,
            subscription_items: Vec::new(),
            product_items: Vec::new(),
            add_on_items: Vec::new(),
        }
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    /// The external id may only be (re)set to the value it already has
    pub fn set_external_id(&mut self, external_id: &str) -> BillingResult<()> {
        if !self.external_id.is_empty() && self.external_id != external_id {
            return Err(BillingError::InvalidInput(format!(
                "Invoice external id is immutable ({} -> {})",
                self.external_id, external_id
            )));
        }
        self.external_id = external_id.to_string();
        Ok(())
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn state(&self) -> InvoiceState {
        self.state
    }

    pub fn set_state(&mut self, state: InvoiceState) {
        self.state = state;
    }

    pub fn charge_cents(&self) -> i64 {
        self.charge_cents
    }

    pub fn set_charge_cents(&mut self, cents: i64) -> BillingResult<()> {
        if cents < 0 {
            return Err(BillingError::InvalidInput(format!(
                "Invoice charge total cannot be negative: {}",
                cents
            )));
        }
        self.charge_cents = cents;
        Ok(())
    }

    pub fn credit_cents(&self) -> i64 {
        self.credit_cents
    }

    /// Credits arrive as negative amounts from some providers; stored as magnitude
    pub fn set_credit_cents(&mut self, cents: i64) -> BillingResult<()> {
        self.credit_cents = cents.checked_abs().ok_or_else(|| {
            BillingError::InvalidInput(format!("Invoice credit total out of range: {}", cents))
        })?;
        Ok(())
    }

    /// Amount actually collected, clamped at zero when credits exceed charges
    pub fn net_total_cents(&self) -> i64 {
        (self.charge_cents - self.credit_cents).max(0)
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn set_currency(&mut self, currency: &str) -> BillingResult<()> {
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(BillingError::InvalidInput(format!(
                "Invalid currency code '{}'",
                currency
            )));
        }
        self.currency = currency.to_ascii_uppercase();
        Ok(())
    }

    pub fn closed_at(&self) -> Option<OffsetDateTime> {
        self.closed_at
    }

    pub fn set_closed_at(&mut self, closed_at: Option<OffsetDateTime>) {
        self.closed_at = closed_at;
    }

    pub fn add_line_item(&mut self, item: LineItem) {
        match item.kind() {
            LineItemKind::Subscription => self.subscription_items.push(item),
            LineItemKind::Product => self.product_items.push(item),
            LineItemKind::AddOn => self.add_on_items.push(item),
        }
    }

    pub fn subscription_items(&self) -> &[LineItem] {
        &self.subscription_items
    }

    pub fn product_items(&self) -> &[LineItem] {
        &self.product_items
    }

    pub fn add_on_items(&self) -> &[LineItem] {
        &self.add_on_items
    }

    pub fn product_items_mut(&mut self) -> &mut [LineItem] {
        &mut self.product_items
    }

    pub fn has_subscription_items(&self) -> bool {
        !self.subscription_items.is_empty()
    }

    pub fn has_product_items(&self) -> bool {
        !self.product_items.is_empty()
    }

    pub fn has_add_on_items(&self) -> bool {
        !self.add_on_items.is_empty()
    }

    /// All line items in storage order: subscription, product, add-on
    pub fn line_items(&self) -> impl Iterator<Item = &LineItem> {
        self.subscription_items
            .iter()
            .chain(self.product_items.iter())
            .chain(self.add_on_items.iter())
    }

    pub fn line_item_count(&self) -> usize {
        self.subscription_items.len() + self.product_items.len() + self.add_on_items.len()
    }
}
