//! Provider wire types and their normalization into domain objects

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::invoice::{Invoice, InvoiceState, LineItem, LineItemOrigin};
use crate::subscription::{AddOn, AddOnType, RevenueScheduleType, Subscription, SubscriptionStatus};

/// Provider account code is the internal user id
fn parse_account_code(code: &str) -> BillingResult<Uuid> {
    Uuid::parse_str(code.trim()).map_err(|_| {
        BillingError::InvalidInput(format!("Account code '{}' is not a user id", code))
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireLineItem {
    pub id: String,
    #[serde(default = "default_origin")]
    pub origin: String,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub amount_cents: i64,
    #[serde(default = "default_quantity")]
    pub quantity: i32,
}

fn default_origin() -> String {
    "plan".to_string()
}

fn default_quantity() -> i32 {
    1
}

impl From<WireLineItem> for LineItem {
    fn from(wire: WireLineItem) -> Self {
        let origin = match wire.origin.as_str() {
            "add_on" | "add_on_trial" => LineItemOrigin::AddOn,
            _ => LineItemOrigin::Plan,
        };

        let mut item = LineItem::new(wire.id, origin)
            .with_description(wire.description.unwrap_or_default())
            .with_total(wire.amount_cents, wire.quantity);
        item.sku = wire.sku.filter(|s| !s.trim().is_empty());
        item.subscription_id = wire.subscription_id;
        item
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireInvoice {
    pub id: String,
    pub account_code: String,
    pub state: String,
    #[serde(default)]
    pub charge_total_cents: i64,
    #[serde(default)]
    pub credit_total_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub closed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub line_items: Vec<WireLineItem>,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl TryFrom<WireInvoice> for Invoice {
    type Error = BillingError;

    fn try_from(wire: WireInvoice) -> BillingResult<Self> {
        let mut invoice = Invoice::new(wire.id, parse_account_code(&wire.account_code)?);
        invoice.set_state(InvoiceState::from_provider(&wire.state)?);
        invoice.set_charge_cents(wire.charge_total_cents)?;
        invoice.set_credit_cents(wire.credit_total_cents)?;
        invoice.set_currency(&wire.currency)?;
        invoice.set_closed_at(wire.closed_at);
        for item in wire.line_items {
            invoice.add_line_item(item.into());
        }
        Ok(invoice)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireAddOn {
    pub add_on_code: String,
    #[serde(default = "default_add_on_type")]
    pub add_on_type: String,
    #[serde(default)]
    pub unit_amount_cents: i64,
    #[serde(default = "default_quantity")]
    pub quantity: i32,
    #[serde(default)]
    pub revenue_schedule_type: Option<String>,
}

fn default_add_on_type() -> String {
    "fixed".to_string()
}

impl TryFrom<WireAddOn> for AddOn {
    type Error = BillingError;

    fn try_from(wire: WireAddOn) -> BillingResult<Self> {
        let mut add_on = AddOn::new(
            AddOnType::parse(&wire.add_on_type)?,
            wire.add_on_code,
            wire.unit_amount_cents,
            wire.quantity,
        );
        add_on.revenue_schedule_type = wire
            .revenue_schedule_type
            .as_deref()
            .and_then(RevenueScheduleType::parse);
        Ok(add_on)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireSubscription {
    pub id: String,
    pub account_code: String,
    pub plan_code: String,
    pub state: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub current_term_ends_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub current_period_ends_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub affiliate_code: Option<String>,
    #[serde(default)]
    pub add_ons: Vec<WireAddOn>,
}

impl TryFrom<WireSubscription> for Subscription {
    type Error = BillingError;

    fn try_from(wire: WireSubscription) -> BillingResult<Self> {
        let mut subscription = Subscription::new(
            wire.id,
            parse_account_code(&wire.account_code)?,
            wire.plan_code,
            SubscriptionStatus::from_provider(&wire.state)?,
        );
        subscription.set_term_ends_at(wire.current_term_ends_at);
        subscription.set_current_period_ends_at(wire.current_period_ends_at);
        subscription.set_affiliate_code(wire.affiliate_code);
        for add_on in wire.add_ons {
            subscription.push_add_on(add_on.try_into()?);
        }
        Ok(subscription)
    }
}

/// Refund policy applied when terminating a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundType {
    Full,
    Partial,
    None,
}

impl RefundType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundType::Full => "full",
            RefundType::Partial => "partial",
            RefundType::None => "none",
        }
    }
}

/// One-off purchase of catalog products
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub account_code: String,
    pub currency: String,
    pub line_items: Vec<PurchaseLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseLine {
    pub sku: String,
    pub quantity: i32,
}
