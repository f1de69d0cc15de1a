//! Subscription and add-on domain objects

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Internal subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    /// Cancelled by the customer, still running until the period ends
    Cancelling,
    Inactive,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelling => "cancelling",
            SubscriptionStatus::Inactive => "inactive",
        }
    }

    /// Parse a stored status value
    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "cancelling" => Ok(SubscriptionStatus::Cancelling),
            "inactive" => Ok(SubscriptionStatus::Inactive),
            other => Err(BillingError::InvalidInput(format!(
                "Unknown subscription status '{}'",
                other
            ))),
        }
    }

    /// Map a provider subscription state onto the internal status
    pub fn from_provider(state: &str) -> BillingResult<Self> {
        match state {
            "active" | "in_trial" | "future" | "paused" => Ok(SubscriptionStatus::Active),
            "canceled" | "cancelled" => Ok(SubscriptionStatus::Cancelling),
            "expired" | "failed" => Ok(SubscriptionStatus::Inactive),
            other => Err(BillingError::InvalidInput(format!(
                "Unknown provider subscription state '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record of an external-service provisioning attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalSyncStatus {
    ActionRequired,
    Activated,
    Terminated,
    ActivationFailed,
    TerminationFailed,
}

impl ExternalSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalSyncStatus::ActionRequired => "action_required",
            ExternalSyncStatus::Activated => "activated",
            ExternalSyncStatus::Terminated => "terminated",
            ExternalSyncStatus::ActivationFailed => "activation_failed",
            ExternalSyncStatus::TerminationFailed => "termination_failed",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "action_required" => Ok(ExternalSyncStatus::ActionRequired),
            "activated" => Ok(ExternalSyncStatus::Activated),
            "terminated" => Ok(ExternalSyncStatus::Terminated),
            "activation_failed" => Ok(ExternalSyncStatus::ActivationFailed),
            "termination_failed" => Ok(ExternalSyncStatus::TerminationFailed),
            other => Err(BillingError::InvalidInput(format!(
                "Unknown external sync status '{}'",
                other
            ))),
        }
    }

    /// Terminal state a sync attempt should leave behind
    pub fn desired(activating: bool) -> Self {
        if activating {
            ExternalSyncStatus::Activated
        } else {
            ExternalSyncStatus::Terminated
        }
    }

    pub fn failed(activating: bool) -> Self {
        if activating {
            ExternalSyncStatus::ActivationFailed
        } else {
            ExternalSyncStatus::TerminationFailed
        }
    }
}

impl std::fmt::Display for ExternalSyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-visible label for a subscription status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTransition {
    Enabled,
    PendingCancellation,
    Terminated,
}

impl StatusTransition {
    /// Label for a (previous, new) status pair. Unchanged status yields none,
    /// even if other fields of the subscription changed.
    pub fn between(previous: SubscriptionStatus, new: SubscriptionStatus) -> Option<Self> {
        if previous == new {
            return None;
        }
        Some(match new {
            SubscriptionStatus::Active => StatusTransition::Enabled,
            SubscriptionStatus::Cancelling => StatusTransition::PendingCancellation,
            SubscriptionStatus::Inactive => StatusTransition::Terminated,
        })
    }

    pub fn label(&self) -> &'static str {
        match self {
            StatusTransition::Enabled => "Enabled",
            StatusTransition::PendingCancellation => "Pending Cancellation",
            StatusTransition::Terminated => "Terminated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddOnType {
    Fixed,
    Usage,
}

impl AddOnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddOnType::Fixed => "fixed",
            AddOnType::Usage => "usage",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "fixed" => Ok(AddOnType::Fixed),
            "usage" => Ok(AddOnType::Usage),
            other => Err(BillingError::InvalidInput(format!(
                "Unknown add-on type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevenueScheduleType {
    Never,
    Evenly,
    AtRangeStart,
    AtRangeEnd,
}

impl RevenueScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevenueScheduleType::Never => "never",
            RevenueScheduleType::Evenly => "evenly",
            RevenueScheduleType::AtRangeStart => "at_range_start",
            RevenueScheduleType::AtRangeEnd => "at_range_end",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "never" => Some(RevenueScheduleType::Never),
            "evenly" => Some(RevenueScheduleType::Evenly),
            "at_range_start" => Some(RevenueScheduleType::AtRangeStart),
            "at_range_end" => Some(RevenueScheduleType::AtRangeEnd),
            _ => None,
        }
    }
}

/// A subscription add-on line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddOn {
    pub add_on_type: AddOnType,
    pub code: String,
    pub unit_amount_cents: i64,
    pub quantity: i32,
    pub revenue_schedule_type: Option<RevenueScheduleType>,
    record_id: Option<Uuid>,
}

impl AddOn {
    pub fn new(add_on_type: AddOnType, code: impl Into<String>, unit_amount_cents: i64, quantity: i32) -> Self {
        Self {
            add_on_type,
            code: code.into(),
            unit_amount_cents,
            quantity,
            revenue_schedule_type: None,
            record_id: None,
        }
    }

    /// Attach the catalog add-on id after SKU resolution
    pub fn resolve(&mut self, record_id: Uuid) {
        self.record_id = Some(record_id);
    }

    pub fn is_resolved(&self) -> bool {
        self.record_id.is_some()
    }

    pub fn record_id(&self) -> BillingResult<Uuid> {
        self.record_id.ok_or_else(|| {
            BillingError::Configuration(format!(
                "Add-on '{}' accessed before SKU resolution",
                self.code
            ))
        })
    }
}

/// A billing-provider subscription instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    external_id: String,
    user_id: Uuid,
    sku: String,
    status: SubscriptionStatus,
    term_ends_at: Option<OffsetDateTime>,
    current_period_ends_at: Option<OffsetDateTime>,
    affiliate_code: Option<String>,
    add_ons: Vec<AddOn>,
    external_sync_status: Option<ExternalSyncStatus>,
}

impl Subscription {
    pub fn new(
        external_id: impl Into<String>,
        user_id: Uuid,
        sku: impl Into<String>,
        status: SubscriptionStatus,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            user_id,
            sku: sku.into(),
            status,
            term_ends_at: None,
            current_period_ends_at: None,
            affiliate_code: None,
            add_ons: Vec::new(),
            external_sync_status: None,
        }
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn sku(&self) -> &str {
        &self.sku
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Changing away from active drops the term and period end times
    pub fn set_status(&mut self, status: SubscriptionStatus) {
        self.status = status;
        if status != SubscriptionStatus::Active {
            self.term_ends_at = None;
            self.current_period_ends_at = None;
        }
    }

    pub fn term_ends_at(&self) -> Option<OffsetDateTime> {
        self.term_ends_at
    }

    pub fn set_term_ends_at(&mut self, at: Option<OffsetDateTime>) {
        self.term_ends_at = if self.is_active() { at } else { None };
    }

    pub fn current_period_ends_at(&self) -> Option<OffsetDateTime> {
        self.current_period_ends_at
    }

    pub fn set_current_period_ends_at(&mut self, at: Option<OffsetDateTime>) {
        self.current_period_ends_at = if self.is_active() { at } else { None };
    }

    pub fn affiliate_code(&self) -> Option<&str> {
        self.affiliate_code.as_deref()
    }

    pub fn set_affiliate_code(&mut self, code: Option<String>) {
        self.affiliate_code = code.filter(|c| !c.trim().is_empty());
    }

    pub fn add_ons(&self) -> &[AddOn] {
        &self.add_ons
    }

    pub fn add_ons_mut(&mut self) -> &mut [AddOn] {
        &mut self.add_ons
    }

    pub fn push_add_on(&mut self, add_on: AddOn) {
        self.add_ons.push(add_on);
    }

    pub fn external_sync_status(&self) -> Option<ExternalSyncStatus> {
        self.external_sync_status
    }

    pub fn set_external_sync_status(&mut self, status: Option<ExternalSyncStatus>) {
        self.external_sync_status = status;
    }

    /// Sync status the external service should end up in for this subscription
    pub fn desired_sync_status(&self) -> ExternalSyncStatus {
        ExternalSyncStatus::desired(self.is_active())
    }

    pub fn is_in_sync(&self) -> bool {
        self.external_sync_status == Some(self.desired_sync_status())
    }
}
