//! Billing provider adapter
//!
//! REST client for the provider API, its wire types, and the
//! `BillingProvider` implementation that classifies inbound notifications.

pub mod client;
pub mod engine;
pub mod wire;

pub use client::{ProviderApi, ProviderClient};
pub use engine::{ProviderAdapter, ProviderWebhookEngine};
pub use wire::{PurchaseLine, PurchaseRequest, RefundType, WireInvoice, WireSubscription};
