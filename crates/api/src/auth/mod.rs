//! Authentication for inbound provider webhooks

pub mod middleware;

pub use middleware::{require_webhook_auth, WebhookCredentials};
