//! Application state

use std::sync::Arc;

use ledgerline_billing::WebhookHandler;

use crate::{auth::WebhookCredentials, config::Config};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub webhooks: Arc<WebhookHandler>,
    pub credentials: WebhookCredentials,
}

impl AppState {
    pub fn new(config: &Config, webhooks: WebhookHandler) -> Self {
        Self {
            webhooks: Arc::new(webhooks),
            credentials: WebhookCredentials::new(
                config.webhook_username.clone(),
                config.webhook_password.clone(),
            ),
        }
    }
}
