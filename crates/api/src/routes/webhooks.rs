//! Inbound billing provider webhooks

use axum::{body::Bytes, extract::State, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
}

/// Answers 200 once authenticated; reconciliation failures only show up as
/// `success: false`
pub async fn billing_webhook(State(state): State<AppState>, body: Bytes) -> Json<WebhookResponse> {
    let outcome = state.webhooks.handle_webhook(&body).await;

    tracing::info!(
        event_kind = ?outcome.event_kind,
        success = outcome.success,
        "Billing webhook handled"
    );

    Json(WebhookResponse {
        success: outcome.success,
    })
}
