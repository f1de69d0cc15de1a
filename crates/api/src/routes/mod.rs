//! HTTP routes

pub mod health;
pub mod webhooks;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::{auth::require_webhook_auth, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let webhook_routes = Router::new()
        .route("/webhooks/billing", post(webhooks::billing_webhook))
        .route_layer(middleware::from_fn_with_state(
            state.credentials.clone(),
            require_webhook_auth,
        ));

    Router::new()
        .route("/health", get(health::health))
        .merge(webhook_routes)
        .with_state(state)
}
