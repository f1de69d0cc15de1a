#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Ledgerline API Server
//!
//! Receives billing provider webhooks and reconciles them into the
//! billing database.

use std::sync::Arc;

use ledgerline_api::{create_router, AppState, Config};
use ledgerline_billing::{
    BillingService, BillingStore, InMemoryBillingStore, PermissionManager, PgBillingStore,
    PgPermissionManager,
};
use ledgerline_shared::{create_migration_pool, create_pool, run_migrations};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ledgerline_api=debug,ledgerline_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Ledgerline API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    let (store, permissions, pg_store): (
        Arc<dyn BillingStore>,
        Option<Arc<dyn PermissionManager>>,
        Option<PgBillingStore>,
    ) = match &config.database_url {
        Some(database_url) if !config.use_in_memory_store => {
            tracing::info!("Running database migrations...");
            let migration_pool = create_migration_pool(database_url).await?;
            run_migrations(&migration_pool).await?;
            migration_pool.close().await;

            let pool = create_pool(database_url).await?;
            let pg_store = PgBillingStore::new(pool.clone());
            (
                Arc::new(pg_store.clone()) as Arc<dyn BillingStore>,
                Some(Arc::new(PgPermissionManager::new(pool)) as Arc<dyn PermissionManager>),
                Some(pg_store),
            )
        }
        _ => {
            tracing::warn!("Using in-memory billing store; state is lost on restart");
            (
                Arc::new(InMemoryBillingStore::new()) as Arc<dyn BillingStore>,
                None,
                None,
            )
        }
    };

    let billing = BillingService::from_env(store, permissions)?;

    // Every catalog entry requiring external action needs an integration
    if let Some(pg_store) = &pg_store {
        let requiring_action = pg_store.catalog_ids_requiring_action().await?;
        for catalog_id in billing.registry.validate_against(&requiring_action) {
            tracing::warn!(
                catalog_id = %catalog_id,
                "Catalog entry requires external action but has no integration"
            );
        }
    }

    let app = create_router(AppState::new(&config, billing.webhooks))
        .layer(TraceLayer::new_for_http());

    tracing::info!("Starting server on {}", config.bind_address);
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
