use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::Method;
use nutrio_receipts::ProductCatalog;
use nutrio_server::config::Config;
use nutrio_server::store::PgStore;
use nutrio_server::{create_router, db, AppState, EngineSettings, PaymentEngine, ServerSettings};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env().context("invalid configuration")?;

    let catalog = ProductCatalog::load(&config.catalog_path).with_context(|| {
        format!("failed to load catalog {}", config.catalog_path.display())
    })?;
    info!(products = catalog.len(), "Catalog loaded");

    let pool = db::connect(&config.database_url).await?;

    let engine = PaymentEngine::new(
        Arc::new(PgStore::new(pool)),
        Arc::new(catalog),
        EngineSettings {
            apple_bundle_id: config.apple_bundle_id.clone(),
        },
    );
    let state = AppState::new(
        engine,
        ServerSettings {
            stripe_webhook_secret: config.stripe_webhook_secret.clone(),
            retry_after_secs: config.retry_after_secs,
            checkout_base_url: config.checkout_base_url.clone(),
        },
    );

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(Any),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("nutrio-server listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nutrio_server=info,tower_http=info".into()),
        )
        .init();
}
