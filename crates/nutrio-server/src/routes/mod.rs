//! API routes for the Nutrio payment service.

pub mod entitlements;
pub mod payments;

use std::sync::Arc;

use axum::Router;

use crate::engine::PaymentEngine;

/// HTTP-level settings the handlers need beyond the engine.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
    /// Unset skips `Stripe-Signature` verification.
    pub stripe_webhook_secret: Option<String>,
    pub retry_after_secs: u64,
    pub checkout_base_url: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<PaymentEngine>,
    pub settings: Arc<ServerSettings>,
}

impl AppState {
    pub fn new(engine: PaymentEngine, settings: ServerSettings) -> Self {
        Self {
            engine: Arc::new(engine),
            settings: Arc::new(settings),
        }
    }
}

/// Creates the main API router with all routes mounted.
pub fn create_router(state: AppState) -> Router {
    Router::new().nest("/api/v1", api_v1_routes(state))
}

fn api_v1_routes(state: AppState) -> Router {
    Router::new()
        .nest("/payments", payments::router(state.clone()))
        .nest("/entitlements", entitlements::router(state))
}
