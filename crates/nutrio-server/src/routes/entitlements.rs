//! Entitlement and coin balance lookups.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use super::AppState;
use crate::engine::Entitlement;
use crate::error::AppError;
use crate::models::UserSubscription;

/// Creates the entitlements router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/users/{user_id}/products/{product_id}",
            get(get_entitlement),
        )
        .route("/users/{user_id}/subscriptions", get(list_subscriptions))
        .route("/users/{user_id}/coins", get(get_coin_balance))
        .with_state(state)
}

/// GET /api/v1/entitlements/users/{user_id}/products/{product_id}
async fn get_entitlement(
    State(state): State<AppState>,
    Path((user_id, product_id)): Path<(Uuid, String)>,
) -> Result<Json<Entitlement>, AppError> {
    if state.engine.catalog().product(&product_id).is_none() {
        return Err(AppError::NotFound(format!("Unknown product: {}", product_id)));
    }
    let entitlement = state
        .engine
        .entitlements()
        .entitlement(user_id, &product_id, Utc::now())
        .await?;
    Ok(Json(entitlement))
}

/// GET /api/v1/entitlements/users/{user_id}/subscriptions
async fn list_subscriptions(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Vec<UserSubscription>>, AppError> {
    let subscriptions = state.engine.entitlements().subscriptions(user_id).await?;
    Ok(Json(subscriptions))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoinBalanceResponse {
    pub user_id: Uuid,
    pub balance: i64,
}

/// GET /api/v1/entitlements/users/{user_id}/coins
async fn get_coin_balance(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<CoinBalanceResponse>, AppError> {
    let balance = state.engine.entitlements().coin_balance(user_id).await?;
    Ok(Json(CoinBalanceResponse { user_id, balance }))
}
