//! Payment intake: App Store receipts, card checkout and order administration.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::engine::{GrantSweep, Outcome, Reversal};
use crate::error::AppError;
use crate::models::{Order, PaymentMethod};
use crate::stripe::{self, CheckoutEvent, CheckoutMetadata, StripeEvent};

const DEFAULT_SWEEP_LIMIT: i64 = 100;
const MAX_SWEEP_LIMIT: i64 = 1000;

/// Creates the payments router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/apple/receipt", post(submit_apple_receipt))
        .route("/checkout/session", post(create_checkout_session))
        .route("/webhook/stripe", post(handle_stripe_webhook))
        .route("/orders/{method}/{external_id}", get(get_order))
        .route("/orders/{method}/{external_id}/reverse", post(reverse_order))
        .route("/ledger/retry", post(retry_pending_grants))
        .with_state(state)
}

/// Picks the HTTP status for a batch of outcomes.
///
/// Any retryable outcome makes the whole batch retryable. A batch where
/// every item was rejected is unprocessable.
fn outcome_status(outcomes: &[Outcome]) -> StatusCode {
    if outcomes
        .iter()
        .any(|o| matches!(o, Outcome::RetryLater { .. }))
    {
        StatusCode::SERVICE_UNAVAILABLE
    } else if !outcomes.is_empty()
        && outcomes
            .iter()
            .all(|o| matches!(o, Outcome::Rejected { .. }))
    {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::OK
    }
}

fn with_status<T: Serialize>(status: StatusCode, retry_after: u64, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    if status == StatusCode::SERVICE_UNAVAILABLE {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    }
    response
}

// ===== App Store receipts =====

/// Request body for submitting an App Store receipt.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceiptRequest {
    pub user_id: Uuid,
    /// The `verifyReceipt` response, as a JSON object or its text.
    pub receipt: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceiptResponse {
    pub user_id: Uuid,
    pub outcomes: Vec<Outcome>,
}

/// POST /api/v1/payments/apple/receipt
async fn submit_apple_receipt(
    State(state): State<AppState>,
    Json(request): Json<SubmitReceiptRequest>,
) -> Result<Response, AppError> {
    let raw = match request.receipt {
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    };

    let outcomes = state.engine.submit_receipt(request.user_id, &raw).await?;
    let status = outcome_status(&outcomes);

    Ok(with_status(
        status,
        state.settings.retry_after_secs,
        SubmitReceiptResponse {
            user_id: request.user_id,
            outcomes,
        },
    ))
}

// ===== Card checkout =====

/// Request body for starting a card checkout.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutRequest {
    pub user_id: Uuid,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutResponse {
    pub session_id: String,
    /// Present only when a hosted checkout page is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub product_id: String,
    /// Copy into the gateway session's metadata. The webhook reads it back.
    pub metadata: CheckoutMetadata,
}

fn validate_redirect(name: &str, url: &str) -> Result<(), AppError> {
    if url.starts_with("https://") || url.starts_with("http://") {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!(
            "{} must be an absolute http(s) URL",
            name
        )))
    }
}

/// POST /api/v1/payments/checkout/session
///
/// Maps the price to a catalog product and returns a session reference.
/// Nothing is stored: the gateway session must carry the returned `metadata`
/// (`user_id`, `price_id`) or its completion webhook cannot be attributed.
async fn create_checkout_session(
    State(state): State<AppState>,
    Json(request): Json<CreateCheckoutRequest>,
) -> Result<Json<CreateCheckoutResponse>, AppError> {
    validate_redirect("successUrl", &request.success_url)?;
    validate_redirect("cancelUrl", &request.cancel_url)?;

    let product = state
        .engine
        .catalog()
        .by_price_id(&request.price_id)
        .ok_or_else(|| AppError::Unprocessable(format!("Unknown price: {}", request.price_id)))?;

    let session_id = format!("cs_{}", Uuid::new_v4().simple());
    tracing::info!(
        user_id = %request.user_id,
        session_id = %session_id,
        product_id = %product.id,
        "Checkout session created"
    );

    Ok(Json(CreateCheckoutResponse {
        url: state
            .settings
            .checkout_base_url
            .as_ref()
            .map(|base| format!("{}/{}", base, session_id)),
        session_id,
        product_id: product.id.clone(),
        metadata: CheckoutMetadata {
            user_id: Some(request.user_id.to_string()),
            price_id: Some(request.price_id.clone()),
        },
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub received: bool,
    pub event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignored: Option<String>,
}

/// POST /api/v1/payments/webhook/stripe
///
/// The body is read raw because the signature covers the exact bytes.
async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    // Step 1: Verify webhook signature
    match &state.settings.stripe_webhook_secret {
        Some(secret) => {
            let signature = headers
                .get("stripe-signature")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| AppError::Unauthorized("Missing Stripe-Signature".to_string()))?;
            stripe::verify_signature(&body, signature, secret, Utc::now().timestamp())
                .map_err(|e| AppError::Unauthorized(e.to_string()))?;
        }
        None => tracing::warn!("Stripe webhook accepted without signature verification"),
    }

    // Step 2: Classify the event
    let event = StripeEvent::from_slice(&body).map_err(|e| AppError::BadRequest(e.to_string()))?;
    let event_id = event.id.clone();
    let event_type = event.event_type.clone();

    let (user_id, completion) = match event
        .into_checkout_event()
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        CheckoutEvent::Paid {
            user_id,
            completion,
        } => (user_id, completion),
        CheckoutEvent::Ignored(reason) => {
            tracing::debug!(event_id = %event_id, event_type = %event_type, "Webhook ignored");
            return Ok(Json(WebhookResponse {
                received: true,
                event_id,
                outcome: None,
                ignored: Some(reason),
            })
            .into_response());
        }
    };

    // Step 3: Reconcile the payment
    let outcome = state.engine.complete_checkout(user_id, &completion).await?;
    let status = outcome_status(std::slice::from_ref(&outcome));

    Ok(with_status(
        status,
        state.settings.retry_after_secs,
        WebhookResponse {
            received: true,
            event_id,
            outcome: Some(outcome),
            ignored: None,
        },
    ))
}

// ===== Orders =====

/// Order with display fields derived from the catalog.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    #[serde(flatten)]
    pub order: Order,
    pub product_name: Option<String>,
    pub subscription: bool,
}

/// GET /api/v1/payments/orders/{method}/{external_id}
async fn get_order(
    State(state): State<AppState>,
    Path((method, external_id)): Path<(PaymentMethod, String)>,
) -> Result<Json<OrderView>, AppError> {
    let order = state
        .engine
        .order(method, &external_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Order {} not found", external_id)))?;

    let product = state.engine.catalog().product(&order.product_id);
    Ok(Json(OrderView {
        product_name: product.map(|p| p.name.clone()),
        subscription: product.is_some_and(|p| p.is_subscription()),
        order,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReverseOrderRequest {
    pub reason: String,
}

/// POST /api/v1/payments/orders/{method}/{external_id}/reverse
async fn reverse_order(
    State(state): State<AppState>,
    Path((method, external_id)): Path<(PaymentMethod, String)>,
    Json(request): Json<ReverseOrderRequest>,
) -> Result<Json<Reversal>, AppError> {
    if request.reason.trim().is_empty() {
        return Err(AppError::BadRequest("Reason is required".to_string()));
    }
    let reversal = state
        .engine
        .reverse(method, &external_id, request.reason.trim())
        .await?;
    Ok(Json(reversal))
}

// ===== Ledger =====

#[derive(Debug, Default, Deserialize)]
pub struct RetryGrantsRequest {
    #[serde(default)]
    pub limit: Option<i64>,
}

/// POST /api/v1/payments/ledger/retry
async fn retry_pending_grants(
    State(state): State<AppState>,
    Json(request): Json<RetryGrantsRequest>,
) -> Result<Json<GrantSweep>, AppError> {
    let limit = request.limit.unwrap_or(DEFAULT_SWEEP_LIMIT);
    if !(1..=MAX_SWEEP_LIMIT).contains(&limit) {
        return Err(AppError::BadRequest(format!(
            "Limit must be between 1 and {}",
            MAX_SWEEP_LIMIT
        )));
    }

    let sweep = state.engine.retry_pending_grants(limit).await?;
    Ok(Json(sweep))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected() -> Outcome {
        Outcome::Rejected {
            reason: "Unknown product: gold".to_string(),
            status: None,
        }
    }

    fn retry() -> Outcome {
        Outcome::RetryLater {
            reason: "Provider temporarily unavailable (status 21005)".to_string(),
            status: Some(21005),
        }
    }

    #[test]
    fn test_outcome_status() {
        assert_eq!(outcome_status(&[]), StatusCode::OK);
        assert_eq!(outcome_status(&[retry()]), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            outcome_status(&[rejected(), rejected()]),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            outcome_status(&[rejected(), retry()]),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_validate_redirect() {
        assert!(validate_redirect("successUrl", "https://nutrio.app/ok").is_ok());
        assert!(matches!(
            validate_redirect("cancelUrl", "nutrio://cancel"),
            Err(AppError::BadRequest(_))
        ));
    }
}
