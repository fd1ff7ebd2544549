//! Stripe webhook signatures and the checkout event payload.

use hmac::{Hmac, Mac};
use nutrio_receipts::CheckoutCompletion;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age for webhook events (5 minutes).
pub const MAX_TIMESTAMP_AGE_SECS: i64 = 300;

/// Clock skew tolerance for future timestamps.
const MAX_FUTURE_TOLERANCE_SECS: i64 = 60;

/// Reasons a webhook delivery is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("Malformed Stripe-Signature header")]
    MalformedHeader,

    #[error("Event too old ({0} seconds)")]
    Expired(i64),

    #[error("Event timestamp in future")]
    FromFuture,

    #[error("Invalid signature")]
    Mismatch,
}

/// Parsed `Stripe-Signature` header: `t=<unix>,v1=<hex>[,v1=<hex>...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    pub signatures: Vec<Vec<u8>>,
}

impl SignatureHeader {
    pub fn parse(header: &str) -> Result<Self, SignatureError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let (key, value) = part
                .trim()
                .split_once('=')
                .ok_or(SignatureError::MalformedHeader)?;
            match key {
                "t" => {
                    timestamp = Some(
                        value
                            .parse::<i64>()
                            .map_err(|_| SignatureError::MalformedHeader)?,
                    )
                }
                // Unknown schemes (v0) are ignored.
                "v1" => {
                    if let Ok(bytes) = hex::decode(value) {
                        signatures.push(bytes);
                    }
                }
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::MalformedHeader)?;
        if signatures.is_empty() {
            return Err(SignatureError::MalformedHeader);
        }
        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

fn mac_for(secret: &str, timestamp: i64, payload: &[u8]) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac
}

/// Hex signature Stripe would send for `payload` at `timestamp`.
pub fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    hex::encode(mac_for(secret, timestamp, payload).finalize().into_bytes())
}

/// Verifies a webhook delivery against the endpoint secret.
///
/// `now` is a unix timestamp in seconds. Comparison is constant-time.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: i64,
) -> Result<(), SignatureError> {
    let header = SignatureHeader::parse(header)?;

    let age = now - header.timestamp;
    if age > MAX_TIMESTAMP_AGE_SECS {
        tracing::warn!(
            event_timestamp = header.timestamp,
            age_secs = age,
            "Webhook event too old - possible replay"
        );
        return Err(SignatureError::Expired(age));
    }
    if age < -MAX_FUTURE_TOLERANCE_SECS {
        tracing::warn!(
            event_timestamp = header.timestamp,
            current_time = now,
            "Webhook event from future"
        );
        return Err(SignatureError::FromFuture);
    }

    let mac = mac_for(secret, header.timestamp, payload);
    let matched = header
        .signatures
        .iter()
        .any(|candidate| mac.clone().verify_slice(candidate).is_ok());
    if !matched {
        tracing::warn!("Invalid webhook signature");
        return Err(SignatureError::Mismatch);
    }
    Ok(())
}

/// Envelope of a Stripe event. Only checkout sessions are decoded further.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: CheckoutMetadata,
}

/// Metadata the session must carry for its completion to be attributed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutMetadata {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub price_id: Option<String>,
}

/// What the webhook handler should do with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutEvent {
    /// Payment captured. Reconcile it.
    Paid {
        user_id: Uuid,
        completion: CheckoutCompletion,
    },
    /// Acknowledge without touching any state.
    Ignored(String),
}

/// Errors decoding a checkout event that should have been reconcilable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("Invalid event payload: {0}")]
    Payload(String),

    #[error("Checkout session {0} carries no user id")]
    MissingUser(String),

    #[error("Checkout session {0} carries no price id")]
    MissingPrice(String),
}

impl StripeEvent {
    pub fn from_slice(payload: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(payload).map_err(|e| EventError::Payload(e.to_string()))
    }

    /// Classifies the event.
    ///
    /// `checkout.session.completed` is reconciled only once the session reports
    /// `paid`. Delayed methods arrive later as
    /// `checkout.session.async_payment_succeeded`.
    pub fn into_checkout_event(self) -> Result<CheckoutEvent, EventError> {
        match self.event_type.as_str() {
            "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {}
            other => return Ok(CheckoutEvent::Ignored(format!("event type {}", other))),
        }

        let session: CheckoutSession = serde_json::from_value(self.data.object)
            .map_err(|e| EventError::Payload(e.to_string()))?;

        if session.payment_status.as_deref() != Some("paid") {
            return Ok(CheckoutEvent::Ignored(format!(
                "session {} not paid yet",
                session.id
            )));
        }

        let user_id = session
            .metadata
            .user_id
            .as_deref()
            .or(session.client_reference_id.as_deref())
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| EventError::MissingUser(session.id.clone()))?;

        let price_id = session
            .metadata
            .price_id
            .clone()
            .ok_or_else(|| EventError::MissingPrice(session.id.clone()))?;

        Ok(CheckoutEvent::Paid {
            user_id,
            completion: CheckoutCompletion {
                session_id: session.id,
                price_id,
                amount_total: session.amount_total,
                currency: session.currency,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_717_000_000;

    fn signed_header(payload: &[u8], timestamp: i64) -> String {
        format!(
            "t={},v1={}",
            timestamp,
            compute_signature(SECRET, timestamp, payload)
        )
    }

    #[test]
    fn test_parse_header() {
        let header = SignatureHeader::parse("t=1717000000,v1=abcd,v0=ffff,v1=0102").unwrap();
        assert_eq!(header.timestamp, 1_717_000_000);
        assert_eq!(header.signatures, vec![vec![0xab, 0xcd], vec![0x01, 0x02]]);
    }

    #[test]
    fn test_parse_header_rejects_missing_parts() {
        assert_eq!(
            SignatureHeader::parse("v1=abcd"),
            Err(SignatureError::MalformedHeader)
        );
        assert_eq!(
            SignatureHeader::parse("t=1717000000"),
            Err(SignatureError::MalformedHeader)
        );
        assert_eq!(
            SignatureHeader::parse("garbage"),
            Err(SignatureError::MalformedHeader)
        );
    }

    #[test]
    fn test_verify_valid_signature() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = signed_header(payload, NOW - 10);
        assert_eq!(verify_signature(payload, &header, SECRET, NOW), Ok(()));
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let header = signed_header(br#"{"id":"evt_1"}"#, NOW);
        assert_eq!(
            verify_signature(br#"{"id":"evt_2"}"#, &header, SECRET, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_verify_rejects_wrong_secret() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = signed_header(payload, NOW);
        assert_eq!(
            verify_signature(payload, &header, "whsec_other", NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_verify_timestamp_window() {
        let payload = br#"{"id":"evt_1"}"#;

        let old = signed_header(payload, NOW - MAX_TIMESTAMP_AGE_SECS - 1);
        assert_eq!(
            verify_signature(payload, &old, SECRET, NOW),
            Err(SignatureError::Expired(MAX_TIMESTAMP_AGE_SECS + 1))
        );

        let future = signed_header(payload, NOW + 120);
        assert_eq!(
            verify_signature(payload, &future, SECRET, NOW),
            Err(SignatureError::FromFuture)
        );

        let slight_skew = signed_header(payload, NOW + 30);
        assert_eq!(verify_signature(payload, &slight_skew, SECRET, NOW), Ok(()));
    }

    fn event(event_type: &str, object: serde_json::Value) -> StripeEvent {
        serde_json::from_value(json!({
            "id": "evt_1",
            "type": event_type,
            "data": { "object": object }
        }))
        .unwrap()
    }

    #[test]
    fn test_paid_checkout_session() {
        let user_id = Uuid::new_v4();
        let event = event(
            "checkout.session.completed",
            json!({
                "id": "cs_test_1",
                "payment_status": "paid",
                "amount_total": 999,
                "currency": "usd",
                "metadata": { "user_id": user_id.to_string(), "price_id": "price_premium_monthly" }
            }),
        );

        assert_eq!(
            event.into_checkout_event().unwrap(),
            CheckoutEvent::Paid {
                user_id,
                completion: CheckoutCompletion {
                    session_id: "cs_test_1".to_string(),
                    price_id: "price_premium_monthly".to_string(),
                    amount_total: Some(999),
                    currency: Some("usd".to_string()),
                },
            }
        );
    }

    #[test]
    fn test_client_reference_id_fallback() {
        let user_id = Uuid::new_v4();
        let event = event(
            "checkout.session.async_payment_succeeded",
            json!({
                "id": "cs_test_2",
                "payment_status": "paid",
                "client_reference_id": user_id.to_string(),
                "metadata": { "price_id": "price_recipe_pack" }
            }),
        );

        match event.into_checkout_event().unwrap() {
            CheckoutEvent::Paid { user_id: got, .. } => assert_eq!(got, user_id),
            other => panic!("expected paid event, got {:?}", other),
        }
    }

    #[test]
    fn test_unpaid_and_other_events_are_ignored() {
        let unpaid = event(
            "checkout.session.completed",
            json!({ "id": "cs_test_3", "payment_status": "unpaid" }),
        );
        assert!(matches!(
            unpaid.into_checkout_event().unwrap(),
            CheckoutEvent::Ignored(_)
        ));

        let other = event("invoice.paid", json!({ "id": "in_1" }));
        assert_eq!(
            other.into_checkout_event().unwrap(),
            CheckoutEvent::Ignored("event type invoice.paid".to_string())
        );
    }

    #[test]
    fn test_missing_user_is_an_error() {
        let event = event(
            "checkout.session.completed",
            json!({
                "id": "cs_test_4",
                "payment_status": "paid",
                "metadata": { "price_id": "price_recipe_pack" }
            }),
        );
        assert_eq!(
            event.into_checkout_event(),
            Err(EventError::MissingUser("cs_test_4".to_string()))
        );
    }
}
