//! The provider-agnostic transaction record.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a payment signal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// App Store in-app purchase receipts.
    Apple,
    /// Card payments through a hosted checkout session.
    CardGateway,
}

/// One payment or purchase event, independent of the provider that reported it.
///
/// `provider_transaction_id` is unique per provider. Delivering the same id
/// twice describes the same purchase and must never be applied twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedTransaction {
    pub provider: Provider,
    pub provider_transaction_id: String,
    /// Groups renewals of one subscription. Card payments reuse the session id.
    pub original_transaction_id: String,
    pub product_id: String,
    /// Unset when the provider sent a date we could not read.
    pub purchased_at: Option<DateTime<Utc>>,
    pub original_purchased_at: Option<DateTime<Utc>>,
    pub quantity: u32,
    pub raw_status: Option<i64>,
    /// Captured amount in major currency units. Receipt-only flows carry none.
    pub amount: Option<BigDecimal>,
    pub currency: Option<String>,
    /// App bundle the receipt was issued for.
    pub bundle_id: Option<String>,
}

impl NormalizedTransaction {
    /// Returns true if this transaction renews an earlier purchase.
    pub fn is_renewal(&self) -> bool {
        self.provider_transaction_id != self.original_transaction_id
    }
}
