//! Order model: the durable record of one payment attempt.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use nutrio_receipts::{NormalizedTransaction, Provider};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use uuid::Uuid;

/// How the order was paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_method", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// App Store in-app purchase.
    AppleIap,
    /// Hosted card checkout.
    CardGateway,
}

impl From<Provider> for PaymentMethod {
    fn from(provider: Provider) -> Self {
        match provider {
            Provider::Apple => PaymentMethod::AppleIap,
            Provider::CardGateway => PaymentMethod::CardGateway,
        }
    }
}

/// Order lifecycle states.
///
/// `Pending -> Paid`, `Pending -> Failed` and `Paid -> Refunded` are the only
/// legal moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "order_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Seen but not yet verified.
    Pending,
    /// Verified payment.
    Paid,
    /// Verification failed.
    Failed,
    /// Payment reversed after it was paid.
    Refunded,
}

/// Rejected status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid order transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: OrderStatus,
    pub to: OrderStatus,
}

impl OrderStatus {
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Paid)
                | (OrderStatus::Pending, OrderStatus::Failed)
                | (OrderStatus::Paid, OrderStatus::Refunded)
        )
    }

    pub fn transition(self, next: OrderStatus) -> Result<OrderStatus, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Returns true once the purchase flow is over for this order.
    pub fn is_settled(self) -> bool {
        self != OrderStatus::Pending
    }
}

/// Where the order stands with respect to the coin/subscription ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "ledger_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    /// One-off product or unpaid order.
    NotRequired,
    /// Paid subscription order whose grant has not committed yet.
    Pending,
    /// Grant committed.
    Applied,
    /// Grant compensated after a refund.
    Reversed,
}

/// Represents an order row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    /// Provider transaction id. Unique per payment method.
    pub external_id: String,
    pub user_id: Uuid,
    pub product_id: String,
    pub payment_method: PaymentMethod,
    pub amount: Option<BigDecimal>,
    pub currency: Option<String>,
    pub status: OrderStatus,
    /// Free-text diagnostic, set when verification fails or the order is reversed.
    pub status_information: Option<String>,
    pub ledger_state: LedgerState,
    pub purchased_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Order {
    pub fn is_pending(&self) -> bool {
        self.status == OrderStatus::Pending
    }

    pub fn is_paid(&self) -> bool {
        self.status == OrderStatus::Paid
    }

    pub fn is_failed(&self) -> bool {
        self.status == OrderStatus::Failed
    }

    pub fn is_refunded(&self) -> bool {
        self.status == OrderStatus::Refunded
    }

    /// Paid, but the grant has not been recorded.
    pub fn awaits_ledger(&self) -> bool {
        self.is_paid() && self.ledger_state == LedgerState::Pending
    }
}

/// Data required to create a new order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrder {
    pub external_id: String,
    pub user_id: Uuid,
    pub product_id: String,
    pub payment_method: PaymentMethod,
    pub amount: Option<BigDecimal>,
    pub currency: Option<String>,
    pub purchased_at: Option<DateTime<Utc>>,
}

impl NewOrder {
    pub fn from_transaction(user_id: Uuid, tx: &NormalizedTransaction) -> Self {
        Self {
            external_id: tx.provider_transaction_id.clone(),
            user_id,
            product_id: tx.product_id.clone(),
            payment_method: tx.provider.into(),
            amount: tx.amount.clone(),
            currency: tx.currency.clone(),
            purchased_at: tx.purchased_at,
        }
    }
}

/// The verdict applied to a freshly created pending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub status: OrderStatus,
    pub status_information: Option<String>,
    pub ledger_state: LedgerState,
}

impl Settlement {
    pub fn paid(grants_subscription: bool) -> Self {
        Self {
            status: OrderStatus::Paid,
            status_information: None,
            ledger_state: if grants_subscription {
                LedgerState::Pending
            } else {
                LedgerState::NotRequired
            },
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: OrderStatus::Failed,
            status_information: Some(reason.into()),
            ledger_state: LedgerState::NotRequired,
        }
    }
}
