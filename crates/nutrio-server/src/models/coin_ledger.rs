//! Coin ledger model: immutable record of every grant and revocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use uuid::Uuid;

/// Types of coin ledger events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "coin_event_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CoinEventType {
    /// Coins granted for a paid subscription term.
    Grant,
    /// Coins taken back after a refund.
    Revoke,
}

/// Represents an immutable ledger entry.
///
/// At most one entry of each type exists per order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CoinLedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub order_id: Uuid,
    pub event_type: CoinEventType,
    /// Always non-negative. The event type carries the sign.
    pub coins: i64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Data required to create a new ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCoinLedgerEntry {
    pub user_id: Uuid,
    pub order_id: Uuid,
    pub event_type: CoinEventType,
    pub coins: i64,
    pub metadata: serde_json::Value,
}

impl NewCoinLedgerEntry {
    pub fn grant(user_id: Uuid, order_id: Uuid, coins: i64, metadata: serde_json::Value) -> Self {
        Self {
            user_id,
            order_id,
            event_type: CoinEventType::Grant,
            coins,
            metadata,
        }
    }

    pub fn revoke(user_id: Uuid, order_id: Uuid, coins: i64, metadata: serde_json::Value) -> Self {
        Self {
            user_id,
            order_id,
            event_type: CoinEventType::Revoke,
            coins,
            metadata,
        }
    }

    /// The change this entry makes to the balance.
    pub fn balance_delta(&self) -> i64 {
        match self.event_type {
            CoinEventType::Grant => self.coins,
            CoinEventType::Revoke => -self.coins,
        }
    }
}
