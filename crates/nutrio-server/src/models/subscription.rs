//! User subscription model: the entitlement window for one product.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Represents a user's subscription to a product.
///
/// The window runs from `valid_at` for `valid_days` days. Only the ledger
/// writes these rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserSubscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub product_id: String,
    /// Coins granted per paid term.
    pub value_coins: i64,
    pub is_active: bool,
    pub valid_at: DateTime<Utc>,
    pub valid_days: i64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl UserSubscription {
    /// The instant the window closes.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.valid_at + Duration::days(self.valid_days)
    }

    /// Returns true if the window closed strictly before `at`.
    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        self.expires_at() < at
    }

    pub fn is_entitled_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && now < self.expires_at()
    }
}
