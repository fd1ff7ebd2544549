//! Read-only entitlement queries.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::UserSubscription;
use crate::store::{PaymentStore, StoreError};

/// A user's standing for one product at a given instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub user_id: Uuid,
    pub product_id: String,
    pub entitled: bool,
    pub is_active: bool,
    pub valid_at: Option<DateTime<Utc>>,
    pub valid_days: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Entitlement {
    fn derive(
        user_id: Uuid,
        product_id: &str,
        subscription: Option<&UserSubscription>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            product_id: product_id.to_string(),
            entitled: subscription.is_some_and(|s| s.is_entitled_at(now)),
            is_active: subscription.is_some_and(|s| s.is_active),
            valid_at: subscription.map(|s| s.valid_at),
            valid_days: subscription.map(|s| s.valid_days),
            expires_at: subscription.map(UserSubscription::expires_at),
        }
    }
}

/// Reads committed ledger state. Nothing is cached.
pub struct EntitlementGateway {
    store: Arc<dyn PaymentStore>,
}

impl EntitlementGateway {
    pub fn new(store: Arc<dyn PaymentStore>) -> Self {
        Self { store }
    }

    pub async fn is_entitled(
        &self,
        user_id: Uuid,
        product_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.entitlement(user_id, product_id, now).await?.entitled)
    }

    pub async fn entitlement(
        &self,
        user_id: Uuid,
        product_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Entitlement, StoreError> {
        let subscription = self.store.subscription(user_id, product_id).await?;
        Ok(Entitlement::derive(
            user_id,
            product_id,
            subscription.as_ref(),
            now,
        ))
    }

    pub async fn subscriptions(&self, user_id: Uuid) -> Result<Vec<UserSubscription>, StoreError> {
        self.store.subscriptions(user_id).await
    }

    pub async fn coin_balance(&self, user_id: Uuid) -> Result<i64, StoreError> {
        self.store.coin_balance(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_derive_without_subscription() {
        let user_id = Uuid::new_v4();
        let entitlement = Entitlement::derive(user_id, "premium_monthly", None, Utc::now());
        assert!(!entitlement.entitled);
        assert!(!entitlement.is_active);
        assert_eq!(entitlement.expires_at, None);
    }

    #[test]
    fn test_derive_window() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let sub = UserSubscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            product_id: "premium_monthly".to_string(),
            value_coins: 100,
            is_active: true,
            valid_at: start,
            valid_days: 30,
            created_at: start,
            modified_at: start,
        };

        let inside = Entitlement::derive(sub.user_id, "premium_monthly", Some(&sub), start);
        assert!(inside.entitled);
        assert_eq!(inside.expires_at, Some(start + Duration::days(30)));

        let after = Entitlement::derive(
            sub.user_id,
            "premium_monthly",
            Some(&sub),
            start + Duration::days(30),
        );
        assert!(!after.entitled);
        assert!(after.is_active);
    }
}
