//! Subscription windows and the coin balance.
//!
//! Every mutation runs inside one per-user ledger transaction, so two terms
//! applied concurrently for the same user cannot lose an update. Grants and
//! revocations are keyed by order, which makes both safe to repeat.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use nutrio_receipts::{Product, Term, UnknownProduct};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::models::{CoinEventType, NewCoinLedgerEntry, Order, UserSubscription};
use crate::store::{PaymentStore, StoreError, UserLedger};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The product grants no term.
    #[error(transparent)]
    UnknownProduct(#[from] UnknownProduct),

    /// A refund was recorded for the order before its grant could apply.
    #[error("Order {0} was reversed before its grant applied")]
    Reversed(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An entitlement window: `valid_at` plus `valid_days`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub valid_at: DateTime<Utc>,
    pub valid_days: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowChange {
    /// No usable window existed. A fresh one starts at the purchase.
    Started,
    /// The running window was pushed out by one term.
    Extended,
}

/// Computes the window after one more paid term.
///
/// A renewal bought while the current window is still open stacks on top of
/// it. After a gap, or when the window was deactivated, the new window starts
/// at `reference`.
pub fn next_window(
    current: Option<&UserSubscription>,
    term_days: i64,
    reference: DateTime<Utc>,
) -> (Window, WindowChange) {
    match current {
        Some(sub) if sub.is_active && !sub.is_expired_at(reference) => (
            Window {
                valid_at: sub.valid_at,
                valid_days: sub.valid_days + term_days,
            },
            WindowChange::Extended,
        ),
        _ => (
            Window {
                valid_at: reference,
                valid_days: term_days,
            },
            WindowChange::Started,
        ),
    }
}

/// Result of applying an order's grant.
#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    pub subscription: UserSubscription,
    pub balance: i64,
    /// `None` when the grant for this order had already been recorded.
    pub change: Option<WindowChange>,
}

/// Result of compensating an order's grant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Revocation {
    pub subscription: Option<UserSubscription>,
    pub coins_revoked: i64,
    /// Granted coins the balance could no longer cover.
    pub shortfall: i64,
    pub balance: i64,
}

pub struct SubscriptionLedger {
    store: Arc<dyn PaymentStore>,
}

fn term_of(product: &Product) -> Result<Term, UnknownProduct> {
    product
        .term()
        .ok_or_else(|| UnknownProduct(product.id.clone()))
}

impl SubscriptionLedger {
    pub fn new(store: Arc<dyn PaymentStore>) -> Self {
        Self { store }
    }

    /// Applies the term bought by a paid order.
    ///
    /// The window is measured from the order's purchase instant, falling back
    /// to `now` when the provider gave none. Fails with
    /// [`LedgerError::Reversed`] once the order's refund has been recorded.
    pub async fn apply(
        &self,
        order: &Order,
        product: &Product,
        now: DateTime<Utc>,
    ) -> Result<Grant, LedgerError> {
        let term = term_of(product)?;
        let mut ledger = self.store.lock_user(order.user_id).await?;

        if ledger.has_entry(order.id, CoinEventType::Revoke).await? {
            return Err(LedgerError::Reversed(order.id));
        }

        if ledger.has_entry(order.id, CoinEventType::Grant).await? {
            let subscription = ledger.subscription(&product.id).await?.ok_or_else(|| {
                StoreError::Internal(format!(
                    "Grant recorded for order {} but no subscription row",
                    order.id
                ))
            })?;
            let balance = ledger.balance().await?;
            ledger.commit().await?;
            return Ok(Grant {
                subscription,
                balance,
                change: None,
            });
        }

        let current = ledger.subscription(&product.id).await?;
        let reference = order.purchased_at.unwrap_or(now);
        let (window, change) = next_window(current.as_ref(), i64::from(term.days), reference);

        let subscription = match current {
            Some(existing) => UserSubscription {
                value_coins: term.value_coins,
                is_active: true,
                valid_at: window.valid_at,
                valid_days: window.valid_days,
                modified_at: now,
                ..existing
            },
            None => UserSubscription {
                id: Uuid::new_v4(),
                user_id: order.user_id,
                product_id: product.id.clone(),
                value_coins: term.value_coins,
                is_active: true,
                valid_at: window.valid_at,
                valid_days: window.valid_days,
                created_at: now,
                modified_at: now,
            },
        };
        ledger.save_subscription(&subscription).await?;

        let balance = ledger
            .append_entry(NewCoinLedgerEntry::grant(
                order.user_id,
                order.id,
                term.value_coins,
                json!({
                    "productId": product.id,
                    "externalId": order.external_id,
                    "validAt": subscription.valid_at,
                    "validDays": subscription.valid_days,
                }),
            ))
            .await?;
        ledger.commit().await?;

        tracing::info!(
            user_id = %order.user_id,
            order_id = %order.id,
            product_id = %product.id,
            change = ?change,
            valid_days = subscription.valid_days,
            balance,
            "Subscription term applied"
        );

        Ok(Grant {
            subscription,
            balance,
            change: Some(change),
        })
    }

    /// Compensates the grant of a refunded order.
    ///
    /// Takes back the granted coins, never driving the balance below zero,
    /// and removes one term from the window. A window left with no days is
    /// deactivated. For an order whose grant has not landed yet, a zero-coin
    /// revoke entry is written instead, and any later grant for it is refused.
    pub async fn revoke(
        &self,
        order: &Order,
        product: &Product,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Revocation, LedgerError> {
        let term = term_of(product)?;
        let mut ledger = self.store.lock_user(order.user_id).await?;

        if ledger.has_entry(order.id, CoinEventType::Revoke).await? {
            let revocation = Revocation {
                subscription: ledger.subscription(&product.id).await?,
                coins_revoked: 0,
                shortfall: 0,
                balance: ledger.balance().await?,
            };
            ledger.commit().await?;
            return Ok(revocation);
        }

        if !ledger.has_entry(order.id, CoinEventType::Grant).await? {
            let subscription = ledger.subscription(&product.id).await?;
            let balance = revoke_entry(&mut *ledger, order, 0, 0, reason).await?;
            ledger.commit().await?;

            tracing::info!(
                user_id = %order.user_id,
                order_id = %order.id,
                "Refund recorded before grant; grant blocked"
            );
            return Ok(Revocation {
                subscription,
                coins_revoked: 0,
                shortfall: 0,
                balance,
            });
        }

        let subscription = match ledger.subscription(&product.id).await? {
            Some(mut sub) => {
                sub.valid_days = (sub.valid_days - i64::from(term.days)).max(0);
                if sub.valid_days == 0 {
                    sub.is_active = false;
                }
                sub.modified_at = now;
                ledger.save_subscription(&sub).await?;
                Some(sub)
            }
            None => None,
        };

        let available = ledger.balance().await?;
        let coins_revoked = term.value_coins.min(available.max(0));
        let shortfall = term.value_coins - coins_revoked;
        if shortfall > 0 {
            tracing::warn!(
                user_id = %order.user_id,
                order_id = %order.id,
                shortfall,
                "Refunded coins already spent; balance floored at zero"
            );
        }

        let balance = revoke_entry(&mut *ledger, order, coins_revoked, shortfall, reason).await?;
        ledger.commit().await?;

        tracing::info!(
            user_id = %order.user_id,
            order_id = %order.id,
            coins_revoked,
            balance,
            "Subscription term revoked"
        );

        Ok(Revocation {
            subscription,
            coins_revoked,
            shortfall,
            balance,
        })
    }
}

async fn revoke_entry(
    ledger: &mut dyn UserLedger,
    order: &Order,
    coins: i64,
    shortfall: i64,
    reason: &str,
) -> Result<i64, StoreError> {
    ledger
        .append_entry(NewCoinLedgerEntry::revoke(
            order.user_id,
            order.id,
            coins,
            json!({
                "externalId": order.external_id,
                "reason": reason,
                "shortfall": shortfall,
            }),
        ))
        .await
}
