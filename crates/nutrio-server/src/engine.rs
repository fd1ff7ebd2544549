//! Payment reconciliation engine.
//!
//! Raw provider payloads are normalized, checked against earlier deliveries,
//! written as settled orders and, for paid subscription orders, applied to
//! the user's ledger. Callers get one [`Outcome`] per transaction.
//!
//! The order write and the ledger write are separate units on purpose: a paid
//! order is never rolled back because its grant failed. Such orders stay in
//! ledger state `pending` until [`PaymentEngine::retry_pending_grants`]
//! applies them.

pub mod dedup;
pub mod entitlement;
pub mod ledger;
pub mod orders;

use std::sync::Arc;

use chrono::Utc;
use nutrio_receipts::{
    normalize_checkout, parse_receipt, CheckoutCompletion, NormalizedTransaction, Product,
    ProductCatalog, ReceiptError, ReceiptStatus, UnknownProduct,
};
use serde::Serialize;
use uuid::Uuid;

use crate::models::{InvalidTransition, LedgerState, Order, PaymentMethod, UserSubscription};
use crate::store::{PaymentStore, StoreError};

pub use dedup::TransactionDeduplicator;
pub use entitlement::{Entitlement, EntitlementGateway};
pub use ledger::{
    next_window, Grant, LedgerError, Revocation, SubscriptionLedger, Window, WindowChange,
};
pub use orders::{OrderReconciler, Reconciled, Reversed};

/// Engine errors that are not a per-transaction outcome.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Receipt(#[from] ReceiptError),

    #[error(transparent)]
    UnknownProduct(#[from] UnknownProduct),

    #[error("Order not found: {method:?} {external_id}")]
    OrderNotFound {
        method: PaymentMethod,
        external_id: String,
    },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconcileError {
    /// Turns payload problems into the outcome the caller reports.
    /// Anything else stays an error.
    pub fn into_outcome(self) -> Result<Outcome, ReconcileError> {
        match self {
            ReconcileError::Receipt(e) if e.is_retryable() => Ok(Outcome::RetryLater {
                reason: e.to_string(),
                status: e.status(),
            }),
            ReconcileError::Receipt(e) => Ok(Outcome::Rejected {
                reason: e.to_string(),
                status: e.status(),
            }),
            ReconcileError::UnknownProduct(e) => Ok(Outcome::Rejected {
                reason: e.to_string(),
                status: None,
            }),
            other => Err(other),
        }
    }
}

/// What happened to the ledger for a newly processed order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LedgerResult {
    /// One-off product or failed order.
    NotApplicable,
    Applied {
        subscription: UserSubscription,
        balance: i64,
    },
    /// The order is paid and durable. The grant is retried out of band.
    Failed { reason: String },
    /// The order was refunded before its grant applied. Nothing was granted.
    Reversed,
}

/// Result of feeding one transaction through the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// First delivery. The order is settled.
    Processed { order: Order, ledger: LedgerResult },
    /// Seen before. Nothing was written.
    AlreadyProcessed { order: Order },
    /// The provider had a temporary problem. Nothing was written.
    RetryLater { reason: String, status: Option<i64> },
    /// Malformed payload or unknown product. Nothing was written.
    Rejected { reason: String, status: Option<i64> },
}

impl Outcome {
    pub fn order(&self) -> Option<&Order> {
        match self {
            Outcome::Processed { order, .. } | Outcome::AlreadyProcessed { order } => Some(order),
            _ => None,
        }
    }
}

/// Ledger compensation performed by a reversal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Compensation {
    NotApplicable,
    Reversed(Revocation),
    /// The order is refunded. Call reverse again to retry the compensation.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reversal {
    pub order: Order,
    pub already_refunded: bool,
    pub compensation: Compensation,
}

/// Summary of one pass over paid orders still awaiting their grant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantSweep {
    pub examined: usize,
    pub applied: usize,
    pub failed: Vec<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    /// When set, Apple receipts for any other bundle settle as failed.
    pub apple_bundle_id: Option<String>,
}

pub struct PaymentEngine {
    store: Arc<dyn PaymentStore>,
    catalog: Arc<ProductCatalog>,
    dedup: TransactionDeduplicator,
    orders: OrderReconciler,
    ledger: SubscriptionLedger,
    entitlements: EntitlementGateway,
}

impl PaymentEngine {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        catalog: Arc<ProductCatalog>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            dedup: TransactionDeduplicator::new(store.clone()),
            orders: OrderReconciler::new(store.clone(), settings.apple_bundle_id),
            ledger: SubscriptionLedger::new(store.clone()),
            entitlements: EntitlementGateway::new(store.clone()),
            store,
            catalog,
        }
    }

    pub fn catalog(&self) -> &ProductCatalog {
        &self.catalog
    }

    pub fn entitlements(&self) -> &EntitlementGateway {
        &self.entitlements
    }

    /// Reconciles every line item of an App Store receipt for `user_id`.
    ///
    /// A receipt the provider could not serve yields a single `RetryLater`,
    /// a malformed one a single `Rejected`.
    pub async fn submit_receipt(
        &self,
        user_id: Uuid,
        raw: &str,
    ) -> Result<Vec<Outcome>, ReconcileError> {
        let parsed = match parse_receipt(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                let status = e.status().map(ReceiptStatus::from_code);
                tracing::warn!(
                    user_id = %user_id,
                    status = ?e.status(),
                    description = status.map(|s| s.describe()).unwrap_or("unreadable payload"),
                    retryable = e.is_retryable(),
                    "Receipt not accepted"
                );
                return Ok(vec![ReconcileError::from(e).into_outcome()?]);
            }
        };

        tracing::info!(
            user_id = %user_id,
            bundle_id = parsed.bundle_id.as_deref().unwrap_or(""),
            transactions = parsed.transactions.len(),
            "Receipt valid"
        );

        let mut outcomes = Vec::with_capacity(parsed.transactions.len());
        for tx in parsed.transactions {
            outcomes.push(self.reconcile(user_id, tx).await?);
        }
        Ok(outcomes)
    }

    /// Reconciles a completed card checkout session.
    pub async fn complete_checkout(
        &self,
        user_id: Uuid,
        completion: &CheckoutCompletion,
    ) -> Result<Outcome, ReconcileError> {
        match normalize_checkout(completion, &self.catalog, Utc::now()) {
            Ok(tx) => self.reconcile(user_id, tx).await,
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    session_id = %completion.session_id,
                    price_id = %completion.price_id,
                    "Checkout for unknown price"
                );
                ReconcileError::from(e).into_outcome()
            }
        }
    }

    /// Reconciles one normalized transaction.
    pub async fn reconcile(
        &self,
        user_id: Uuid,
        tx: NormalizedTransaction,
    ) -> Result<Outcome, ReconcileError> {
        // Step 1: Resolve the product before anything is written
        let product = match self.catalog.resolve(&tx.product_id) {
            Ok(product) => product,
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    external_id = %tx.provider_transaction_id,
                    product_id = %tx.product_id,
                    "Transaction for unknown product"
                );
                return ReconcileError::from(e).into_outcome();
            }
        };

        // Step 2: Cheap exit for redeliveries
        if let Some(prior) = self
            .dedup
            .prior(tx.provider, &tx.provider_transaction_id)
            .await?
        {
            return Ok(already_processed(user_id, prior));
        }

        // Step 3: Insert and settle atomically; a racing delivery loses here
        let order = match self.orders.reconcile(user_id, &tx, product).await? {
            Reconciled::Settled(order) => order,
            Reconciled::Duplicate(prior) => return Ok(already_processed(user_id, prior)),
        };

        // Step 4: Only paid subscription orders touch the ledger
        if !order.awaits_ledger() {
            return Ok(Outcome::Processed {
                order,
                ledger: LedgerResult::NotApplicable,
            });
        }
        let (order, ledger) = self.apply_grant(order, product).await;
        Ok(Outcome::Processed { order, ledger })
    }

    async fn apply_grant(&self, mut order: Order, product: &Product) -> (Order, LedgerResult) {
        let grant = match self.ledger.apply(&order, product, Utc::now()).await {
            Ok(grant) => grant,
            Err(LedgerError::Reversed(_)) => {
                tracing::warn!(
                    user_id = %order.user_id,
                    order_id = %order.id,
                    "Grant refused; order was refunded first"
                );
                return (self.refreshed(order).await, LedgerResult::Reversed);
            }
            Err(e) => {
                tracing::error!(
                    user_id = %order.user_id,
                    order_id = %order.id,
                    error = %e,
                    "Ledger grant failed; order stays paid with grant pending"
                );
                return (order, LedgerResult::Failed { reason: e.to_string() });
            }
        };

        match self
            .store
            .set_ledger_state(order.id, LedgerState::Pending, LedgerState::Applied)
            .await
        {
            Ok(true) => order.ledger_state = LedgerState::Applied,
            // A reversal compensated this grant and settled the state first
            Ok(false) => order = self.refreshed(order).await,
            // The grant is committed; the next sweep finds it and only flips the state.
            Err(e) => tracing::warn!(
                order_id = %order.id,
                error = %e,
                "Failed to mark grant applied"
            ),
        }

        (
            order,
            LedgerResult::Applied {
                subscription: grant.subscription,
                balance: grant.balance,
            },
        )
    }

    /// Re-reads an order, keeping the given copy if the read fails.
    async fn refreshed(&self, order: Order) -> Order {
        match self.store.get_order(order.id).await {
            Ok(Some(current)) => current,
            _ => order,
        }
    }

    /// Re-applies grants for paid orders whose ledger write never committed.
    pub async fn retry_pending_grants(&self, limit: i64) -> Result<GrantSweep, ReconcileError> {
        let orders = self.store.orders_awaiting_ledger(limit).await?;
        let mut sweep = GrantSweep {
            examined: orders.len(),
            ..GrantSweep::default()
        };

        for order in orders {
            let Some(product) = self.catalog.product(&order.product_id) else {
                tracing::warn!(
                    order_id = %order.id,
                    product_id = %order.product_id,
                    "Pending grant for product missing from catalog"
                );
                sweep.failed.push(order.id);
                continue;
            };

            let order_id = order.id;
            match self.apply_grant(order, product).await {
                (order, LedgerResult::Applied { .. })
                    if order.ledger_state == LedgerState::Applied =>
                {
                    sweep.applied += 1
                }
                _ => sweep.failed.push(order_id),
            }
        }

        if sweep.examined > 0 {
            tracing::info!(
                examined = sweep.examined,
                applied = sweep.applied,
                failed = sweep.failed.len(),
                "Pending grants swept"
            );
        }
        Ok(sweep)
    }

    /// Refunds a paid order and compensates its grant.
    ///
    /// Reversing an already refunded order returns it unchanged, except that
    /// a compensation which failed earlier is attempted again.
    pub async fn reverse(
        &self,
        method: PaymentMethod,
        external_id: &str,
        reason: &str,
    ) -> Result<Reversal, ReconcileError> {
        let (mut order, already_refunded) =
            match self.orders.reverse(method, external_id, reason).await? {
                Reversed::Refunded(order) => (order, false),
                Reversed::AlreadyRefunded(order) => (order, true),
            };

        let needs_compensation = match order.ledger_state {
            LedgerState::Applied | LedgerState::Pending => true,
            LedgerState::NotRequired | LedgerState::Reversed => false,
        };
        if !needs_compensation {
            return Ok(Reversal {
                order,
                already_refunded,
                compensation: Compensation::NotApplicable,
            });
        }

        let Some(product) = self.catalog.product(&order.product_id) else {
            let reason = UnknownProduct(order.product_id.clone()).to_string();
            return Ok(Reversal {
                order,
                already_refunded,
                compensation: Compensation::Failed { reason },
            });
        };

        let compensation = match self.ledger.revoke(&order, product, reason, Utc::now()).await {
            Ok(revocation) => {
                // A grant in flight may have moved the state to applied meanwhile
                for from in [LedgerState::Pending, LedgerState::Applied] {
                    if self
                        .store
                        .set_ledger_state(order.id, from, LedgerState::Reversed)
                        .await?
                    {
                        break;
                    }
                }
                order.ledger_state = LedgerState::Reversed;
                Compensation::Reversed(revocation)
            }
            Err(e) => {
                tracing::error!(
                    order_id = %order.id,
                    error = %e,
                    "Ledger compensation failed"
                );
                Compensation::Failed {
                    reason: e.to_string(),
                }
            }
        };

        Ok(Reversal {
            order,
            already_refunded,
            compensation,
        })
    }

    pub async fn order(
        &self,
        method: PaymentMethod,
        external_id: &str,
    ) -> Result<Option<Order>, ReconcileError> {
        Ok(self.store.find_order(method, external_id).await?)
    }
}

fn already_processed(user_id: Uuid, prior: Order) -> Outcome {
    if prior.user_id != user_id {
        tracing::warn!(
            user_id = %user_id,
            owner_id = %prior.user_id,
            external_id = %prior.external_id,
            "Transaction redelivered for a different user"
        );
    } else {
        tracing::debug!(
            user_id = %user_id,
            external_id = %prior.external_id,
            "Transaction already processed"
        );
    }
    Outcome::AlreadyProcessed { order: prior }
}
