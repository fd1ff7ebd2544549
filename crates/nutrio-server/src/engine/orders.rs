//! Order state machine.
//!
//! A new transaction is written as a pending order and settled to paid or
//! failed in the same atomic unit. Refunds move a paid order to refunded
//! through a compare-and-set, so a concurrent reversal is applied once.

use std::sync::Arc;

use nutrio_receipts::{NormalizedTransaction, Product, Provider};

use super::ReconcileError;
use crate::models::{InvalidTransition, NewOrder, Order, OrderStatus, PaymentMethod, Settlement};
use crate::store::{InsertOutcome, PaymentStore, StoreError};

/// Result of reconciling one transaction against the order table.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// This call created and settled the order.
    Settled(Order),
    /// Another delivery already did. Carries its order, unchanged.
    Duplicate(Order),
}

/// Result of a reversal request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reversed {
    /// This call moved the order from paid to refunded.
    Refunded(Order),
    /// The order was refunded before.
    AlreadyRefunded(Order),
}

pub struct OrderReconciler {
    store: Arc<dyn PaymentStore>,
    apple_bundle_id: Option<String>,
}

impl OrderReconciler {
    pub fn new(store: Arc<dyn PaymentStore>, apple_bundle_id: Option<String>) -> Self {
        Self {
            store,
            apple_bundle_id,
        }
    }

    /// Decides how a new pending order settles. Pure.
    pub fn verify(&self, tx: &NormalizedTransaction, product: &Product) -> Settlement {
        match tx.provider {
            Provider::Apple => {
                if let Some(expected) = &self.apple_bundle_id {
                    if tx.bundle_id.as_deref() != Some(expected.as_str()) {
                        return Settlement::failed("bundle id mismatch");
                    }
                }
            }
            Provider::CardGateway => {
                let Some(amount) = &tx.amount else {
                    return Settlement::failed("missing amount");
                };
                if let Some(price) = &product.price {
                    if amount != price {
                        return Settlement::failed("amount mismatch");
                    }
                }
                if let Some(expected) = &product.currency {
                    let matches = tx
                        .currency
                        .as_deref()
                        .is_some_and(|c| c.eq_ignore_ascii_case(expected));
                    if !matches {
                        return Settlement::failed("currency mismatch");
                    }
                }
            }
        }
        Settlement::paid(product.is_subscription())
    }

    /// Creates and settles the order for `tx`, unless one exists already.
    pub async fn reconcile(
        &self,
        user_id: uuid::Uuid,
        tx: &NormalizedTransaction,
        product: &Product,
    ) -> Result<Reconciled, StoreError> {
        let settlement = self.verify(tx, product);
        let new_order = NewOrder::from_transaction(user_id, tx);

        match self.store.insert_settled(new_order, settlement).await? {
            InsertOutcome::Inserted(order) => {
                if order.is_failed() {
                    tracing::warn!(
                        user_id = %user_id,
                        external_id = %order.external_id,
                        reason = order.status_information.as_deref().unwrap_or(""),
                        "Order failed verification"
                    );
                } else {
                    tracing::info!(
                        user_id = %user_id,
                        external_id = %order.external_id,
                        product_id = %order.product_id,
                        "Order paid"
                    );
                }
                Ok(Reconciled::Settled(order))
            }
            InsertOutcome::Existing(order) => Ok(Reconciled::Duplicate(order)),
        }
    }

    /// Moves a paid order to refunded.
    pub async fn reverse(
        &self,
        method: PaymentMethod,
        external_id: &str,
        reason: &str,
    ) -> Result<Reversed, ReconcileError> {
        let order = self
            .store
            .find_order(method, external_id)
            .await?
            .ok_or_else(|| ReconcileError::OrderNotFound {
                method,
                external_id: external_id.to_string(),
            })?;

        if order.is_refunded() {
            return Ok(Reversed::AlreadyRefunded(order));
        }
        order.status.transition(OrderStatus::Refunded)?;

        let updated = self
            .store
            .transition(
                order.id,
                OrderStatus::Paid,
                OrderStatus::Refunded,
                Some(reason.to_string()),
            )
            .await?;

        match updated {
            Some(refunded) => {
                tracing::info!(
                    user_id = %refunded.user_id,
                    external_id = %refunded.external_id,
                    reason,
                    "Order refunded"
                );
                Ok(Reversed::Refunded(refunded))
            }
            // Lost the race. Report whatever the winner left behind.
            None => {
                let current = self
                    .store
                    .get_order(order.id)
                    .await?
                    .ok_or(StoreError::OrderNotFound(order.id))?;
                if current.is_refunded() {
                    Ok(Reversed::AlreadyRefunded(current))
                } else {
                    Err(InvalidTransition {
                        from: current.status,
                        to: OrderStatus::Refunded,
                    }
                    .into())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use bigdecimal::BigDecimal;
    use chrono::Utc;
    use nutrio_receipts::ProductKind;
    use std::str::FromStr;

    fn monthly() -> Product {
        Product {
            id: "premium_monthly".to_string(),
            name: "Premium Monthly".to_string(),
            price_id: Some("price_premium_monthly".to_string()),
            price: Some(BigDecimal::from_str("9.99").unwrap()),
            currency: Some("usd".to_string()),
            kind: ProductKind::Subscription {
                term_days: 30,
                value_coins: 100,
            },
        }
    }

    fn card_tx(amount: Option<&str>, currency: Option<&str>) -> NormalizedTransaction {
        NormalizedTransaction {
            provider: Provider::CardGateway,
            provider_transaction_id: "cs_test_1".to_string(),
            original_transaction_id: "cs_test_1".to_string(),
            product_id: "premium_monthly".to_string(),
            purchased_at: Some(Utc::now()),
            original_purchased_at: Some(Utc::now()),
            quantity: 1,
            raw_status: None,
            amount: amount.map(|a| BigDecimal::from_str(a).unwrap()),
            currency: currency.map(str::to_string),
            bundle_id: None,
        }
    }

    fn apple_tx(bundle_id: Option<&str>) -> NormalizedTransaction {
        NormalizedTransaction {
            provider: Provider::Apple,
            provider_transaction_id: "2000000456789012".to_string(),
            original_transaction_id: "2000000456789012".to_string(),
            product_id: "premium_monthly".to_string(),
            purchased_at: Some(Utc::now()),
            original_purchased_at: Some(Utc::now()),
            quantity: 1,
            raw_status: Some(0),
            amount: None,
            currency: None,
            bundle_id: bundle_id.map(str::to_string),
        }
    }

    fn reconciler(bundle: Option<&str>) -> OrderReconciler {
        OrderReconciler::new(Arc::new(MemoryStore::new()), bundle.map(str::to_string))
    }

    #[test]
    fn test_card_payment_matching_price_is_paid() {
        let settlement = reconciler(None).verify(&card_tx(Some("9.990"), Some("USD")), &monthly());
        assert_eq!(settlement, Settlement::paid(true));
    }

    #[test]
    fn test_card_payment_mismatches_fail() {
        let reconciler = reconciler(None);
        assert_eq!(
            reconciler.verify(&card_tx(Some("1.00"), Some("usd")), &monthly()),
            Settlement::failed("amount mismatch")
        );
        assert_eq!(
            reconciler.verify(&card_tx(Some("9.99"), Some("eur")), &monthly()),
            Settlement::failed("currency mismatch")
        );
        assert_eq!(
            reconciler.verify(&card_tx(None, Some("usd")), &monthly()),
            Settlement::failed("missing amount")
        );
    }

    #[test]
    fn test_apple_bundle_check() {
        let product = monthly();
        assert_eq!(
            reconciler(None).verify(&apple_tx(Some("com.other.app")), &product),
            Settlement::paid(true)
        );
        assert_eq!(
            reconciler(Some("app.nutrio.ios")).verify(&apple_tx(Some("app.nutrio.ios")), &product),
            Settlement::paid(true)
        );
        assert_eq!(
            reconciler(Some("app.nutrio.ios")).verify(&apple_tx(Some("com.other.app")), &product),
            Settlement::failed("bundle id mismatch")
        );
        assert_eq!(
            reconciler(Some("app.nutrio.ios")).verify(&apple_tx(None), &product),
            Settlement::failed("bundle id mismatch")
        );
    }

    #[test]
    fn test_one_off_product_needs_no_ledger() {
        let product = Product {
            kind: ProductKind::OneOff,
            ..monthly()
        };
        let settlement = reconciler(None).verify(&apple_tx(None), &product);
        assert_eq!(settlement, Settlement::paid(false));
    }

    #[tokio::test]
    async fn test_reconcile_twice_returns_duplicate() {
        let reconciler = reconciler(None);
        let user_id = uuid::Uuid::new_v4();
        let tx = apple_tx(None);

        let first = reconciler.reconcile(user_id, &tx, &monthly()).await.unwrap();
        let Reconciled::Settled(order) = first else {
            panic!("first delivery should settle");
        };
        assert!(order.is_paid());

        let second = reconciler.reconcile(user_id, &tx, &monthly()).await.unwrap();
        assert_eq!(second, Reconciled::Duplicate(order));
    }

    #[tokio::test]
    async fn test_reverse_rules() {
        let reconciler = reconciler(None);
        let user_id = uuid::Uuid::new_v4();

        reconciler
            .reconcile(user_id, &apple_tx(None), &monthly())
            .await
            .unwrap();
        let refunded = reconciler
            .reverse(PaymentMethod::AppleIap, "2000000456789012", "chargeback")
            .await
            .unwrap();
        let Reversed::Refunded(order) = refunded else {
            panic!("paid order should refund");
        };
        assert_eq!(order.status_information.as_deref(), Some("chargeback"));

        let again = reconciler
            .reverse(PaymentMethod::AppleIap, "2000000456789012", "chargeback")
            .await
            .unwrap();
        assert_eq!(again, Reversed::AlreadyRefunded(order));

        reconciler
            .reconcile(user_id, &card_tx(Some("1.00"), Some("usd")), &monthly())
            .await
            .unwrap();
        let failed = reconciler
            .reverse(PaymentMethod::CardGateway, "cs_test_1", "refund")
            .await;
        assert!(matches!(
            failed,
            Err(ReconcileError::InvalidTransition(InvalidTransition {
                from: OrderStatus::Failed,
                to: OrderStatus::Refunded,
            }))
        ));

        let missing = reconciler
            .reverse(PaymentMethod::CardGateway, "cs_missing", "refund")
            .await;
        assert!(matches!(missing, Err(ReconcileError::OrderNotFound { .. })));
    }
}
