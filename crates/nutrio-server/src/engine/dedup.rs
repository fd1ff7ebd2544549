//! Idempotency gate keyed on the provider transaction id.

use std::sync::Arc;

use nutrio_receipts::Provider;

use crate::models::{Order, PaymentMethod};
use crate::store::{PaymentStore, StoreError};

/// Looks up earlier deliveries of a transaction.
///
/// This is the cheap early exit. The authoritative check is the
/// insert-if-absent in [`OrderStore::insert_settled`], which runs in the same
/// atomic unit as the order write and catches deliveries racing past here.
///
/// [`OrderStore::insert_settled`]: crate::store::OrderStore::insert_settled
pub struct TransactionDeduplicator {
    store: Arc<dyn PaymentStore>,
}

impl TransactionDeduplicator {
    pub fn new(store: Arc<dyn PaymentStore>) -> Self {
        Self { store }
    }

    /// The order an earlier delivery of this transaction produced, if any.
    pub async fn prior(
        &self,
        provider: Provider,
        provider_transaction_id: &str,
    ) -> Result<Option<Order>, StoreError> {
        self.store
            .find_order(PaymentMethod::from(provider), provider_transaction_id)
            .await
    }

    pub async fn is_duplicate(
        &self,
        provider: Provider,
        provider_transaction_id: &str,
    ) -> Result<bool, StoreError> {
        Ok(self.prior(provider, provider_transaction_id).await?.is_some())
    }
}
