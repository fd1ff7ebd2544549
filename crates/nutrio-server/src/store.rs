//! Persistence boundary for orders and the per-user ledger.
//!
//! Two implementations share these semantics: [`PgStore`] for production and
//! [`MemoryStore`] for tests and local runs.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    CoinEventType, LedgerState, NewCoinLedgerEntry, NewOrder, Order, OrderStatus, PaymentMethod,
    Settlement, UserSubscription,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Order not found: {0}")]
    OrderNotFound(Uuid),

    #[error("Ledger transaction already finished")]
    Finished,

    #[error("Storage error: {0}")]
    Internal(String),
}

/// Result of an insert-if-absent on (payment method, external id).
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// This call created the order and applied the settlement.
    Inserted(Order),
    /// Another delivery got there first. Carries that delivery's committed row.
    Existing(Order),
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_order(
        &self,
        method: PaymentMethod,
        external_id: &str,
    ) -> Result<Option<Order>, StoreError>;

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError>;

    /// Creates the order as pending and applies `settlement` in one atomic
    /// unit. If an order with the same (method, external id) exists, nothing is
    /// written and the existing row is returned.
    async fn insert_settled(
        &self,
        order: NewOrder,
        settlement: Settlement,
    ) -> Result<InsertOutcome, StoreError>;

    /// Compare-and-set on status. Returns `None` if the order was not in `from`.
    async fn transition(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        status_information: Option<String>,
    ) -> Result<Option<Order>, StoreError>;

    /// Compare-and-set on ledger state. Returns `false` if the order was not
    /// in `from`.
    async fn set_ledger_state(
        &self,
        id: Uuid,
        from: LedgerState,
        to: LedgerState,
    ) -> Result<bool, StoreError>;

    /// Paid orders whose grant has not been recorded, oldest first.
    async fn orders_awaiting_ledger(&self, limit: i64) -> Result<Vec<Order>, StoreError>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Opens a ledger transaction holding the user's exclusive lock until it
    /// is committed or dropped. Dropping without commit discards all writes.
    async fn lock_user(&self, user_id: Uuid) -> Result<Box<dyn UserLedger>, StoreError>;

    async fn subscription(
        &self,
        user_id: Uuid,
        product_id: &str,
    ) -> Result<Option<UserSubscription>, StoreError>;

    async fn subscriptions(&self, user_id: Uuid) -> Result<Vec<UserSubscription>, StoreError>;

    async fn coin_balance(&self, user_id: Uuid) -> Result<i64, StoreError>;
}

/// A serialized view of one user's ledger.
#[async_trait]
pub trait UserLedger: Send {
    fn user_id(&self) -> Uuid;

    async fn balance(&mut self) -> Result<i64, StoreError>;

    async fn subscription(
        &mut self,
        product_id: &str,
    ) -> Result<Option<UserSubscription>, StoreError>;

    async fn has_entry(
        &mut self,
        order_id: Uuid,
        event_type: CoinEventType,
    ) -> Result<bool, StoreError>;

    /// Inserts or replaces the row for (user, product).
    async fn save_subscription(&mut self, subscription: &UserSubscription)
        -> Result<(), StoreError>;

    /// Records the entry and moves the balance. Returns the new balance.
    async fn append_entry(&mut self, entry: NewCoinLedgerEntry) -> Result<i64, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;
}

/// Everything the engine needs from persistence.
pub trait PaymentStore: OrderStore + LedgerStore {}

impl<T: OrderStore + LedgerStore> PaymentStore for T {}
