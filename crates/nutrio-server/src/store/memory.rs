//! In-memory store with the same isolation guarantees as the PostgreSQL one.
//!
//! Orders sit behind one mutex, so insert-if-absent is atomic. Each user owns
//! a separate mutex; a ledger transaction holds it for its whole lifetime and
//! works on a staged copy that only replaces the original on commit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{InsertOutcome, LedgerStore, OrderStore, StoreError, UserLedger};
use crate::models::{
    CoinEventType, CoinLedgerEntry, LedgerState, NewCoinLedgerEntry, NewOrder, Order, OrderStatus,
    PaymentMethod, Settlement, UserSubscription,
};

#[derive(Debug, Default)]
struct OrderTable {
    rows: HashMap<Uuid, Order>,
    by_external: HashMap<(PaymentMethod, String), Uuid>,
}

#[derive(Debug, Clone, Default)]
struct UserBook {
    balance: i64,
    subscriptions: HashMap<String, UserSubscription>,
    entries: Vec<CoinLedgerEntry>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    orders: Mutex<OrderTable>,
    users: Mutex<HashMap<Uuid, Arc<Mutex<UserBook>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only ledger transactions create a book; reads never do.
    async fn book_or_create(&self, user_id: Uuid) -> Arc<Mutex<UserBook>> {
        let mut users = self.users.lock().await;
        users.entry(user_id).or_default().clone()
    }

    async fn book(&self, user_id: Uuid) -> Option<Arc<Mutex<UserBook>>> {
        self.users.lock().await.get(&user_id).cloned()
    }

    /// All ledger entries recorded for a user, oldest first.
    pub async fn ledger_entries(&self, user_id: Uuid) -> Vec<CoinLedgerEntry> {
        match self.book(user_id).await {
            Some(book) => book.lock().await.entries.clone(),
            None => Vec::new(),
        }
    }

    pub async fn order_count(&self) -> usize {
        self.orders.lock().await.rows.len()
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn find_order(
        &self,
        method: PaymentMethod,
        external_id: &str,
    ) -> Result<Option<Order>, StoreError> {
        let table = self.orders.lock().await;
        Ok(table
            .by_external
            .get(&(method, external_id.to_string()))
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.lock().await.rows.get(&id).cloned())
    }

    async fn insert_settled(
        &self,
        order: NewOrder,
        settlement: Settlement,
    ) -> Result<InsertOutcome, StoreError> {
        let mut table = self.orders.lock().await;
        let key = (order.payment_method, order.external_id.clone());

        if let Some(existing) = table.by_external.get(&key).and_then(|id| table.rows.get(id)) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }

        let status = OrderStatus::Pending
            .transition(settlement.status)
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let now = Utc::now();
        let row = Order {
            id: Uuid::new_v4(),
            external_id: order.external_id,
            user_id: order.user_id,
            product_id: order.product_id,
            payment_method: order.payment_method,
            amount: order.amount,
            currency: order.currency,
            status,
            status_information: settlement.status_information,
            ledger_state: settlement.ledger_state,
            purchased_at: order.purchased_at,
            created_at: now,
            modified_at: now,
        };

        table.by_external.insert(key, row.id);
        table.rows.insert(row.id, row.clone());
        Ok(InsertOutcome::Inserted(row))
    }

    async fn transition(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        status_information: Option<String>,
    ) -> Result<Option<Order>, StoreError> {
        let mut table = self.orders.lock().await;
        let row = table.rows.get_mut(&id).ok_or(StoreError::OrderNotFound(id))?;

        if row.status != from {
            return Ok(None);
        }
        row.status = to;
        if status_information.is_some() {
            row.status_information = status_information;
        }
        row.modified_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn set_ledger_state(
        &self,
        id: Uuid,
        from: LedgerState,
        to: LedgerState,
    ) -> Result<bool, StoreError> {
        let mut table = self.orders.lock().await;
        let row = table.rows.get_mut(&id).ok_or(StoreError::OrderNotFound(id))?;

        if row.ledger_state != from {
            return Ok(false);
        }
        row.ledger_state = to;
        row.modified_at = Utc::now();
        Ok(true)
    }

    async fn orders_awaiting_ledger(&self, limit: i64) -> Result<Vec<Order>, StoreError> {
        let table = self.orders.lock().await;
        let mut pending: Vec<Order> = table
            .rows
            .values()
            .filter(|o| o.awaits_ledger())
            .cloned()
            .collect();
        pending.sort_by_key(|o| o.created_at);
        pending.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(pending)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn lock_user(&self, user_id: Uuid) -> Result<Box<dyn UserLedger>, StoreError> {
        let guard = self.book_or_create(user_id).await.lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryUserLedger {
            user_id,
            guard: Some(guard),
            staged,
        }))
    }

    async fn subscription(
        &self,
        user_id: Uuid,
        product_id: &str,
    ) -> Result<Option<UserSubscription>, StoreError> {
        let Some(book) = self.book(user_id).await else {
            return Ok(None);
        };
        let book = book.lock().await;
        Ok(book.subscriptions.get(product_id).cloned())
    }

    async fn subscriptions(&self, user_id: Uuid) -> Result<Vec<UserSubscription>, StoreError> {
        let Some(book) = self.book(user_id).await else {
            return Ok(Vec::new());
        };
        let book = book.lock().await;
        let mut subscriptions: Vec<UserSubscription> =
            book.subscriptions.values().cloned().collect();
        subscriptions.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        Ok(subscriptions)
    }

    async fn coin_balance(&self, user_id: Uuid) -> Result<i64, StoreError> {
        let Some(book) = self.book(user_id).await else {
            return Ok(0);
        };
        let balance = book.lock().await.balance;
        Ok(balance)
    }
}

struct MemoryUserLedger {
    user_id: Uuid,
    guard: Option<OwnedMutexGuard<UserBook>>,
    staged: UserBook,
}

impl MemoryUserLedger {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.guard.is_some() {
            Ok(())
        } else {
            Err(StoreError::Finished)
        }
    }
}

#[async_trait]
impl UserLedger for MemoryUserLedger {
    fn user_id(&self) -> Uuid {
        self.user_id
    }

    async fn balance(&mut self) -> Result<i64, StoreError> {
        self.ensure_open()?;
        Ok(self.staged.balance)
    }

    async fn subscription(
        &mut self,
        product_id: &str,
    ) -> Result<Option<UserSubscription>, StoreError> {
        self.ensure_open()?;
        Ok(self.staged.subscriptions.get(product_id).cloned())
    }

    async fn has_entry(
        &mut self,
        order_id: Uuid,
        event_type: CoinEventType,
    ) -> Result<bool, StoreError> {
        self.ensure_open()?;
        Ok(self
            .staged
            .entries
            .iter()
            .any(|e| e.order_id == order_id && e.event_type == event_type))
    }

    async fn save_subscription(
        &mut self,
        subscription: &UserSubscription,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.staged
            .subscriptions
            .insert(subscription.product_id.clone(), subscription.clone());
        Ok(())
    }

    async fn append_entry(&mut self, entry: NewCoinLedgerEntry) -> Result<i64, StoreError> {
        self.ensure_open()?;
        if entry.user_id != self.user_id {
            return Err(StoreError::Internal(format!(
                "Ledger entry for {} written under lock of {}",
                entry.user_id, self.user_id
            )));
        }
        if self
            .staged
            .entries
            .iter()
            .any(|e| e.order_id == entry.order_id && e.event_type == entry.event_type)
        {
            return Err(StoreError::Internal(format!(
                "Duplicate {:?} entry for order {}",
                entry.event_type, entry.order_id
            )));
        }

        self.staged.balance += entry.balance_delta();
        self.staged.entries.push(CoinLedgerEntry {
            id: Uuid::new_v4(),
            user_id: entry.user_id,
            order_id: entry.order_id,
            event_type: entry.event_type,
            coins: entry.coins,
            metadata: entry.metadata,
            created_at: Utc::now(),
        });
        Ok(self.staged.balance)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let mut guard = self.guard.take().ok_or(StoreError::Finished)?;
        *guard = std::mem::take(&mut self.staged);
        Ok(())
    }
}
