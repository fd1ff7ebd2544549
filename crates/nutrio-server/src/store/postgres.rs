//! PostgreSQL store.
//!
//! Order deduplication rests on the unique index over
//! `(payment_method, external_id)`: a concurrent insert of the same id waits
//! for the first transaction to commit, then sees its row. Ledger
//! transactions take a row lock on the user's `coin_accounts` row.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{InsertOutcome, LedgerStore, OrderStore, StoreError, UserLedger};
use crate::models::{
    CoinEventType, LedgerState, NewCoinLedgerEntry, NewOrder, Order, OrderStatus, PaymentMethod,
    Settlement, UserSubscription,
};

const ORDER_COLUMNS: &str = "id, external_id, user_id, product_id, payment_method, amount, \
     currency, status, status_information, ledger_state, purchased_at, created_at, modified_at";

const SUBSCRIPTION_COLUMNS: &str =
    "id, user_id, product_id, value_coins, is_active, valid_at, valid_days, created_at, modified_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn find_order(
        &self,
        method: PaymentMethod,
        external_id: &str,
    ) -> Result<Option<Order>, StoreError> {
        let sql = format!(
            "SELECT {} FROM orders WHERE payment_method = $1 AND external_id = $2",
            ORDER_COLUMNS
        );
        let order = sqlx::query_as::<_, Order>(&sql)
            .bind(method)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(order)
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        let sql = format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS);
        let order = sqlx::query_as::<_, Order>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(order)
    }

    async fn insert_settled(
        &self,
        order: NewOrder,
        settlement: Settlement,
    ) -> Result<InsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let insert = format!(
            r#"
            INSERT INTO orders (id, external_id, user_id, product_id, payment_method, amount, currency,
                                status, ledger_state, purchased_at, created_at, modified_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW(), NOW())
            ON CONFLICT (payment_method, external_id) DO NOTHING
            RETURNING {}
            "#,
            ORDER_COLUMNS
        );
        let inserted: Option<Order> = sqlx::query_as(&insert)
            .bind(Uuid::new_v4())
            .bind(&order.external_id)
            .bind(order.user_id)
            .bind(&order.product_id)
            .bind(order.payment_method)
            .bind(&order.amount)
            .bind(&order.currency)
            .bind(OrderStatus::Pending)
            .bind(LedgerState::NotRequired)
            .bind(order.purchased_at)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(pending) = inserted else {
            // The conflicting row is committed by now; read committed sees it.
            let select = format!(
                "SELECT {} FROM orders WHERE payment_method = $1 AND external_id = $2",
                ORDER_COLUMNS
            );
            let existing: Order = sqlx::query_as(&select)
                .bind(order.payment_method)
                .bind(&order.external_id)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(InsertOutcome::Existing(existing));
        };

        let update = format!(
            r#"
            UPDATE orders
            SET status = $2, status_information = $3, ledger_state = $4, modified_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            ORDER_COLUMNS
        );
        let settled: Order = sqlx::query_as(&update)
            .bind(pending.id)
            .bind(settlement.status)
            .bind(&settlement.status_information)
            .bind(settlement.ledger_state)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(InsertOutcome::Inserted(settled))
    }

    async fn transition(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        status_information: Option<String>,
    ) -> Result<Option<Order>, StoreError> {
        let sql = format!(
            r#"
            UPDATE orders
            SET status = $3, status_information = COALESCE($4, status_information), modified_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            ORDER_COLUMNS
        );
        let updated = sqlx::query_as::<_, Order>(&sql)
            .bind(id)
            .bind(from)
            .bind(to)
            .bind(status_information)
            .fetch_optional(&self.pool)
            .await?;

        if updated.is_none() && self.get_order(id).await?.is_none() {
            return Err(StoreError::OrderNotFound(id));
        }
        Ok(updated)
    }

    async fn set_ledger_state(
        &self,
        id: Uuid,
        from: LedgerState,
        to: LedgerState,
    ) -> Result<bool, StoreError> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE orders
            SET ledger_state = $3, modified_at = NOW()
            WHERE id = $1 AND ledger_state = $2
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 && self.get_order(id).await?.is_none() {
            return Err(StoreError::OrderNotFound(id));
        }
        Ok(rows_affected > 0)
    }

    async fn orders_awaiting_ledger(&self, limit: i64) -> Result<Vec<Order>, StoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM orders
            WHERE status = 'paid' AND ledger_state = 'pending'
            ORDER BY created_at
            LIMIT $1
            "#,
            ORDER_COLUMNS
        );
        let orders = sqlx::query_as::<_, Order>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(orders)
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn lock_user(&self, user_id: Uuid) -> Result<Box<dyn UserLedger>, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO coin_accounts (user_id, balance)
            VALUES ($1, 0)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("SELECT balance FROM coin_accounts WHERE user_id = $1 FOR UPDATE")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        Ok(Box::new(PgUserLedger {
            user_id,
            tx: Some(tx),
        }))
    }

    async fn subscription(
        &self,
        user_id: Uuid,
        product_id: &str,
    ) -> Result<Option<UserSubscription>, StoreError> {
        let sql = format!(
            "SELECT {} FROM user_subscriptions WHERE user_id = $1 AND product_id = $2",
            SUBSCRIPTION_COLUMNS
        );
        let subscription = sqlx::query_as::<_, UserSubscription>(&sql)
            .bind(user_id)
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(subscription)
    }

    async fn subscriptions(&self, user_id: Uuid) -> Result<Vec<UserSubscription>, StoreError> {
        let sql = format!(
            "SELECT {} FROM user_subscriptions WHERE user_id = $1 ORDER BY product_id",
            SUBSCRIPTION_COLUMNS
        );
        let subscriptions = sqlx::query_as::<_, UserSubscription>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(subscriptions)
    }

    async fn coin_balance(&self, user_id: Uuid) -> Result<i64, StoreError> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM coin_accounts WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(balance.unwrap_or(0))
    }
}

struct PgUserLedger {
    user_id: Uuid,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgUserLedger {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::Finished)
    }
}

#[async_trait]
impl UserLedger for PgUserLedger {
    fn user_id(&self) -> Uuid {
        self.user_id
    }

    async fn balance(&mut self) -> Result<i64, StoreError> {
        let user_id = self.user_id;
        let tx = self.tx()?;
        let balance: i64 =
            sqlx::query_scalar("SELECT balance FROM coin_accounts WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&mut **tx)
                .await?;
        Ok(balance)
    }

    async fn subscription(
        &mut self,
        product_id: &str,
    ) -> Result<Option<UserSubscription>, StoreError> {
        let user_id = self.user_id;
        let tx = self.tx()?;
        let sql = format!(
            "SELECT {} FROM user_subscriptions WHERE user_id = $1 AND product_id = $2",
            SUBSCRIPTION_COLUMNS
        );
        let subscription = sqlx::query_as::<_, UserSubscription>(&sql)
            .bind(user_id)
            .bind(product_id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(subscription)
    }

    async fn has_entry(
        &mut self,
        order_id: Uuid,
        event_type: CoinEventType,
    ) -> Result<bool, StoreError> {
        let tx = self.tx()?;
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM coin_ledger WHERE order_id = $1 AND event_type = $2)",
        )
        .bind(order_id)
        .bind(event_type)
        .fetch_one(&mut **tx)
        .await?;
        Ok(exists)
    }

    async fn save_subscription(
        &mut self,
        subscription: &UserSubscription,
    ) -> Result<(), StoreError> {
        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO user_subscriptions (id, user_id, product_id, value_coins, is_active, valid_at, valid_days, created_at, modified_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (user_id, product_id)
            DO UPDATE SET value_coins = EXCLUDED.value_coins,
                          is_active = EXCLUDED.is_active,
                          valid_at = EXCLUDED.valid_at,
                          valid_days = EXCLUDED.valid_days,
                          modified_at = EXCLUDED.modified_at
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.user_id)
        .bind(&subscription.product_id)
        .bind(subscription.value_coins)
        .bind(subscription.is_active)
        .bind(subscription.valid_at)
        .bind(subscription.valid_days)
        .bind(subscription.created_at)
        .bind(subscription.modified_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn append_entry(&mut self, entry: NewCoinLedgerEntry) -> Result<i64, StoreError> {
        let user_id = self.user_id;
        if entry.user_id != user_id {
            return Err(StoreError::Internal(format!(
                "Ledger entry for {} written under lock of {}",
                entry.user_id, user_id
            )));
        }
        let delta = entry.balance_delta();
        let tx = self.tx()?;

        sqlx::query(
            r#"
            INSERT INTO coin_ledger (user_id, order_id, event_type, coins, metadata)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.user_id)
        .bind(entry.order_id)
        .bind(entry.event_type)
        .bind(entry.coins)
        .bind(&entry.metadata)
        .execute(&mut **tx)
        .await?;

        let balance: i64 = sqlx::query_scalar(
            r#"
            UPDATE coin_accounts
            SET balance = balance + $2, updated_at = NOW()
            WHERE user_id = $1
            RETURNING balance
            "#,
        )
        .bind(user_id)
        .bind(delta)
        .fetch_one(&mut **tx)
        .await?;
        Ok(balance)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::Finished)?;
        tx.commit().await?;
        Ok(())
    }
}
