//! Database models for Nutrio payments.

pub mod coin_ledger;
pub mod order;
pub mod subscription;

pub use coin_ledger::{CoinEventType, CoinLedgerEntry, NewCoinLedgerEntry};
pub use order::{
    InvalidTransition, LedgerState, NewOrder, Order, OrderStatus, PaymentMethod, Settlement,
};
pub use subscription::UserSubscription;
