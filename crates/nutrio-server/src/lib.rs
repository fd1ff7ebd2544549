//! Nutrio Server - payment reconciliation and entitlements
//!
//! Turns App Store receipts and card checkout webhooks into orders,
//! subscription windows and coin balances, without double-crediting under
//! redelivery or concurrent submission.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod routes;
pub mod store;
pub mod stripe;

pub use engine::{EngineSettings, Outcome, PaymentEngine};
pub use error::AppError;
pub use routes::{create_router, AppState, ServerSettings};
