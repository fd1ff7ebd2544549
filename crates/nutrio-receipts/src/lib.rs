//! Nutrio Receipts - provider payment payloads in a provider-agnostic shape.
//!
//! Everything in this crate is pure: raw App Store receipts and card gateway
//! checkout completions go in, [`NormalizedTransaction`] records come out.
//! Persistence and side effects live in `nutrio-server`.

pub mod apple;
pub mod catalog;
pub mod checkout;
pub mod transaction;

pub use apple::{parse_receipt, ParsedReceipt, ReceiptError, ReceiptStatus};
pub use catalog::{CatalogError, Product, ProductCatalog, ProductKind, Term, UnknownProduct};
pub use checkout::{normalize_checkout, CheckoutCompletion};
pub use transaction::{NormalizedTransaction, Provider};
