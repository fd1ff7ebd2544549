//! Card gateway checkout sessions.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{ProductCatalog, UnknownProduct};
use crate::transaction::{NormalizedTransaction, Provider};

/// Currencies the gateway reports without minor units.
const ZERO_DECIMAL_CURRENCIES: &[&str] = &["bif", "clp", "jpy", "krw", "pyg", "vnd", "xaf", "xof"];

/// The fields of a completed checkout session the engine needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutCompletion {
    pub session_id: String,
    pub price_id: String,
    /// Amount captured, in the currency's minor units (cents).
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
}

/// Converts a completed checkout session into a [`NormalizedTransaction`].
///
/// Card payments have no renewal grouping, so the session id doubles as the
/// original transaction id.
pub fn normalize_checkout(
    completion: &CheckoutCompletion,
    catalog: &ProductCatalog,
    now: DateTime<Utc>,
) -> Result<NormalizedTransaction, UnknownProduct> {
    let product = catalog
        .by_price_id(&completion.price_id)
        .ok_or_else(|| UnknownProduct(completion.price_id.clone()))?;

    let currency = completion.currency.as_deref().map(str::to_ascii_lowercase);
    let amount = completion
        .amount_total
        .map(|minor| to_major_units(minor, currency.as_deref()));

    Ok(NormalizedTransaction {
        provider: Provider::CardGateway,
        provider_transaction_id: completion.session_id.clone(),
        original_transaction_id: completion.session_id.clone(),
        product_id: product.id.clone(),
        purchased_at: Some(now),
        original_purchased_at: Some(now),
        quantity: 1,
        raw_status: None,
        amount,
        currency,
        bundle_id: None,
    })
}

fn to_major_units(minor: i64, currency: Option<&str>) -> BigDecimal {
    let scale = match currency {
        Some(c) if ZERO_DECIMAL_CURRENCIES.contains(&c) => 0,
        _ => 2,
    };
    BigDecimal::new(minor.into(), scale)
}
