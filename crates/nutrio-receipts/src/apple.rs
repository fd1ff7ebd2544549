//! App Store receipt parsing.
//!
//! Takes the JSON body returned by the App Store `verifyReceipt` endpoint and
//! turns every `in_app` line item into a [`NormalizedTransaction`]. The
//! top-level `status` is resolved once into a [`ReceiptStatus`] so callers
//! never compare raw codes themselves.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::transaction::{NormalizedTransaction, Provider};

/// Receipt date layout once the trailing zone name (`Etc/GMT`) is removed.
const RECEIPT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The receipt server could not be reached. Retry later.
const STATUS_SERVICE_UNAVAILABLE: i64 = 21005;

/// Internal data access error on the provider side. Retry later.
const STATUS_INTERNAL_DATA_ACCESS: i64 = 21009;

/// Range Apple reserves for retryable internal errors.
const STATUS_INTERNAL_RANGE: std::ops::RangeInclusive<i64> = 21100..=21199;

/// Errors produced while reading a receipt payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReceiptError {
    /// The payload is structurally invalid or the provider rejected it for good.
    #[error("Malformed receipt: {reason}")]
    Malformed {
        reason: String,
        /// Provider status code, when the provider returned a terminal one.
        status: Option<i64>,
    },

    /// The provider had a temporary problem. The purchase itself is not in question.
    #[error("Provider temporarily unavailable (status {status})")]
    ProviderTransient { status: i64 },
}

impl ReceiptError {
    fn malformed(reason: impl Into<String>) -> Self {
        ReceiptError::Malformed {
            reason: reason.into(),
            status: None,
        }
    }

    /// Returns true if the caller should retry the same payload later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReceiptError::ProviderTransient { .. })
    }

    /// Provider status code attached to the error, if any.
    pub fn status(&self) -> Option<i64> {
        match self {
            ReceiptError::Malformed { status, .. } => *status,
            ReceiptError::ProviderTransient { status } => Some(*status),
        }
    }
}

/// The receipt-level status code, resolved into a closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    /// Status `0`: the receipt is valid.
    Valid,
    /// The provider asks us to try again.
    Transient(i64),
    /// Any other code. The receipt will not become valid by retrying.
    Rejected(i64),
}

impl ReceiptStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => ReceiptStatus::Valid,
            STATUS_SERVICE_UNAVAILABLE | STATUS_INTERNAL_DATA_ACCESS => {
                ReceiptStatus::Transient(code)
            }
            c if STATUS_INTERNAL_RANGE.contains(&c) => ReceiptStatus::Transient(code),
            _ => ReceiptStatus::Rejected(code),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            ReceiptStatus::Valid => 0,
            ReceiptStatus::Transient(c) | ReceiptStatus::Rejected(c) => *c,
        }
    }

    /// Human readable explanation of the code for diagnostics.
    pub fn describe(&self) -> &'static str {
        match self.code() {
            0 => "valid",
            21000 => "request to the App Store was not made using HTTP POST",
            21002 => "receipt data was malformed or the service experienced a temporary issue",
            21003 => "receipt could not be authenticated",
            21004 => "shared secret does not match the account's shared secret",
            21005 => "receipt server was temporarily unable to provide the receipt",
            21006 => "receipt is valid but the subscription has expired",
            21007 => "sandbox receipt sent to the production environment",
            21008 => "production receipt sent to the sandbox environment",
            21009 => "internal data access error",
            21010 => "user account cannot be found or has been deleted",
            c if STATUS_INTERNAL_RANGE.contains(&c) => "internal data access error",
            _ => "unknown status",
        }
    }
}

/// The outcome of parsing a valid receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReceipt {
    pub bundle_id: Option<String>,
    /// One entry per `in_app` line item, in receipt order.
    pub transactions: Vec<NormalizedTransaction>,
}

#[derive(Debug, Deserialize)]
struct ReceiptBody {
    #[serde(default)]
    bundle_id: Option<String>,
    #[serde(default)]
    in_app: Option<Vec<InAppItem>>,
}

#[derive(Debug, Deserialize)]
struct InAppItem {
    #[serde(default)]
    original_transaction_id: Option<Value>,
    #[serde(default)]
    transaction_id: Option<Value>,
    #[serde(default)]
    product_id: Option<Value>,
    #[serde(default)]
    quantity: Option<Value>,
    #[serde(default)]
    purchase_date: Option<String>,
    #[serde(default)]
    original_purchase_date: Option<String>,
}

/// Parses a `verifyReceipt` response body.
///
/// A receipt can bundle several purchases; every line item becomes one
/// transaction sharing the receipt's bundle id. An unreadable date leaves
/// that date unset instead of failing the receipt.
pub fn parse_receipt(raw: &str) -> Result<ParsedReceipt, ReceiptError> {
    let payload: Value = serde_json::from_str(raw)
        .map_err(|e| ReceiptError::malformed(format!("Invalid JSON: {}", e)))?;

    let code = payload
        .get("status")
        .and_then(numeric)
        .ok_or_else(|| ReceiptError::malformed("Missing or non-numeric status"))?;

    let status = ReceiptStatus::from_code(code);
    match status {
        ReceiptStatus::Valid => {}
        ReceiptStatus::Transient(status) => {
            return Err(ReceiptError::ProviderTransient { status });
        }
        ReceiptStatus::Rejected(code) => {
            return Err(ReceiptError::Malformed {
                reason: format!("Provider rejected receipt: {}", status.describe()),
                status: Some(code),
            });
        }
    }

    let receipt = payload
        .get("receipt")
        .cloned()
        .ok_or_else(|| ReceiptError::malformed("Missing receipt object"))?;
    let body: ReceiptBody = serde_json::from_value(receipt)
        .map_err(|e| ReceiptError::malformed(format!("Invalid receipt object: {}", e)))?;
    let items = body
        .in_app
        .ok_or_else(|| ReceiptError::malformed("Receipt has no in_app purchase list"))?;

    let transactions = items
        .iter()
        .enumerate()
        .map(|(index, item)| line_item(index, item, code, body.bundle_id.as_deref()))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ParsedReceipt {
        bundle_id: body.bundle_id,
        transactions,
    })
}

fn line_item(
    index: usize,
    item: &InAppItem,
    status: i64,
    bundle_id: Option<&str>,
) -> Result<NormalizedTransaction, ReceiptError> {
    let transaction_id = item.transaction_id.as_ref().and_then(text).ok_or_else(|| {
        ReceiptError::malformed(format!("Line item {} is missing transaction_id", index))
    })?;
    let product_id = item.product_id.as_ref().and_then(text).ok_or_else(|| {
        ReceiptError::malformed(format!("Line item {} is missing product_id", index))
    })?;
    // A first purchase is its own original transaction.
    let original_transaction_id = item
        .original_transaction_id
        .as_ref()
        .and_then(text)
        .unwrap_or_else(|| transaction_id.clone());

    Ok(NormalizedTransaction {
        provider: Provider::Apple,
        provider_transaction_id: transaction_id,
        original_transaction_id,
        product_id,
        purchased_at: item.purchase_date.as_deref().and_then(parse_receipt_date),
        original_purchased_at: item
            .original_purchase_date
            .as_deref()
            .and_then(parse_receipt_date),
        quantity: item.quantity.as_ref().and_then(quantity).unwrap_or(1),
        raw_status: Some(status),
        amount: None,
        currency: None,
        bundle_id: bundle_id.map(str::to_string),
    })
}

/// Parses `"2024-03-01 08:15:00 Etc/GMT"` as a UTC instant.
pub fn parse_receipt_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let stamp = match value.rsplit_once(' ') {
        Some((head, zone)) if zone.chars().any(|c| c.is_ascii_alphabetic()) => head,
        _ => value,
    };
    NaiveDateTime::parse_from_str(stamp.trim(), RECEIPT_DATE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn numeric(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn quantity(value: &Value) -> Option<u32> {
    let parsed = match value {
        Value::Number(n) => n.as_u64().and_then(|q| u32::try_from(q).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    };
    parsed.filter(|q| *q > 0)
}
