// Offline receipt inspection

use std::path::Path;

use anyhow::{anyhow, Result};
use nutrio_receipts::{parse_receipt, NormalizedTransaction, ReceiptError, ReceiptStatus};

/// Reads a receipt file and checks that it is JSON.
pub fn load_receipt(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("Failed to read '{}': {}", path.display(), e))?;
    serde_json::from_str::<serde_json::Value>(&raw)
        .map_err(|e| anyhow!("'{}' is not JSON: {}", path.display(), e))?;
    Ok(raw)
}

/// What a receipt amounts to, without talking to any server.
#[derive(Debug, PartialEq)]
pub enum Inspection {
    Valid {
        bundle_id: Option<String>,
        lines: Vec<String>,
    },
    Retry { status: i64, description: String },
    Rejected { reason: String },
}

fn describe_transaction(tx: &NormalizedTransaction) -> String {
    let date = tx
        .purchased_at
        .map(|d| d.to_rfc3339())
        .unwrap_or_else(|| "unknown date".to_string());
    let renewal = if tx.is_renewal() {
        format!(" renewal of {}", tx.original_transaction_id)
    } else {
        String::new()
    };
    format!(
        "{} x{} {} purchased {}{}",
        tx.product_id, tx.quantity, tx.provider_transaction_id, date, renewal
    )
}

pub fn inspect(raw: &str) -> Inspection {
    match parse_receipt(raw) {
        Ok(parsed) => Inspection::Valid {
            bundle_id: parsed.bundle_id,
            lines: parsed.transactions.iter().map(describe_transaction).collect(),
        },
        Err(ReceiptError::ProviderTransient { status }) => Inspection::Retry {
            status,
            description: ReceiptStatus::from_code(status).describe().to_string(),
        },
        Err(e) => Inspection::Rejected {
            reason: e.to_string(),
        },
    }
}
