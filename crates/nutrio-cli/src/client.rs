// HTTP client for a running nutrio-server

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use uuid::Uuid;

pub const DEFAULT_SERVER: &str = "http://localhost:8080";

/// A server reply. Error bodies are plain text and arrive as a JSON string.
#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub retry_after: Option<String>,
    pub body: Value,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct Client {
    base: String,
}

impl Client {
    pub fn new(server: &str) -> Self {
        Self {
            base: format!("{}/api/v1", server.trim_end_matches('/')),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn submit_receipt(&self, user_id: Uuid, receipt: Value) -> Result<Reply> {
        let body = json!({ "userId": user_id.to_string(), "receipt": receipt });
        read(ureq::post(&self.url("/payments/apple/receipt")).send_json(body))
    }

    pub fn entitlement(&self, user_id: Uuid, product_id: &str) -> Result<Reply> {
        read(
            ureq::get(&self.url(&format!(
                "/entitlements/users/{}/products/{}",
                user_id, product_id
            )))
            .call(),
        )
    }

    pub fn balance(&self, user_id: Uuid) -> Result<Reply> {
        read(ureq::get(&self.url(&format!("/entitlements/users/{}/coins", user_id))).call())
    }
}

fn read(result: Result<ureq::Response, ureq::Error>) -> Result<Reply> {
    let response = match result {
        Ok(response) => response,
        // 4xx/5xx still carry a body worth showing
        Err(ureq::Error::Status(_, response)) => response,
        Err(e) => return Err(anyhow!("Request failed: {}", e)),
    };

    let status = response.status();
    let retry_after = response.header("Retry-After").map(str::to_string);
    let text = response
        .into_string()
        .map_err(|e| anyhow!("Failed to read response: {}", e))?;
    let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

    Ok(Reply {
        status,
        retry_after,
        body,
    })
}
