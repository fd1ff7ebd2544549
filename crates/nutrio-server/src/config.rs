//! Server configuration from environment variables.

use std::{env, fmt::Display, path::PathBuf, str::FromStr};

use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("Invalid {key} value: {message}")]
    Invalid { key: &'static str, message: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub catalog_path: PathBuf,
    /// Endpoint secret for `Stripe-Signature`. Unset disables verification.
    pub stripe_webhook_secret: Option<String>,
    pub apple_bundle_id: Option<String>,
    /// Seconds sent in `Retry-After` when a provider asks us to retry.
    pub retry_after_secs: u64,
    /// Hosted checkout page the session id is appended to. Unset omits `url`.
    pub checkout_base_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = var("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let stripe_webhook_secret = var("STRIPE_WEBHOOK_SECRET");
        if stripe_webhook_secret.is_none() {
            warn!("STRIPE_WEBHOOK_SECRET not set, webhook signatures will not be verified");
        }

        Ok(Self {
            database_url,
            port: try_load("PORT", "8080")?,
            catalog_path: try_load("CATALOG_PATH", "catalog.json")?,
            stripe_webhook_secret,
            apple_bundle_id: var("APPLE_BUNDLE_ID"),
            retry_after_secs: try_load("RETRY_AFTER_SECS", "30")?,
            checkout_base_url: var("CHECKOUT_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
        })
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn try_load<T: FromStr>(key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: e.to_string(),
        })
}
