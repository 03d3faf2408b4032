use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use thiserror::Error;

use snap_core::{validate_webhook_url, JobEvent, StoreError, WebhookUrlError};

use crate::store::WebhookStore;
use crate::types::{config_id, WebhookConfig};

pub const MAX_CONFIGS_PER_USER: u64 = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("destination rejected: {0}")]
    InvalidUrl(#[from] WebhookUrlError),
    #[error("at most {0} webhook configs per user")]
    TooManyConfigs(u64),
    #[error("webhook config not found")]
    NotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 256 bits of randomness, base64url. Only ever generated server-side.
fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Register a destination for a user. The caller never supplies the secret;
/// it comes back on the created config and is shown once by the API layer.
pub async fn create_config(
    store: &dyn WebhookStore,
    user_id: &str,
    url: &str,
    events: Vec<JobEvent>,
    description: Option<String>,
    now: DateTime<Utc>,
) -> Result<WebhookConfig, ConfigError> {
    validate_webhook_url(url)?;
    if store.count_configs(user_id).await? >= MAX_CONFIGS_PER_USER {
        return Err(ConfigError::TooManyConfigs(MAX_CONFIGS_PER_USER));
    }

    let config = WebhookConfig {
        id: config_id(),
        user_id: user_id.to_string(),
        url: url.to_string(),
        secret: generate_secret(),
        events,
        is_active: true,
        description,
        created_at: now,
        updated_at: now,
    };
    store.insert_config(&config).await?;
    Ok(config)
}

/// Replace the config's secret. Deliveries created from this point on sign
/// with the new secret; batches already in flight keep the signature they
/// were created with.
pub async fn rotate_secret(
    store: &dyn WebhookStore,
    config_id: &str,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<WebhookConfig, ConfigError> {
    let Some(mut config) = store.config_by_id(config_id, user_id).await? else {
        return Err(ConfigError::NotFound);
    };
    config.secret = generate_secret();
    config.updated_at = now;
    store.update_config(&config).await?;
    Ok(config)
}
