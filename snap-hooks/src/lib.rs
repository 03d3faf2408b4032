pub mod cleanup;
pub mod client;
pub mod configs;
pub mod engine;
pub mod store;
pub mod types;

pub use cleanup::DeliveryCleaner;
pub use client::{HttpClient, HttpResponseSummary, ReqwestClient, TransportError};
pub use configs::{create_config, rotate_secret, ConfigError, MAX_CONFIGS_PER_USER};
pub use engine::{DeliveryPolicy, WebhookEngine};
pub use store::{MemoryWebhookStore, PgWebhookStore, WebhookStore};
pub use types::{DeliveryStatus, WebhookConfig, WebhookDelivery, WebhookPayload};
