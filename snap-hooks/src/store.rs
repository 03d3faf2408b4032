use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;

use snap_core::{Clock, JobEvent, StoreError};

use crate::types::{DeliveryStatus, WebhookConfig, WebhookDelivery};

/// Persistence port for webhook configs and delivery batches.
#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn insert_config(&self, config: &WebhookConfig) -> Result<(), StoreError>;
    async fn update_config(&self, config: &WebhookConfig) -> Result<(), StoreError>;
    async fn config_by_id(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<Option<WebhookConfig>, StoreError>;
    async fn configs_for_user(&self, user_id: &str) -> Result<Vec<WebhookConfig>, StoreError>;
    async fn count_configs(&self, user_id: &str) -> Result<u64, StoreError>;

    /// Active configs of the user that subscribe to `event`: the fan-out set.
    async fn active_configs_for(
        &self,
        user_id: &str,
        event: JobEvent,
    ) -> Result<Vec<WebhookConfig>, StoreError>;

    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError>;
    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError>;
    async fn delivery_by_id(&self, id: &str) -> Result<Option<WebhookDelivery>, StoreError>;

    /// Non-terminal deliveries whose retry (or first attempt, after a crash)
    /// is due, oldest first.
    async fn deliveries_due(&self, limit: u32) -> Result<Vec<WebhookDelivery>, StoreError>;

    /// Batched retention cleanup. Delivered rows older than
    /// `delivered_before` and failed rows older than `failed_before` are
    /// removed, at most `batch` in one call; returns how many went.
    async fn delete_deliveries_older_than(
        &self,
        delivered_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
        batch: u32,
    ) -> Result<u64, StoreError>;
}

#[derive(Default)]
struct MemoryWebhookInner {
    configs: HashMap<String, WebhookConfig>,
    deliveries: HashMap<String, WebhookDelivery>,
}

/// In-memory backend for tests and single-node use.
pub struct MemoryWebhookStore {
    inner: Mutex<MemoryWebhookInner>,
    clock: Arc<dyn Clock>,
}

impl MemoryWebhookStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(MemoryWebhookInner::default()),
            clock,
        }
    }

    pub fn delivery_count(&self) -> usize {
        self.inner.lock().unwrap().deliveries.len()
    }
}

#[async_trait]
impl WebhookStore for MemoryWebhookStore {
    async fn insert_config(&self, config: &WebhookConfig) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .configs
            .insert(config.id.clone(), config.clone());
        Ok(())
    }

    async fn update_config(&self, config: &WebhookConfig) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.configs.contains_key(&config.id) {
            return Err(StoreError::RowVanished(config.id.clone()));
        }
        inner.configs.insert(config.id.clone(), config.clone());
        Ok(())
    }

    async fn config_by_id(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<Option<WebhookConfig>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .configs
            .get(id)
            .filter(|config| config.user_id == user_id)
            .cloned())
    }

    async fn configs_for_user(&self, user_id: &str) -> Result<Vec<WebhookConfig>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut configs: Vec<WebhookConfig> = inner
            .configs
            .values()
            .filter(|config| config.user_id == user_id)
            .cloned()
            .collect();
        configs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(configs)
    }

    async fn count_configs(&self, user_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .configs
            .values()
            .filter(|config| config.user_id == user_id)
            .count() as u64)
    }

    async fn active_configs_for(
        &self,
        user_id: &str,
        event: JobEvent,
    ) -> Result<Vec<WebhookConfig>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut configs: Vec<WebhookConfig> = inner
            .configs
            .values()
            .filter(|config| config.user_id == user_id && config.subscribes_to(event))
            .cloned()
            .collect();
        configs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(configs)
    }

    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .deliveries
            .insert(delivery.id.clone(), delivery.clone());
        Ok(())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.deliveries.contains_key(&delivery.id) {
            return Err(StoreError::RowVanished(delivery.id.clone()));
        }
        let mut updated = delivery.clone();
        updated.updated_at = self.clock.now();
        inner.deliveries.insert(delivery.id.clone(), updated);
        Ok(())
    }

    async fn delivery_by_id(&self, id: &str) -> Result<Option<WebhookDelivery>, StoreError> {
        Ok(self.inner.lock().unwrap().deliveries.get(id).cloned())
    }

    async fn deliveries_due(&self, limit: u32) -> Result<Vec<WebhookDelivery>, StoreError> {
        let now = self.clock.now();
        let inner = self.inner.lock().unwrap();
        let mut due: Vec<WebhookDelivery> = inner
            .deliveries
            .values()
            .filter(|delivery| {
                matches!(
                    delivery.status,
                    DeliveryStatus::Pending | DeliveryStatus::Retrying
                ) && delivery.next_retry_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|delivery| delivery.next_retry_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn delete_deliveries_older_than(
        &self,
        delivered_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
        batch: u32,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<String> = inner
            .deliveries
            .values()
            .filter(|delivery| match delivery.status {
                DeliveryStatus::Delivered => delivery.updated_at < delivered_before,
                DeliveryStatus::Failed => delivery.updated_at < failed_before,
                _ => false,
            })
            .take(batch as usize)
            .map(|delivery| delivery.id.clone())
            .collect();
        for id in &doomed {
            inner.deliveries.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

/// Postgres backend over `snap_webhook_configs` / `snap_webhook_deliveries`.
pub struct PgWebhookStore {
    pool: PgPool,
}

impl PgWebhookStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn query_error(command: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
        move |error| StoreError::Query {
            command: command.to_owned(),
            error,
        }
    }
}

const CONFIG_COLUMNS: &str =
    "id, user_id, url, secret, events, is_active, description, created_at, updated_at";

const DELIVERY_COLUMNS: &str = r#"
id, webhook_config_id, user_id, event, payload, signature, status, url,
attempts, max_attempts, last_attempt_at, next_retry_at,
response_code, response_body, response_time_ms, error,
created_at, updated_at
"#;

#[async_trait]
impl WebhookStore for PgWebhookStore {
    async fn insert_config(&self, config: &WebhookConfig) -> Result<(), StoreError> {
        let query = format!(
            r#"
INSERT INTO snap_webhook_configs ({CONFIG_COLUMNS})
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            "#
        );
        sqlx::query(&query)
            .bind(&config.id)
            .bind(&config.user_id)
            .bind(&config.url)
            .bind(&config.secret)
            .bind(&config.events)
            .bind(config.is_active)
            .bind(&config.description)
            .bind(config.created_at)
            .execute(&self.pool)
            .await
            .map_err(Self::query_error("INSERT"))?;
        Ok(())
    }

    async fn update_config(&self, config: &WebhookConfig) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
UPDATE snap_webhook_configs
SET url = $2, secret = $3, events = $4, is_active = $5, description = $6, updated_at = NOW()
WHERE id = $1
            "#,
        )
        .bind(&config.id)
        .bind(&config.url)
        .bind(&config.secret)
        .bind(&config.events)
        .bind(config.is_active)
        .bind(&config.description)
        .execute(&self.pool)
        .await
        .map_err(Self::query_error("UPDATE"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RowVanished(config.id.clone()));
        }
        Ok(())
    }

    async fn config_by_id(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<Option<WebhookConfig>, StoreError> {
        let query = format!(
            "SELECT {CONFIG_COLUMNS} FROM snap_webhook_configs WHERE id = $1 AND user_id = $2"
        );
        sqlx::query_as(&query)
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::query_error("SELECT"))
    }

    async fn configs_for_user(&self, user_id: &str) -> Result<Vec<WebhookConfig>, StoreError> {
        let query = format!(
            "SELECT {CONFIG_COLUMNS} FROM snap_webhook_configs WHERE user_id = $1 ORDER BY created_at"
        );
        sqlx::query_as(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Self::query_error("SELECT"))
    }

    async fn count_configs(&self, user_id: &str) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM snap_webhook_configs WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await
                .map_err(Self::query_error("SELECT"))?;
        Ok(count as u64)
    }

    async fn active_configs_for(
        &self,
        user_id: &str,
        event: JobEvent,
    ) -> Result<Vec<WebhookConfig>, StoreError> {
        let query = format!(
            r#"
SELECT {CONFIG_COLUMNS} FROM snap_webhook_configs
WHERE user_id = $1 AND is_active AND $2 = ANY(events)
ORDER BY created_at
            "#
        );
        sqlx::query_as(&query)
            .bind(user_id)
            .bind(event)
            .fetch_all(&self.pool)
            .await
            .map_err(Self::query_error("SELECT"))
    }

    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        let query = format!(
            r#"
INSERT INTO snap_webhook_deliveries ({DELIVERY_COLUMNS})
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8,
     $9, $10, $11, $12,
     $13, $14, $15, $16,
     $17, NOW())
            "#
        );
        sqlx::query(&query)
            .bind(&delivery.id)
            .bind(&delivery.webhook_config_id)
            .bind(&delivery.user_id)
            .bind(delivery.event)
            .bind(&delivery.payload)
            .bind(&delivery.signature)
            .bind(delivery.status)
            .bind(&delivery.url)
            .bind(delivery.attempts)
            .bind(delivery.max_attempts)
            .bind(delivery.last_attempt_at)
            .bind(delivery.next_retry_at)
            .bind(delivery.response_code)
            .bind(&delivery.response_body)
            .bind(delivery.response_time_ms)
            .bind(&delivery.error)
            .bind(delivery.created_at)
            .execute(&self.pool)
            .await
            .map_err(Self::query_error("INSERT"))?;
        Ok(())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
UPDATE snap_webhook_deliveries
SET
    status = $2,
    attempts = $3,
    last_attempt_at = $4,
    next_retry_at = $5,
    response_code = $6,
    response_body = $7,
    response_time_ms = $8,
    error = $9,
    updated_at = NOW()
WHERE id = $1
            "#,
        )
        .bind(&delivery.id)
        .bind(delivery.status)
        .bind(delivery.attempts)
        .bind(delivery.last_attempt_at)
        .bind(delivery.next_retry_at)
        .bind(delivery.response_code)
        .bind(&delivery.response_body)
        .bind(delivery.response_time_ms)
        .bind(&delivery.error)
        .execute(&self.pool)
        .await
        .map_err(Self::query_error("UPDATE"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RowVanished(delivery.id.clone()));
        }
        Ok(())
    }

    async fn delivery_by_id(&self, id: &str) -> Result<Option<WebhookDelivery>, StoreError> {
        let query = format!("SELECT {DELIVERY_COLUMNS} FROM snap_webhook_deliveries WHERE id = $1");
        sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::query_error("SELECT"))
    }

    async fn deliveries_due(&self, limit: u32) -> Result<Vec<WebhookDelivery>, StoreError> {
        let query = format!(
            r#"
SELECT {DELIVERY_COLUMNS} FROM snap_webhook_deliveries
WHERE
    status IN ('pending'::snap_delivery_status, 'retrying'::snap_delivery_status)
    AND next_retry_at IS NOT NULL
    AND next_retry_at <= NOW()
ORDER BY next_retry_at ASC
LIMIT $1
            "#
        );
        sqlx::query_as(&query)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(Self::query_error("SELECT"))
    }

    async fn delete_deliveries_older_than(
        &self,
        delivered_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
        batch: u32,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
DELETE FROM snap_webhook_deliveries
WHERE id IN (
    SELECT id FROM snap_webhook_deliveries
    WHERE
        (status = 'delivered'::snap_delivery_status AND updated_at < $1)
        OR (status = 'failed'::snap_delivery_status AND updated_at < $2)
    ORDER BY updated_at ASC
    LIMIT $3
)
            "#,
        )
        .bind(delivered_before)
        .bind(failed_before)
        .bind(i64::from(batch))
        .execute(&self.pool)
        .await
        .map_err(Self::query_error("DELETE"))?;
        Ok(result.rows_affected())
    }
}
