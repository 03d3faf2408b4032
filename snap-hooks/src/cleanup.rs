use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use snap_core::{Clock, StoreError};

use crate::store::WebhookStore;

/// Batched retention cleanup for delivery rows. Failed batches are kept for
/// less time than successful ones; both windows are configurable.
pub struct DeliveryCleaner {
    store: Arc<dyn WebhookStore>,
    clock: Arc<dyn Clock>,
    delivered_retention: Duration,
    failed_retention: Duration,
    batch_size: u32,
}

impl DeliveryCleaner {
    pub fn new(
        store: Arc<dyn WebhookStore>,
        clock: Arc<dyn Clock>,
        delivered_retention: Duration,
        failed_retention: Duration,
        batch_size: u32,
    ) -> Self {
        Self {
            store,
            clock,
            delivered_retention,
            failed_retention,
            batch_size,
        }
    }

    /// One cleanup pass: delete expired rows batch by batch until a batch
    /// comes back short.
    pub async fn cleanup_once(&self) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let delivered_before = now
            - chrono::Duration::from_std(self.delivered_retention)
                .unwrap_or(chrono::Duration::MAX);
        let failed_before =
            now - chrono::Duration::from_std(self.failed_retention).unwrap_or(chrono::Duration::MAX);

        let mut total = 0;
        loop {
            let deleted = self
                .store
                .delete_deliveries_older_than(delivered_before, failed_before, self.batch_size)
                .await?;
            total += deleted;
            if deleted < u64::from(self.batch_size) {
                break;
            }
        }
        if total > 0 {
            info!(total, "cleaned up webhook deliveries");
            metrics::counter!("webhook_deliveries_cleaned_total").increment(total);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use snap_core::{delivery_id, JobEvent, TestClock};

    use crate::store::MemoryWebhookStore;
    use crate::types::{DeliveryStatus, WebhookDelivery};

    fn delivery(status: DeliveryStatus, clock: &TestClock) -> WebhookDelivery {
        let now = clock.now();
        WebhookDelivery {
            id: delivery_id(now),
            webhook_config_id: None,
            user_id: "u1".to_string(),
            event: JobEvent::ScreenshotCompleted,
            payload: "{}".to_string(),
            signature: "00".to_string(),
            status,
            url: "https://hooks.example.com".to_string(),
            attempts: 1,
            max_attempts: 3,
            last_attempt_at: Some(now),
            next_retry_at: None,
            response_code: None,
            response_body: None,
            response_time_ms: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn failed_rows_expire_before_delivered_ones() {
        let clock = Arc::new(TestClock::new(Utc::now()));
        let store = Arc::new(MemoryWebhookStore::new(clock.clone()));

        store
            .insert_delivery(&delivery(DeliveryStatus::Delivered, &clock))
            .await
            .unwrap();
        store
            .insert_delivery(&delivery(DeliveryStatus::Failed, &clock))
            .await
            .unwrap();
        store
            .insert_delivery(&delivery(DeliveryStatus::Retrying, &clock))
            .await
            .unwrap();

        let cleaner = DeliveryCleaner::new(
            store.clone(),
            clock.clone(),
            Duration::from_secs(30 * 24 * 3600),
            Duration::from_secs(7 * 24 * 3600),
            100,
        );

        // Eight days on: only the failed row has aged out; in-flight rows are
        // never touched.
        clock.advance(Duration::from_secs(8 * 24 * 3600));
        assert_eq!(cleaner.cleanup_once().await.unwrap(), 1);
        assert_eq!(store.delivery_count(), 2);

        clock.advance(Duration::from_secs(30 * 24 * 3600));
        assert_eq!(cleaner.cleanup_once().await.unwrap(), 1);
        assert_eq!(store.delivery_count(), 1);
    }

    #[tokio::test]
    async fn cleanup_drains_in_batches() {
        let clock = Arc::new(TestClock::new(Utc::now()));
        let store = Arc::new(MemoryWebhookStore::new(clock.clone()));
        for _ in 0..7 {
            store
                .insert_delivery(&delivery(DeliveryStatus::Delivered, &clock))
                .await
                .unwrap();
        }

        let cleaner = DeliveryCleaner::new(
            store.clone(),
            clock.clone(),
            Duration::from_secs(1),
            Duration::from_secs(1),
            3,
        );
        clock.advance(Duration::from_secs(2));
        assert_eq!(cleaner.cleanup_once().await.unwrap(), 7);
        assert_eq!(store.delivery_count(), 0);
    }
}
