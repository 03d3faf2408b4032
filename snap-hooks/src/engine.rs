use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error};

use snap_core::{delivery_id, sign_payload, Clock, EventData, EventSink, JobEvent, StoreError};

use crate::client::HttpClient;
use crate::store::WebhookStore;
use crate::types::{
    truncate_response_body, DeliveryStatus, WebhookConfig, WebhookDelivery, WebhookPayload,
    DELIVERY_HEADER, EVENT_HEADER, RESPONSE_BODY_LIMIT, SIGNATURE_HEADER,
};

/// Attempt budget and retry spacing for one class of deliveries. Production
/// events back off over an hour; test pings get one quick attempt so the
/// dashboard answers fast.
#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    pub max_attempts: i32,
    pub delays: Vec<Duration>,
}

impl DeliveryPolicy {
    pub fn production() -> Self {
        Self {
            max_attempts: 3,
            delays: vec![
                Duration::from_secs(60),
                Duration::from_secs(5 * 60),
                Duration::from_secs(15 * 60),
                Duration::from_secs(30 * 60),
                Duration::from_secs(60 * 60),
            ],
        }
    }

    pub fn test() -> Self {
        Self {
            max_attempts: 1,
            delays: vec![Duration::from_secs(30)],
        }
    }

    /// Delay after the `attempts_made`-th failed attempt. Past the end of the
    /// schedule, the last entry repeats.
    pub fn delay_after(&self, attempts_made: i32) -> Duration {
        let index = (attempts_made.max(1) as usize) - 1;
        self.delays
            .get(index)
            .or(self.delays.last())
            .copied()
            .unwrap_or(Duration::from_secs(60))
    }
}

/// Fans domain events out to webhook subscribers: one delivery batch per
/// matching config, signed once, POSTed with bounded retries.
#[derive(Clone)]
pub struct WebhookEngine {
    store: Arc<dyn WebhookStore>,
    client: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    production_policy: DeliveryPolicy,
    test_policy: DeliveryPolicy,
    request_timeout: Duration,
    /// Signs deliveries to ad-hoc destinations that have no config secret.
    fallback_secret: String,
}

impl WebhookEngine {
    pub fn new(
        store: Arc<dyn WebhookStore>,
        client: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
        fallback_secret: String,
    ) -> Self {
        Self {
            store,
            client,
            clock,
            production_policy: DeliveryPolicy::production(),
            test_policy: DeliveryPolicy::test(),
            request_timeout: Duration::from_secs(30),
            fallback_secret,
        }
    }

    pub fn with_policies(mut self, production: DeliveryPolicy, test: DeliveryPolicy) -> Self {
        self.production_policy = production;
        self.test_policy = test;
        self
    }

    fn policy_for(&self, event: JobEvent) -> &DeliveryPolicy {
        match event {
            JobEvent::WebhookTest => &self.test_policy,
            _ => &self.production_policy,
        }
    }

    /// Instantiate and immediately attempt one delivery per subscribed
    /// config (plus the optional ad-hoc destination). Returns the batches in
    /// their post-attempt state.
    pub async fn emit_event(
        &self,
        user_id: &str,
        event: JobEvent,
        data: EventData,
        direct_url: Option<String>,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let now = self.clock.now();
        let payload = WebhookPayload::new(event, now, data).to_json()?;
        let policy = self.policy_for(event).clone();

        let mut deliveries = Vec::new();
        for config in self.store.active_configs_for(user_id, event).await? {
            deliveries.push(self.build_delivery(
                Some(config.id.clone()),
                user_id,
                event,
                &payload,
                &config.secret,
                config.url.clone(),
                &policy,
            ));
        }
        if let Some(url) = direct_url {
            deliveries.push(self.build_delivery(
                None,
                user_id,
                event,
                &payload,
                &self.fallback_secret,
                url,
                &policy,
            ));
        }

        debug!(
            user_id,
            event = event.as_str(),
            count = deliveries.len(),
            "webhook fan-out"
        );
        for delivery in deliveries.iter_mut() {
            self.store.insert_delivery(delivery).await?;
            self.attempt(delivery).await?;
        }
        Ok(deliveries)
    }

    fn build_delivery(
        &self,
        webhook_config_id: Option<String>,
        user_id: &str,
        event: JobEvent,
        payload: &str,
        secret: &str,
        url: String,
        policy: &DeliveryPolicy,
    ) -> WebhookDelivery {
        let now = self.clock.now();
        WebhookDelivery {
            id: delivery_id(now),
            webhook_config_id,
            user_id: user_id.to_string(),
            event,
            payload: payload.to_string(),
            signature: sign_payload(payload.as_bytes(), secret),
            status: DeliveryStatus::Pending,
            url,
            attempts: 0,
            max_attempts: policy.max_attempts,
            last_attempt_at: None,
            // Pending batches are due immediately, so the retry runner picks
            // them up if the process dies before the first attempt.
            next_retry_at: Some(now),
            response_code: None,
            response_body: None,
            response_time_ms: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Run one HTTP attempt for a delivery and persist the outcome. The
    /// payload and signature are the stored ones; retries resend identical
    /// bytes.
    pub async fn attempt(&self, delivery: &mut WebhookDelivery) -> Result<(), StoreError> {
        let now = self.clock.now();
        delivery.status = DeliveryStatus::Delivering;
        delivery.attempts += 1;
        delivery.last_attempt_at = Some(now);
        delivery.next_retry_at = None;
        self.store.update_delivery(delivery).await?;

        let headers = [
            (EVENT_HEADER.to_string(), delivery.event.as_str().to_string()),
            (SIGNATURE_HEADER.to_string(), delivery.signature_header_value()),
            (DELIVERY_HEADER.to_string(), delivery.id.clone()),
        ];

        let outcome = self
            .client
            .post(
                &delivery.url,
                &headers,
                &delivery.payload,
                self.request_timeout,
            )
            .await;

        match outcome {
            Ok(summary) => {
                delivery.response_code = Some(i32::from(summary.status));
                delivery.response_body = Some(truncate_response_body(
                    summary.body,
                    RESPONSE_BODY_LIMIT,
                ));
                delivery.response_time_ms = Some(summary.elapsed.as_millis() as i64);

                match summary.status {
                    200..=299 => {
                        delivery.status = DeliveryStatus::Delivered;
                        delivery.error = None;
                    }
                    // The endpoint told us we're not welcome; retrying with
                    // the same credentials cannot succeed.
                    401 | 403 => {
                        delivery.status = DeliveryStatus::Failed;
                        delivery.error =
                            Some("endpoint rejected the delivery as unauthorized".to_string());
                    }
                    status => {
                        self.schedule_or_fail(
                            delivery,
                            format!("endpoint returned status {status}"),
                        );
                    }
                }
            }
            Err(transport) => {
                self.schedule_or_fail(delivery, transport.to_string());
            }
        }

        self.store.update_delivery(delivery).await?;
        metrics::counter!(
            "webhook_delivery_attempts_total",
            &[("outcome", status_tag(delivery.status))]
        )
        .increment(1);
        Ok(())
    }

    fn schedule_or_fail(&self, delivery: &mut WebhookDelivery, reason: String) {
        delivery.error = Some(reason);
        if delivery.attempts < delivery.max_attempts {
            let delay = self.policy_for(delivery.event).delay_after(delivery.attempts);
            delivery.status = DeliveryStatus::Retrying;
            delivery.next_retry_at = Some(
                self.clock.now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()),
            );
        } else {
            delivery.status = DeliveryStatus::Failed;
            delivery.next_retry_at = None;
        }
    }

    /// One tick of the retry runner: attempt every delivery whose retry is
    /// due, up to `limit`.
    pub async fn run_due_once(&self, limit: u32) -> Result<usize, StoreError> {
        let due = self.store.deliveries_due(limit).await?;
        let count = due.len();
        for mut delivery in due {
            self.attempt(&mut delivery).await?;
        }
        Ok(count)
    }

    /// Fire a WEBHOOK_TEST ping at a single config, using the short test
    /// policy.
    pub async fn send_test(
        &self,
        config: &WebhookConfig,
    ) -> Result<WebhookDelivery, StoreError> {
        let now = self.clock.now();
        let mut data = EventData::new();
        data.insert("webhookConfigId".to_string(), config.id.clone());
        data.insert(
            "message".to_string(),
            "test delivery from snapshot service".to_string(),
        );
        let payload = WebhookPayload::new(JobEvent::WebhookTest, now, data).to_json()?;
        let policy = self.test_policy.clone();

        let mut delivery = self.build_delivery(
            Some(config.id.clone()),
            &config.user_id,
            JobEvent::WebhookTest,
            &payload,
            &config.secret,
            config.url.clone(),
            &policy,
        );
        self.store.insert_delivery(&delivery).await?;
        self.attempt(&mut delivery).await?;
        Ok(delivery)
    }
}

fn status_tag(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Pending => "pending",
        DeliveryStatus::Delivering => "delivering",
        DeliveryStatus::Delivered => "delivered",
        DeliveryStatus::Retrying => "retrying",
        DeliveryStatus::Failed => "failed",
    }
}

/// Emitters fire and forget; the engine owns persistence and retries, so the
/// fan-out runs off the caller's critical path.
#[async_trait]
impl EventSink for WebhookEngine {
    async fn emit(
        &self,
        user_id: &str,
        event: JobEvent,
        data: EventData,
        direct_url: Option<String>,
    ) {
        let engine = self.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            if let Err(fanout_error) = engine.emit_event(&user_id, event, data, direct_url).await {
                error!(user_id = %user_id, event = event.as_str(), "webhook fan-out failed: {fanout_error}");
            }
        });
    }
}
