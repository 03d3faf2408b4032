use std::sync::Arc;

use tracing::warn;

use snap_core::{
    Clock, EventData, EventSink, Job, JobEvent, JobKind, JobQueue, JobStatus, JobStore, NewJob,
    QueuedJob, RetryType, ScreenshotRequest,
};

use crate::credits::CreditLedger;
use crate::error::AdmissionError;
use crate::limiter::{OperationType, RateDecision, RateLimiter};
use crate::validate::{validate_submission, RequestLimits};

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub max_retries: i32,
    pub limits: RequestLimits,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            limits: RequestLimits::default(),
        }
    }
}

/// What the caller gets back for an admitted job.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Submission {
    pub job_id: String,
    pub status: JobStatus,
    pub queue_position: usize,
}

/// The orchestrator invoked once per API submission: validate, consult the
/// rate limiter, reserve credits, persist the row, enqueue. Holds its
/// collaborators as ports; a top-level wiring function supplies the concrete
/// backends.
pub struct Admission {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    ledger: Arc<dyn CreditLedger>,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    events: Option<Arc<dyn EventSink>>,
    config: AdmissionConfig,
}

impl Admission {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        ledger: Arc<dyn CreditLedger>,
        limiter: RateLimiter,
        clock: Arc<dyn Clock>,
        events: Option<Arc<dyn EventSink>>,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            store,
            queue,
            ledger,
            limiter,
            clock,
            events,
            config,
        }
    }

    pub async fn submit(
        &self,
        user_id: &str,
        api_key_id: &str,
        kind: JobKind,
        request: ScreenshotRequest,
        webhook_url: Option<String>,
    ) -> Result<Submission, AdmissionError> {
        validate_submission(&request, webhook_url.as_deref(), &self.config.limits)?;

        // Exactly one limiter consultation per attempt; a denial has no
        // ledger side effects.
        let op = match kind {
            JobKind::Screenshot => OperationType::Screenshot,
            JobKind::Analysis => OperationType::Analysis,
        };
        if let RateDecision::Denied {
            retry_after,
            reason,
        } = self.limiter.check(user_id, op).await?
        {
            return Err(AdmissionError::RateLimited {
                retry_after,
                reason,
            });
        }

        let job = NewJob {
            user_id: user_id.to_string(),
            api_key_id: api_key_id.to_string(),
            kind,
            request,
            webhook_url,
            max_retries: self.config.max_retries,
        }
        .into_job(self.clock.now());

        let cost = kind.credit_cost();
        self.ledger
            .deduct(user_id, cost, "job admission", &job.id)
            .await?;

        if let Err(error) = self.store.insert(&job).await {
            // Reserve released when the row never landed. Best effort: a
            // failed refund here only strands credits, never double-runs.
            if let Err(refund_error) = self
                .ledger
                .refund(user_id, cost, "admission rollback", &job.id)
                .await
            {
                warn!(
                    job_id = %job.id,
                    "failed to release credit reserve after persist failure: {refund_error}"
                );
            }
            return Err(error.into());
        }

        if let Err(error) = self.queue.enqueue(QueuedJob::from(&job)).await {
            // The row is durable, so the orphan sweep will re-enqueue it;
            // admission still succeeded from the caller's point of view.
            warn!(job_id = %job.id, "enqueue failed after persist, leaving to recovery: {error}");
        }

        metrics::counter!("jobs_admitted_total").increment(1);
        self.emit_created(&job).await;

        Ok(Submission {
            job_id: job.id,
            status: JobStatus::Queued,
            queue_position: self.queue.size().await,
        })
    }

    /// Owner-initiated retry of a failed (or retry-pending) job. Credits are
    /// deducted again, the delayed-queue entry is cancelled if one is
    /// pending, and the job goes straight back onto the ready queue.
    pub async fn retry_job(
        &self,
        job_id: &str,
        user_id: &str,
    ) -> Result<Submission, AdmissionError> {
        let Some(mut job) = self.store.find_by_id_and_user(job_id, user_id).await? else {
            return Err(AdmissionError::AuthRejected);
        };

        let retry_pending = job.status == JobStatus::Queued && job.next_retry_at.is_some();
        if job.status != JobStatus::Failed && !retry_pending {
            return Err(AdmissionError::NotRetryable);
        }

        self.queue.cancel_delayed(&job.id).await;

        let cost = job.kind.credit_cost();
        self.ledger
            .deduct(user_id, cost, "manual retry", &job.id)
            .await?;

        let now = self.clock.now();
        job.status = JobStatus::Queued;
        job.retry_type = RetryType::Manual;
        job.retry_count += 1;
        if job.retry_count > job.max_retries {
            // A manual retry extends the budget rather than violating it.
            job.max_retries = job.retry_count;
        }
        job.is_retryable = true;
        job.next_retry_at = Some(now);
        job.error_message = None;
        job.clear_lock();

        self.store.update(&job).await?;

        if let Err(error) = self.queue.enqueue(QueuedJob::from(&job)).await {
            // The row is durable and due, so the retry-ready scanner will
            // pick it up; the paid-for retry must not be reported as failed.
            warn!(job_id = %job.id, "enqueue failed after persist, leaving to recovery: {error}");
        }

        metrics::counter!("jobs_manually_retried_total").increment(1);
        if let Some(events) = &self.events {
            let mut data = EventData::new();
            data.insert("jobId".to_string(), job.id.clone());
            data.insert("retryType".to_string(), "MANUAL".to_string());
            data.insert("retryCount".to_string(), job.retry_count.to_string());
            events
                .emit(user_id, JobEvent::ScreenshotRetried, data, None)
                .await;
        }

        Ok(Submission {
            job_id: job.id,
            status: JobStatus::Queued,
            queue_position: self.queue.size().await,
        })
    }

    /// Access-scoped single read for status polling.
    pub async fn job_for_user(
        &self,
        job_id: &str,
        user_id: &str,
    ) -> Result<Option<Job>, AdmissionError> {
        Ok(self.store.find_by_id_and_user(job_id, user_id).await?)
    }

    /// Bulk status polling; ids the user does not own are silently dropped.
    pub async fn poll_jobs(
        &self,
        job_ids: &[String],
        user_id: &str,
    ) -> Result<Vec<Job>, AdmissionError> {
        Ok(self.store.find_by_ids(job_ids, user_id).await?)
    }

    /// Paged listing for the user's dashboard.
    pub async fn list_jobs(
        &self,
        user_id: &str,
        page: u32,
        limit: u32,
        status: Option<JobStatus>,
    ) -> Result<(Vec<Job>, u64), AdmissionError> {
        Ok(self.store.find_by_user(user_id, page, limit, status).await?)
    }

    async fn emit_created(&self, job: &Job) {
        if let Some(events) = &self.events {
            let mut data = EventData::new();
            data.insert("jobId".to_string(), job.id.clone());
            data.insert("status".to_string(), "QUEUED".to_string());
            events
                .emit(&job.user_id, JobEvent::ScreenshotCreated, data, None)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use snap_core::{ImageFormat, MemoryJobStore, MemoryQueue, StoreError, TestClock};

    use crate::credits::MemoryCreditLedger;
    use crate::plans::{Plan, StaticPlanProvider};

    struct Fixture {
        clock: Arc<TestClock>,
        store: Arc<MemoryJobStore>,
        queue: Arc<MemoryQueue>,
        ledger: Arc<MemoryCreditLedger>,
        admission: Admission,
    }

    fn fixture_with(plan: Plan, credits: i64, queue_capacity: usize) -> Fixture {
        let clock = Arc::new(TestClock::new(Utc::now()));
        let store = Arc::new(MemoryJobStore::new(clock.clone()));
        let queue = Arc::new(MemoryQueue::new(clock.clone(), queue_capacity));
        let ledger = Arc::new(MemoryCreditLedger::new());
        ledger.grant("u1", credits);

        let limiter = RateLimiter::new(
            Arc::new(StaticPlanProvider::new(plan)),
            ledger.clone(),
            clock.clone(),
        );
        let admission = Admission::new(
            store.clone(),
            queue.clone(),
            ledger.clone(),
            limiter,
            clock.clone(),
            None,
            AdmissionConfig::default(),
        );
        Fixture {
            clock,
            store,
            queue,
            ledger,
            admission,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Plan::free(), 10, 100)
    }

    fn request() -> ScreenshotRequest {
        ScreenshotRequest {
            url: "https://example.com".to_string(),
            width: 1200,
            height: 800,
            format: ImageFormat::Png,
            full_page: false,
            wait_selector: None,
            wait_ms: None,
            quality: None,
            language: None,
        }
    }

    #[tokio::test]
    async fn happy_path_persists_enqueues_and_deducts() {
        let f = fixture();
        let submission = f
            .admission
            .submit("u1", "k1", JobKind::Screenshot, request(), None)
            .await
            .unwrap();

        assert_eq!(submission.status, JobStatus::Queued);
        assert_eq!(submission.queue_position, 1);

        let job = f.store.find_by_id(&submission.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_type, RetryType::None);
        assert_eq!(job.retry_count, 0);
        assert!(job.next_retry_at.is_none());

        assert_eq!(f.ledger.balance("u1").await.unwrap(), 9);
        assert_eq!(f.queue.size().await, 1);
    }

    #[tokio::test]
    async fn validation_failure_has_no_side_effects() {
        let f = fixture();
        let mut bad = request();
        bad.width = 0;

        let error = f
            .admission
            .submit("u1", "k1", JobKind::Screenshot, bad, None)
            .await
            .unwrap_err();
        assert!(matches!(error, AdmissionError::Validation(_)));
        assert!(f.store.is_empty());
        assert_eq!(f.ledger.balance("u1").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn rate_limit_denial_leaves_no_trace() {
        let plan = Plan {
            id: "tiny".to_string(),
            hourly_limit: 1,
            minute_limit: 1,
            max_concurrency: 1,
        };
        let f = fixture_with(plan, 10, 100);

        f.admission
            .submit("u1", "k1", JobKind::Screenshot, request(), None)
            .await
            .unwrap();

        let error = f
            .admission
            .submit("u1", "k1", JobKind::Screenshot, request(), None)
            .await
            .unwrap_err();
        let AdmissionError::RateLimited { retry_after, .. } = error else {
            panic!("expected rate limit denial");
        };
        assert!(retry_after > Duration::ZERO);
        assert!(retry_after <= Duration::from_secs(3600));

        // Denied attempt: no row, no deduction.
        assert_eq!(f.store.len(), 1);
        assert_eq!(f.ledger.balance("u1").await.unwrap(), 9);
        assert_eq!(f.queue.size().await, 1);
    }

    #[tokio::test]
    async fn insufficient_credits_are_reported_with_the_shortfall() {
        let f = fixture_with(Plan::free(), 2, 100);

        let error = f
            .admission
            .submit("u1", "k1", JobKind::Analysis, request(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            AdmissionError::InsufficientCredits {
                required: 3,
                available: 2
            }
        ));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn analysis_jobs_cost_more() {
        let f = fixture();
        f.admission
            .submit("u1", "k1", JobKind::Analysis, request(), None)
            .await
            .unwrap();
        assert_eq!(f.ledger.balance("u1").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn enqueue_failure_still_admits_the_job() {
        // Zero-capacity queue: the enqueue always fails, the row must still
        // land and keep its deduction for the orphan sweep to pick up.
        let f = fixture_with(Plan::free(), 10, 0);

        let submission = f
            .admission
            .submit("u1", "k1", JobKind::Screenshot, request(), None)
            .await
            .unwrap();

        assert!(f.store.find_by_id(&submission.job_id).await.unwrap().is_some());
        assert_eq!(f.ledger.balance("u1").await.unwrap(), 9);
        assert_eq!(f.queue.size().await, 0);
    }

    struct BrokenStore;

    #[async_trait]
    impl JobStore for BrokenStore {
        async fn insert(&self, job: &Job) -> Result<(), StoreError> {
            Err(StoreError::RowVanished(job.id.clone()))
        }
        async fn update(&self, _: &Job) -> Result<(), StoreError> {
            unimplemented!()
        }
        async fn find_by_id(&self, _: &str) -> Result<Option<Job>, StoreError> {
            unimplemented!()
        }
        async fn find_by_id_and_user(&self, _: &str, _: &str) -> Result<Option<Job>, StoreError> {
            unimplemented!()
        }
        async fn find_by_user(
            &self,
            _: &str,
            _: u32,
            _: u32,
            _: Option<JobStatus>,
        ) -> Result<(Vec<Job>, u64), StoreError> {
            unimplemented!()
        }
        async fn find_by_ids(&self, _: &[String], _: &str) -> Result<Vec<Job>, StoreError> {
            unimplemented!()
        }
        async fn find_pending(&self) -> Result<Vec<Job>, StoreError> {
            unimplemented!()
        }
        async fn try_lock(
            &self,
            _: &str,
            _: &str,
            _: Duration,
        ) -> Result<Option<Job>, StoreError> {
            unimplemented!()
        }
        async fn find_stuck(&self, _: Duration, _: u32) -> Result<Vec<Job>, StoreError> {
            unimplemented!()
        }
        async fn find_ready_for_retry(&self, _: u32) -> Result<Vec<Job>, StoreError> {
            unimplemented!()
        }
        async fn find_orphaned(&self, _: Duration, _: u32) -> Result<Vec<Job>, StoreError> {
            unimplemented!()
        }
        async fn find_failed_retryable(&self, _: u32) -> Result<Vec<Job>, StoreError> {
            unimplemented!()
        }
        async fn stats(&self) -> Result<snap_core::JobStats, StoreError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn persist_failure_releases_the_reserve() {
        let clock = Arc::new(TestClock::new(Utc::now()));
        let queue = Arc::new(MemoryQueue::new(clock.clone(), 100));
        let ledger = Arc::new(MemoryCreditLedger::new());
        ledger.grant("u1", 10);
        let limiter = RateLimiter::new(
            Arc::new(StaticPlanProvider::new(Plan::free())),
            ledger.clone(),
            clock.clone(),
        );
        let admission = Admission::new(
            Arc::new(BrokenStore),
            queue,
            ledger.clone(),
            limiter,
            clock,
            None,
            AdmissionConfig::default(),
        );

        let error = admission
            .submit("u1", "k1", JobKind::Screenshot, request(), None)
            .await
            .unwrap_err();
        assert!(matches!(error, AdmissionError::Store(_)));
        assert_eq!(ledger.balance("u1").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn manual_retry_happy_path() {
        let f = fixture();
        let submission = f
            .admission
            .submit("u1", "k1", JobKind::Screenshot, request(), None)
            .await
            .unwrap();
        f.queue.dequeue().await.unwrap();

        // Simulate a terminal failure.
        let mut job = f.store.find_by_id(&submission.job_id).await.unwrap().unwrap();
        job.status = JobStatus::Failed;
        job.retry_count = 3;
        job.error_message = Some("page did not finish loading in time".to_string());
        f.store.update(&job).await.unwrap();

        let retried = f.admission.retry_job(&job.id, "u1").await.unwrap();
        assert_eq!(retried.status, JobStatus::Queued);

        let job = f.store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(job.retry_type, RetryType::Manual);
        assert_eq!(job.retry_count, 4);
        assert_eq!(job.max_retries, 4);
        assert!(job.next_retry_at.is_some());
        assert!(job.error_message.is_none());

        // Re-deducted: 10 - 1 (submit) - 1 (manual retry).
        assert_eq!(f.ledger.balance("u1").await.unwrap(), 8);
        assert_eq!(f.queue.size().await, 1);
    }

    #[tokio::test]
    async fn manual_retry_cancels_a_pending_delayed_entry() {
        let f = fixture();
        let submission = f
            .admission
            .submit("u1", "k1", JobKind::Screenshot, request(), None)
            .await
            .unwrap();
        let snapshot = f.queue.dequeue().await.unwrap().unwrap();

        let mut job = f.store.find_by_id(&submission.job_id).await.unwrap().unwrap();
        job.retry_count = 1;
        job.next_retry_at = Some(f.clock.now() + chrono::Duration::seconds(30));
        f.store.update(&job).await.unwrap();
        f.queue
            .enqueue_delayed(snapshot, Duration::from_secs(30))
            .await
            .unwrap();

        f.admission.retry_job(&job.id, "u1").await.unwrap();
        assert_eq!(f.queue.delayed_len(), 0);
        assert_eq!(f.queue.size().await, 1);
    }

    #[tokio::test]
    async fn manual_retry_survives_an_enqueue_failure() {
        // Zero-capacity queue: the enqueue always fails, but the paid-for
        // retry is durably queued and must still be reported as accepted.
        let f = fixture_with(Plan::free(), 10, 0);
        let submission = f
            .admission
            .submit("u1", "k1", JobKind::Screenshot, request(), None)
            .await
            .unwrap();

        let mut job = f.store.find_by_id(&submission.job_id).await.unwrap().unwrap();
        job.status = JobStatus::Failed;
        job.retry_count = 3;
        f.store.update(&job).await.unwrap();

        let retried = f.admission.retry_job(&job.id, "u1").await.unwrap();
        assert_eq!(retried.status, JobStatus::Queued);

        let job = f.store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_type, RetryType::Manual);
        assert!(job.next_retry_at.is_some());
        assert_eq!(f.queue.size().await, 0);

        // Charged once for the submit and once for the manual retry; a
        // lost enqueue is not a failed retry.
        assert_eq!(f.ledger.balance("u1").await.unwrap(), 8);
    }

    #[tokio::test]
    async fn manual_retry_by_non_owner_is_rejected() {
        let f = fixture();
        let submission = f
            .admission
            .submit("u1", "k1", JobKind::Screenshot, request(), None)
            .await
            .unwrap();

        let error = f.admission.retry_job(&submission.job_id, "u2").await.unwrap_err();
        assert!(matches!(error, AdmissionError::AuthRejected));
    }

    #[tokio::test]
    async fn manual_retry_of_a_running_job_is_rejected() {
        let f = fixture();
        let submission = f
            .admission
            .submit("u1", "k1", JobKind::Screenshot, request(), None)
            .await
            .unwrap();

        let mut job = f.store.find_by_id(&submission.job_id).await.unwrap().unwrap();
        job.status = JobStatus::Processing;
        f.store.update(&job).await.unwrap();

        let error = f.admission.retry_job(&job.id, "u1").await.unwrap_err();
        assert!(matches!(error, AdmissionError::NotRetryable));
    }

    #[tokio::test]
    async fn polling_is_access_scoped() {
        let f = fixture();
        let submission = f
            .admission
            .submit("u1", "k1", JobKind::Screenshot, request(), None)
            .await
            .unwrap();

        assert!(f
            .admission
            .job_for_user(&submission.job_id, "u2")
            .await
            .unwrap()
            .is_none());
        let polled = f
            .admission
            .poll_jobs(&[submission.job_id.clone()], "u1")
            .await
            .unwrap();
        assert_eq!(polled.len(), 1);
    }
}
