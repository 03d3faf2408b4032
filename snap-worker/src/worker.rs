use std::sync::Arc;
use std::time::Duration;

use sqlx::types::Json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use health::HealthRegistry;
use snap_api::credits::CreditLedger;
use snap_core::{
    worker_id, Clock, EventData, EventSink, FailureKind, Job, JobEvent, JobKind, JobQueue,
    JobStatus, JobStore, QueuedJob, RetryPolicy, RetryType, StoreError,
};

use crate::artifacts::ObjectStore;
use crate::browser::BrowserPool;
use crate::renderer::RenderOutput;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Hard ceiling for one render attempt.
    pub attempt_timeout: Duration,
    /// How long a worker waits for a browser slot before requeuing the job.
    pub checkout_wait: Duration,
    /// Lock staleness threshold, shared with the stuck scanner.
    pub stuck_after: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            checkout_wait: Duration::from_secs(5),
            stuck_after: Duration::from_secs(30 * 60),
        }
    }
}

/// Executes one job attempt end to end and resolves its outcome. Shared by
/// the worker loops and the stuck scanner, which feeds lost jobs through the
/// same retry-or-fail decision.
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    ledger: Arc<dyn CreditLedger>,
    browsers: Arc<BrowserPool>,
    objects: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
    events: Option<Arc<dyn EventSink>>,
    clock: Arc<dyn Clock>,
    config: RunnerConfig,
}

impl JobRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        ledger: Arc<dyn CreditLedger>,
        browsers: Arc<BrowserPool>,
        objects: Arc<dyn ObjectStore>,
        policy: RetryPolicy,
        events: Option<Arc<dyn EventSink>>,
        clock: Arc<dyn Clock>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            ledger,
            browsers,
            objects,
            policy,
            events,
            clock,
            config,
        }
    }

    /// Run one dequeued snapshot. Losing the lock race or finding the row in
    /// a non-runnable state is not an error; the entry is simply dropped.
    pub async fn process(&self, worker: &str, snapshot: &QueuedJob) -> Result<(), StoreError> {
        let Some(mut job) = self
            .store
            .try_lock(&snapshot.job_id, worker, self.config.stuck_after)
            .await?
        else {
            // Another worker holds it; at-least-once delivery makes this
            // perfectly normal.
            return Ok(());
        };

        if job.status != JobStatus::Queued {
            // Stale queue entry for a job that already ran.
            job.clear_lock();
            self.store.update(&job).await?;
            return Ok(());
        }

        job.status = JobStatus::Processing;
        job.started_at = Some(self.clock.now());
        job.next_retry_at = None;
        self.store.update(&job).await?;
        metrics::counter!("jobs_started_total").increment(1);

        let lease = match self.browsers.checkout(self.config.checkout_wait).await {
            Ok(lease) => lease,
            Err(pool_error) => {
                return self
                    .resolve_failure(job, FailureKind::PoolExhausted, pool_error.to_string())
                    .await;
            }
        };

        let outcome = lease
            .renderer()
            .render(&job.request, self.config.attempt_timeout)
            .await;

        match outcome {
            Ok(output) => {
                self.browsers.give_back(lease, true).await;
                self.complete(job, output).await
            }
            Err(render_error) => {
                self.browsers
                    .give_back(lease, render_error.leaves_renderer_healthy())
                    .await;
                let kind = render_error.failure_kind();
                self.resolve_failure(job, kind, render_error.to_string())
                    .await
            }
        }
    }

    async fn complete(&self, mut job: Job, output: RenderOutput) -> Result<(), StoreError> {
        let key = format!(
            "{}/{}.{}",
            job.user_id,
            job.id,
            job.request.format.file_extension()
        );
        let result_url = match self
            .objects
            .put(&key, &output.bytes, &output.content_type)
            .await
        {
            Ok(url) => url,
            Err(upload_error) => {
                return self
                    .resolve_failure(
                        job,
                        FailureKind::Internal,
                        format!("artifact upload failed: {upload_error}"),
                    )
                    .await;
            }
        };

        let now = self.clock.now();
        let processing_time_ms = job
            .started_at
            .map(|started| (now - started).num_milliseconds());

        let mut metadata = output.metadata;
        metadata.byte_size = output.bytes.len() as i64;

        job.status = JobStatus::Completed;
        job.result_url = Some(result_url.clone());
        job.result_metadata = Some(Json(metadata));
        job.error_message = None;
        job.completed_at = Some(now);
        job.processing_time_ms = processing_time_ms;
        job.webhook_sent = self.events.is_some();
        job.clear_lock();
        self.store.update(&job).await?;

        metrics::counter!("jobs_completed_total").increment(1);
        if let Some(processing_time_ms) = processing_time_ms {
            metrics::histogram!("job_processing_duration_seconds")
                .record(processing_time_ms as f64 / 1000.0);
        }

        let event = match job.kind {
            JobKind::Screenshot => JobEvent::ScreenshotCompleted,
            JobKind::Analysis => JobEvent::AnalysisCompleted,
        };
        let mut data = EventData::new();
        data.insert("jobId".to_string(), job.id.clone());
        data.insert("status".to_string(), "COMPLETED".to_string());
        data.insert("resultUrl".to_string(), result_url);
        if let Some(processing_time_ms) = processing_time_ms {
            data.insert(
                "processingTimeMs".to_string(),
                processing_time_ms.to_string(),
            );
        }
        self.emit(&job.user_id, event, data, job.webhook_url.clone())
            .await;
        Ok(())
    }

    /// The shared retry-or-fail decision. `detail` is operator-facing; the
    /// user-visible `error_message` is always the stable classification.
    pub async fn resolve_failure(
        &self,
        mut job: Job,
        kind: FailureKind,
        detail: String,
    ) -> Result<(), StoreError> {
        warn!(job_id = %job.id, ?kind, "attempt failed: {detail}");
        let now = self.clock.now();
        job.last_failure_reason = Some(detail);
        job.is_retryable = kind.is_retryable();

        if self
            .policy
            .should_retry(kind, job.retry_count, job.max_retries)
        {
            let delay = self.policy.time_until_next_retry(job.retry_count as u32);
            job.retry_count += 1;
            job.status = JobStatus::Queued;
            job.retry_type = RetryType::Automatic;
            job.next_retry_at =
                Some(now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()));
            job.error_message = None;
            job.clear_lock();
            self.store.update(&job).await?;

            if let Err(queue_error) = self
                .queue
                .enqueue_delayed(QueuedJob::from(&job), delay)
                .await
            {
                // The row carries next_retry_at, so the retry scanner will
                // pick it up even though the queue lost it.
                warn!(job_id = %job.id, "delayed enqueue failed, leaving to recovery: {queue_error}");
            }

            metrics::counter!("jobs_retried_total").increment(1);
            let mut data = EventData::new();
            data.insert("jobId".to_string(), job.id.clone());
            data.insert("retryCount".to_string(), job.retry_count.to_string());
            if let Some(next_retry_at) = job.next_retry_at {
                data.insert("nextRetryAt".to_string(), next_retry_at.to_rfc3339());
            }
            self.emit(&job.user_id, JobEvent::ScreenshotRetried, data, None)
                .await;
            return Ok(());
        }

        job.status = JobStatus::Failed;
        job.error_message = Some(kind.to_string());
        job.next_retry_at = None;
        job.webhook_sent = self.events.is_some();
        job.clear_lock();
        self.store.update(&job).await?;

        // Terminal failure returns the submission's credits, exactly once;
        // the ledger dedupes if a scanner raced us here.
        if let Err(ledger_error) = self
            .ledger
            .refund(
                &job.user_id,
                job.kind.credit_cost(),
                "terminal failure",
                &job.id,
            )
            .await
        {
            error!(job_id = %job.id, "refund failed: {ledger_error}");
        }

        metrics::counter!("jobs_failed_total").increment(1);
        let event = match job.kind {
            JobKind::Screenshot => JobEvent::ScreenshotFailed,
            JobKind::Analysis => JobEvent::AnalysisFailed,
        };
        let mut data = EventData::new();
        data.insert("jobId".to_string(), job.id.clone());
        data.insert("status".to_string(), "FAILED".to_string());
        data.insert("error".to_string(), kind.to_string());
        self.emit(&job.user_id, event, data, job.webhook_url.clone())
            .await;
        Ok(())
    }

    async fn emit(
        &self,
        user_id: &str,
        event: JobEvent,
        data: EventData,
        direct_url: Option<String>,
    ) {
        if let Some(events) = &self.events {
            events.emit(user_id, event, data, direct_url).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// N long-running workers, each popping one job at a time. Workers drain
/// their current attempt on shutdown and then exit.
pub struct WorkerPool {
    runner: Arc<JobRunner>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        runner: Arc<JobRunner>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            runner,
            queue,
            clock,
            config,
        }
    }

    pub fn spawn(
        &self,
        shutdown: watch::Receiver<bool>,
        liveness: &HealthRegistry,
    ) -> Vec<JoinHandle<()>> {
        (0..self.config.worker_count)
            .map(|index| {
                let name = format!("worker-{index}");
                let worker = worker_id(&name);
                let handle = liveness.register(&name, self.config.poll_interval * 120);
                let runner = self.runner.clone();
                let queue = self.queue.clone();
                let clock = self.clock.clone();
                let poll_interval = self.config.poll_interval;
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    info!(worker = %worker, "worker started");
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        handle.report_healthy();

                        match queue.dequeue().await {
                            Ok(Some(snapshot)) => {
                                if let Err(process_error) =
                                    runner.process(&worker, &snapshot).await
                                {
                                    error!(
                                        worker = %worker,
                                        job_id = %snapshot.job_id,
                                        "failed to process job: {process_error}"
                                    );
                                }
                            }
                            Ok(None) => clock.sleep(poll_interval).await,
                            Err(queue_error) => {
                                error!(worker = %worker, "dequeue failed: {queue_error}");
                                clock.sleep(poll_interval).await;
                            }
                        }
                    }
                    info!(worker = %worker, "worker exiting");
                })
            })
            .collect()
    }
}
