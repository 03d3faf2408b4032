use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use health::HealthRegistry;
use snap_core::{
    worker_id, Clock, FailureKind, JobQueue, JobStatus, JobStore, QueuedJob, RetryPolicy,
    RetryType, StoreError,
};

use crate::worker::JobRunner;

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub interval: Duration,
    /// Per-tick row limit for each scan.
    pub batch_limit: u32,
    /// A processing job untouched for this long is considered lost.
    pub stuck_after: Duration,
    /// A queued job that never reached the ready queue is re-enqueued after
    /// this grace period.
    pub orphan_grace: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_limit: 50,
            stuck_after: Duration::from_secs(30 * 60),
            orphan_grace: Duration::from_secs(5 * 60),
        }
    }
}

/// The three recovery loops that guarantee forward progress when workers die
/// or the queue loses entries. Every scan claims rows through the same row
/// lock the workers use, so a live worker can never be trampled.
pub struct Scanners {
    runner: Arc<JobRunner>,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    config: ScannerConfig,
}

impl Scanners {
    pub fn new(
        runner: Arc<JobRunner>,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            runner,
            store,
            queue,
            policy,
            clock,
            config,
        }
    }

    /// Recover PROCESSING jobs whose worker went away: feed each one through
    /// the standard retry-or-fail decision.
    pub async fn stuck_scan_once(&self) -> Result<usize, StoreError> {
        let scanner = worker_id("stuck-scan");
        let candidates = self
            .store
            .find_stuck(self.config.stuck_after, self.config.batch_limit)
            .await?;

        let mut handled = 0;
        for candidate in candidates {
            let Some(job) = self
                .store
                .try_lock(&candidate.id, &scanner, self.config.stuck_after)
                .await?
            else {
                continue;
            };
            warn!(job_id = %job.id, "recovering stuck job");
            self.runner
                .resolve_failure(
                    job,
                    FailureKind::Internal,
                    "processing attempt lost".to_string(),
                )
                .await?;
            handled += 1;
        }
        if handled > 0 {
            metrics::counter!("stuck_jobs_recovered_total").increment(handled as u64);
        }
        Ok(handled)
    }

    /// Move QUEUED jobs whose retry delay has elapsed back onto the ready
    /// queue, plus orphans that never made it there in the first place.
    pub async fn retry_scan_once(&self) -> Result<usize, StoreError> {
        let scanner = worker_id("retry-scan");
        let mut candidates = self
            .store
            .find_ready_for_retry(self.config.batch_limit)
            .await?;
        candidates.extend(
            self.store
                .find_orphaned(self.config.orphan_grace, self.config.batch_limit)
                .await?,
        );

        let mut handled = 0;
        for candidate in candidates {
            let Some(mut job) = self
                .store
                .try_lock(&candidate.id, &scanner, self.config.stuck_after)
                .await?
            else {
                continue;
            };
            if job.status != JobStatus::Queued {
                job.clear_lock();
                self.store.update(&job).await?;
                continue;
            }
            // Release the claim before enqueueing so the worker that picks
            // the entry up can take the lock immediately.
            job.clear_lock();
            self.store.update(&job).await?;

            if let Err(queue_error) = self.queue.enqueue(QueuedJob::from(&job)).await {
                warn!(job_id = %job.id, "re-enqueue failed, will retry next tick: {queue_error}");
                break;
            }
            handled += 1;
        }
        Ok(handled)
    }

    /// Revive FAILED jobs that still have retry budget (a crash beat the
    /// requeue): schedule them like a fresh retryable failure.
    pub async fn failed_scan_once(&self) -> Result<usize, StoreError> {
        let scanner = worker_id("failed-scan");
        let candidates = self
            .store
            .find_failed_retryable(self.config.batch_limit)
            .await?;

        let mut handled = 0;
        for candidate in candidates {
            let Some(mut job) = self
                .store
                .try_lock(&candidate.id, &scanner, self.config.stuck_after)
                .await?
            else {
                continue;
            };
            // Re-check under the lock; the row may have moved since the scan.
            if job.status != JobStatus::Failed
                || !job.is_retryable
                || job.retry_count >= job.max_retries
            {
                job.clear_lock();
                self.store.update(&job).await?;
                continue;
            }

            let delay = self.policy.time_until_next_retry(job.retry_count as u32);
            job.retry_count += 1;
            job.status = JobStatus::Queued;
            job.retry_type = RetryType::Automatic;
            job.next_retry_at = Some(
                self.clock.now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()),
            );
            job.clear_lock();
            self.store.update(&job).await?;

            if let Err(queue_error) = self
                .queue
                .enqueue_delayed(QueuedJob::from(&job), delay)
                .await
            {
                warn!(job_id = %job.id, "delayed enqueue failed, retry scanner will recover: {queue_error}");
            }
            handled += 1;
        }
        Ok(handled)
    }

    pub fn spawn(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
        liveness: &HealthRegistry,
    ) -> Vec<JoinHandle<()>> {
        let scans: [(&str, ScanFn); 3] = [
            ("stuck-scan", |s| Box::pin(async move { s.stuck_scan_once().await })),
            ("retry-scan", |s| Box::pin(async move { s.retry_scan_once().await })),
            ("failed-scan", |s| Box::pin(async move { s.failed_scan_once().await })),
        ];

        scans
            .into_iter()
            .map(|(name, scan)| {
                let scanners = self.clone();
                let handle = liveness.register(name, self.config.interval * 3);
                let mut shutdown = shutdown.clone();
                let interval = self.config.interval;
                let name = name.to_string();

                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {}
                            _ = shutdown.changed() => break,
                        }
                        if *shutdown.borrow() {
                            break;
                        }
                        handle.report_healthy();
                        match scan(scanners.clone()).await {
                            Ok(handled) if handled > 0 => {
                                info!(scan = %name, handled, "scan tick")
                            }
                            Ok(_) => {}
                            Err(scan_error) => error!(scan = %name, "scan failed: {scan_error}"),
                        }
                    }
                })
            })
            .collect()
    }
}

type ScanFn = fn(
    Arc<Scanners>,
) -> std::pin::Pin<
    Box<dyn std::future::Future<Output = Result<usize, StoreError>> + Send>,
>;

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;

    use snap_api::credits::MemoryCreditLedger;
    use snap_api::CreditLedger;
    use snap_core::{
        ImageFormat, Job, JobKind, MemoryJobStore, MemoryQueue, NewJob, ScreenshotRequest,
        TestClock,
    };

    use crate::artifacts::MemoryObjectStore;
    use crate::browser::BrowserPool;
    use crate::renderer::{RenderError, RenderOutput, Renderer, RendererFactory};
    use crate::worker::RunnerConfig;

    struct NeverRenders;

    #[async_trait::async_trait]
    impl Renderer for NeverRenders {
        async fn render(
            &self,
            _request: &ScreenshotRequest,
            _timeout: Duration,
        ) -> Result<RenderOutput, RenderError> {
            unimplemented!("scanner tests never render")
        }
        async fn is_healthy(&self) -> bool {
            true
        }
        async fn close(&self) {}
    }

    struct NeverRendersFactory;

    #[async_trait::async_trait]
    impl RendererFactory for NeverRendersFactory {
        async fn create(&self) -> Result<Box<dyn Renderer>, RenderError> {
            Ok(Box::new(NeverRenders))
        }
    }

    struct Fixture {
        clock: Arc<TestClock>,
        store: Arc<MemoryJobStore>,
        queue: Arc<MemoryQueue>,
        ledger: Arc<MemoryCreditLedger>,
        scanners: Arc<Scanners>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(TestClock::new(Utc::now()));
        let store = Arc::new(MemoryJobStore::new(clock.clone()));
        let queue = Arc::new(MemoryQueue::new(clock.clone(), 100));
        let ledger = Arc::new(MemoryCreditLedger::new());
        ledger.grant("u1", 10);

        let policy = RetryPolicy::new(
            Duration::from_secs(30),
            2,
            Duration::from_secs(30 * 60),
            Duration::ZERO,
        );
        let runner = Arc::new(JobRunner::new(
            store.clone(),
            queue.clone(),
            ledger.clone(),
            Arc::new(BrowserPool::new(Box::new(NeverRendersFactory), 1)),
            Arc::new(MemoryObjectStore::new()),
            policy,
            None,
            clock.clone(),
            RunnerConfig::default(),
        ));
        let scanners = Arc::new(Scanners::new(
            runner,
            store.clone(),
            queue.clone(),
            policy,
            clock.clone(),
            ScannerConfig::default(),
        ));

        Fixture {
            clock,
            store,
            queue,
            ledger,
            scanners,
        }
    }

    async fn insert_job(f: &Fixture, mutate: impl FnOnce(&mut Job)) -> Job {
        let mut job = NewJob {
            user_id: "u1".to_string(),
            api_key_id: "k1".to_string(),
            kind: JobKind::Screenshot,
            request: ScreenshotRequest {
                url: "https://example.com".to_string(),
                width: 800,
                height: 600,
                format: ImageFormat::Png,
                full_page: false,
                wait_selector: None,
                wait_ms: None,
                quality: None,
                language: None,
            },
            webhook_url: None,
            max_retries: 3,
        }
        .into_job(f.clock.now());
        mutate(&mut job);
        f.store.insert(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn stuck_scan_reschedules_a_lost_job() {
        let f = fixture();
        let locked_at = f.clock.now();
        let job = insert_job(&f, |job| {
            job.status = JobStatus::Processing;
            job.locked_by = Some("w-dead".to_string());
            job.locked_at = Some(locked_at);
            job.started_at = Some(locked_at);
        })
        .await;

        // Thirty-one minutes in: past threshold, within the lock margin.
        f.clock.advance(Duration::from_secs(31 * 60));
        assert_eq!(f.scanners.stuck_scan_once().await.unwrap(), 0);

        // Past threshold plus the five-minute lock margin: recovered.
        f.clock.advance(Duration::from_secs(5 * 60));
        assert_eq!(f.scanners.stuck_scan_once().await.unwrap(), 1);

        let recovered = f.store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(recovered.status, JobStatus::Queued);
        assert_eq!(recovered.retry_count, 1);
        assert_eq!(
            recovered.next_retry_at,
            Some(f.clock.now() + chrono::Duration::seconds(30))
        );
        assert!(recovered.locked_by.is_none());
        assert_eq!(f.queue.delayed_len(), 1);
    }

    #[tokio::test]
    async fn stuck_scan_fails_an_exhausted_job_and_refunds() {
        let f = fixture();
        f.ledger
            .deduct("u1", 1, "job admission", "seed")
            .await
            .unwrap();
        let locked_at = f.clock.now();
        let job = insert_job(&f, |job| {
            job.status = JobStatus::Processing;
            job.retry_count = 3;
            job.locked_by = Some("w-dead".to_string());
            job.locked_at = Some(locked_at);
        })
        .await;
        // Ledger dedupes refunds by job id, so seed the deduction under the
        // real id.
        f.ledger
            .deduct("u1", 1, "job admission", &job.id)
            .await
            .unwrap();

        f.clock.advance(Duration::from_secs(36 * 60));
        assert_eq!(f.scanners.stuck_scan_once().await.unwrap(), 1);

        let failed = f.store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("internal error while processing"));
        assert_eq!(f.ledger.balance("u1").await.unwrap(), 9);
    }

    #[tokio::test]
    async fn retry_scan_promotes_due_jobs() {
        let f = fixture();
        let due_at = f.clock.now();
        let job = insert_job(&f, |job| {
            job.retry_count = 1;
            job.next_retry_at = Some(due_at);
        })
        .await;
        insert_job(&f, |job| {
            job.retry_count = 1;
            job.next_retry_at = Some(due_at + chrono::Duration::minutes(10));
        })
        .await;

        assert_eq!(f.scanners.retry_scan_once().await.unwrap(), 1);
        assert_eq!(f.queue.size().await, 1);
        let entry = f.queue.dequeue().await.unwrap().unwrap();
        assert_eq!(entry.job_id, job.id);

        let unlocked = f.store.find_by_id(&job.id).await.unwrap().unwrap();
        assert!(unlocked.locked_by.is_none());
    }

    #[tokio::test]
    async fn retry_scan_recovers_orphaned_admissions() {
        let f = fixture();
        let job = insert_job(&f, |_| {}).await;

        // Fresh rows are left alone for the grace period.
        assert_eq!(f.scanners.retry_scan_once().await.unwrap(), 0);

        f.clock.advance(Duration::from_secs(6 * 60));
        assert_eq!(f.scanners.retry_scan_once().await.unwrap(), 1);
        assert_eq!(
            f.queue.dequeue().await.unwrap().unwrap().job_id,
            job.id
        );
    }

    #[tokio::test]
    async fn failed_scan_revives_jobs_with_remaining_budget() {
        let f = fixture();
        let job = insert_job(&f, |job| {
            job.status = JobStatus::Failed;
            job.retry_count = 1;
        })
        .await;
        insert_job(&f, |job| {
            job.status = JobStatus::Failed;
            job.retry_count = 3;
        })
        .await;

        assert_eq!(f.scanners.failed_scan_once().await.unwrap(), 1);

        let revived = f.store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(revived.status, JobStatus::Queued);
        assert_eq!(revived.retry_count, 2);
        assert_eq!(
            revived.next_retry_at,
            Some(f.clock.now() + chrono::Duration::seconds(60))
        );
        assert_eq!(f.queue.delayed_len(), 1);
    }

    #[tokio::test]
    async fn scanners_respect_the_row_lock() {
        let f = fixture();
        let job = insert_job(&f, |job| {
            job.retry_count = 1;
            job.next_retry_at = Some(f.clock.now());
        })
        .await;
        // A live worker holds the row.
        f.store
            .try_lock(&job.id, "w1", Duration::from_secs(1800))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(f.scanners.retry_scan_once().await.unwrap(), 0);
        assert_eq!(f.queue.size().await, 0);
    }
}
