//! The job-execution service: workers, browser pool, recovery scanners,
//! queue promoter, webhook delivery and cleanup, all in one process.

use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{error, info, warn};

use health::HealthRegistry;
use snap_api::credits::PgCreditLedger;
use snap_core::{
    Clock, JobQueue, JobStore, MemoryQueue, PgJobStore, QueuedJob, RetryPolicy, SystemClock,
};
use snap_hooks::{DeliveryCleaner, PgWebhookStore, ReqwestClient, WebhookEngine};
use snap_worker::config::Config;
use snap_worker::metrics::{serve, setup_metrics_routes};
use snap_worker::scanners::{ScannerConfig, Scanners};
use snap_worker::worker::{JobRunner, RunnerConfig, WorkerPool, WorkerPoolConfig};
use snap_worker::{BrowserPool, HttpRendererFactory, LocalDiskStore};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");
    let liveness = HealthRegistry::new("liveness");
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to postgres");
    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .expect("failed to run migrations");

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::from_pool(pool.clone()));
    let queue = Arc::new(MemoryQueue::new(clock.clone(), config.queue_capacity));
    let ledger = Arc::new(PgCreditLedger::from_pool(pool.clone()));
    let hook_store = Arc::new(PgWebhookStore::from_pool(pool.clone()));

    let engine = WebhookEngine::new(
        hook_store.clone(),
        Arc::new(ReqwestClient::new(snap_hooks::types::USER_AGENT)),
        clock.clone(),
        config.webhook_fallback_secret.clone(),
    );

    let browsers = Arc::new(BrowserPool::new(
        Box::new(HttpRendererFactory::new(&config.renderer_url)),
        config.browser_pool_size,
    ));
    let objects = Arc::new(LocalDiskStore::new(
        &config.artifact_dir,
        &config.artifact_base_url,
    ));

    let policy = RetryPolicy::new(
        Duration::from_secs(config.retry_initial_secs),
        2,
        Duration::from_secs(config.retry_max_secs),
        Duration::from_secs(3),
    );
    let runner_config = RunnerConfig {
        attempt_timeout: config.effective_attempt_timeout(),
        checkout_wait: config.checkout_wait.0,
        stuck_after: Duration::from_secs(config.stuck_after_mins * 60),
    };
    let runner = Arc::new(JobRunner::new(
        store.clone(),
        queue.clone(),
        ledger.clone(),
        browsers.clone(),
        objects,
        policy,
        Some(Arc::new(engine.clone())),
        clock.clone(),
        runner_config,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    recover_pending_jobs(store.as_ref(), queue.as_ref(), clock.as_ref()).await;

    let worker_pool = WorkerPool::new(
        runner.clone(),
        queue.clone(),
        clock.clone(),
        WorkerPoolConfig {
            worker_count: config.worker_count,
            poll_interval: config.poll_interval.0,
        },
    );
    let mut handles = worker_pool.spawn(shutdown_rx.clone(), &liveness);

    let scanners = Arc::new(Scanners::new(
        runner,
        store.clone(),
        queue.clone(),
        policy,
        clock.clone(),
        ScannerConfig {
            interval: Duration::from_secs(config.scan_interval_secs),
            batch_limit: config.scan_batch_limit,
            stuck_after: Duration::from_secs(config.stuck_after_mins * 60),
            orphan_grace: Duration::from_secs(config.orphan_grace_secs),
        },
    ));
    handles.extend(scanners.spawn(shutdown_rx.clone(), &liveness));

    // Delayed-queue promoter.
    {
        let queue = queue.clone();
        let handle = liveness.register("promoter", config.promote_interval.0 * 60);
        let mut shutdown = shutdown_rx.clone();
        let interval = config.promote_interval.0;
        handles.push(tokio::spawn(async move {
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
                queue.promote_due();
            }
        }));
    }

    // Webhook retry runner.
    {
        let engine = engine.clone();
        let handle = liveness.register(
            "hook-retries",
            Duration::from_secs(config.hook_retry_interval_secs * 5),
        );
        let mut shutdown = shutdown_rx.clone();
        let interval = Duration::from_secs(config.hook_retry_interval_secs);
        let batch = config.hook_retry_batch;
        handles.push(tokio::spawn(async move {
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
                if let Err(run_error) = engine.run_due_once(batch).await {
                    error!("webhook retry tick failed: {run_error}");
                }
            }
        }));
    }

    // Delivery retention cleanup.
    {
        let cleaner = DeliveryCleaner::new(
            hook_store,
            clock.clone(),
            Duration::from_secs(config.delivered_retention_days * 24 * 3600),
            Duration::from_secs(config.failed_retention_days * 24 * 3600),
            config.cleanup_batch,
        );
        let handle = liveness.register(
            "hook-cleanup",
            Duration::from_secs(config.cleanup_interval_secs * 3),
        );
        let mut shutdown = shutdown_rx.clone();
        let interval = Duration::from_secs(config.cleanup_interval_secs);
        handles.push(tokio::spawn(async move {
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
                if let Err(cleanup_error) = cleaner.cleanup_once().await {
                    error!("delivery cleanup failed: {cleanup_error}");
                }
            }
        }));
    }

    let status_registry = liveness.clone();
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(status_registry.status())));
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::spawn(async move {
        if let Err(serve_error) = serve(router, &bind).await {
            error!("health server exited: {serve_error}");
        }
    });

    info!("snapshot worker service started");
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    info!("shutting down");

    shutdown_tx.send(true).ok();
    let grace = config.effective_attempt_timeout() + Duration::from_secs(5);
    if tokio::time::timeout(grace, futures::future::join_all(handles))
        .await
        .is_err()
    {
        warn!("some tasks did not stop within the grace period");
    }
    browsers.shutdown().await;
}

/// Crash recovery at boot: every QUEUED row goes back into the queue, either
/// immediately or with its remaining retry delay.
async fn recover_pending_jobs(store: &dyn JobStore, queue: &MemoryQueue, clock: &dyn Clock) {
    let pending = match store.find_pending().await {
        Ok(pending) => pending,
        Err(store_error) => {
            error!("failed to scan pending jobs at boot: {store_error}");
            return;
        }
    };

    let now = clock.now();
    let mut recovered = 0usize;
    for job in &pending {
        let result = match job.next_retry_at {
            Some(at) if at > now => {
                let delay = (at - now).to_std().unwrap_or(Duration::ZERO);
                queue.enqueue_delayed(QueuedJob::from(job), delay).await
            }
            _ => queue.enqueue(QueuedJob::from(job)).await,
        };
        match result {
            Ok(()) => recovered += 1,
            Err(queue_error) => {
                warn!(job_id = %job.id, "boot recovery enqueue failed: {queue_error}")
            }
        }
    }
    if recovered > 0 {
        info!(recovered, "re-enqueued pending jobs at boot");
    }
}

async fn index() -> &'static str {
    "snapshot worker"
}
