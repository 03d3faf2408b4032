pub mod memory;
pub mod pg;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{Job, JobStats, JobStatus};

/// Persistence port for job rows.
///
/// `try_lock` is the concurrency primitive everything else leans on: a job
/// row is only ever mutated by the holder of its lock, and a lock older than
/// the staleness threshold is up for grabs. Scans order by `updated_at`
/// ascending (oldest first); `find_by_user` orders by `created_at`
/// descending.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    /// Persist the full row as read by the caller. A vanished row is an
    /// invariant violation and surfaces as [`StoreError::RowVanished`].
    async fn update(&self, job: &Job) -> Result<(), StoreError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// Access-scoped read: the row only comes back if `user_id` owns it.
    async fn find_by_id_and_user(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<Option<Job>, StoreError>;

    /// Paged listing for one user, newest first, with the unpaged total.
    async fn find_by_user(
        &self,
        user_id: &str,
        page: u32,
        limit: u32,
        status: Option<JobStatus>,
    ) -> Result<(Vec<Job>, u64), StoreError>;

    /// Bulk read for status polling. Ids not owned by `user_id` are silently
    /// dropped.
    async fn find_by_ids(&self, ids: &[String], user_id: &str) -> Result<Vec<Job>, StoreError>;

    /// All queued rows, for crash recovery at boot.
    async fn find_pending(&self) -> Result<Vec<Job>, StoreError>;

    /// Atomically claim the row for `worker_id`. Succeeds only if the row is
    /// unlocked or its current lock is older than `stale_after`; on success
    /// the returned row has the lock fields set.
    async fn try_lock(
        &self,
        id: &str,
        worker_id: &str,
        stale_after: Duration,
    ) -> Result<Option<Job>, StoreError>;

    /// Processing rows whose `updated_at` stopped moving: the worker died or
    /// lost the row. The lock must be absent or old enough (threshold plus a
    /// five minute margin) that no live worker can still hold it.
    async fn find_stuck(&self, stuck_after: Duration, limit: u32)
        -> Result<Vec<Job>, StoreError>;

    /// Queued rows whose retry delay has elapsed and that nobody holds.
    async fn find_ready_for_retry(&self, limit: u32) -> Result<Vec<Job>, StoreError>;

    /// Queued rows with no retry schedule that have sat untouched longer than
    /// `grace`: admission persisted them but the enqueue never happened.
    async fn find_orphaned(&self, grace: Duration, limit: u32) -> Result<Vec<Job>, StoreError>;

    /// Failed rows that still have retry budget: a crash beat the requeue.
    async fn find_failed_retryable(&self, limit: u32) -> Result<Vec<Job>, StoreError>;

    /// Aggregates for the admin surface.
    async fn stats(&self) -> Result<JobStats, StoreError>;
}
