use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::JobStore;
use crate::types::{Job, JobStats, JobStatus};

/// In-memory job store. Backs tests and single-node deployments that don't
/// need durability; implements the same locking contract as the Postgres
/// store.
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
    clock: Arc<dyn Clock>,
}

impl MemoryJobStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn collect_sorted<F>(&self, limit: u32, predicate: F) -> Vec<Job>
    where
        F: Fn(&Job, DateTime<Utc>) -> bool,
    {
        let now = self.clock.now();
        let jobs = self.jobs.lock().unwrap();
        let mut matched: Vec<Job> = jobs
            .values()
            .filter(|job| predicate(job, now))
            .cloned()
            .collect();
        matched.sort_by_key(|job| job.updated_at);
        matched.truncate(limit as usize);
        matched
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        if !jobs.contains_key(&job.id) {
            return Err(StoreError::RowVanished(job.id.clone()));
        }
        let mut updated = job.clone();
        updated.updated_at = self.clock.now();
        jobs.insert(job.id.clone(), updated);
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().unwrap().get(id).cloned())
    }

    async fn find_by_id_and_user(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<Option<Job>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .get(id)
            .filter(|job| job.user_id == user_id)
            .cloned())
    }

    async fn find_by_user(
        &self,
        user_id: &str,
        page: u32,
        limit: u32,
        status: Option<JobStatus>,
    ) -> Result<(Vec<Job>, u64), StoreError> {
        let jobs = self.jobs.lock().unwrap();
        let mut matched: Vec<Job> = jobs
            .values()
            .filter(|job| job.user_id == user_id)
            .filter(|job| status.map_or(true, |wanted| job.status == wanted))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matched.len() as u64;
        let offset = (page as usize).saturating_mul(limit as usize);
        let pageful = matched
            .into_iter()
            .skip(offset)
            .take(limit as usize)
            .collect();
        Ok((pageful, total))
    }

    async fn find_by_ids(&self, ids: &[String], user_id: &str) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| jobs.get(id))
            .filter(|job| job.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn find_pending(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.collect_sorted(u32::MAX, |job, _| job.status == JobStatus::Queued))
    }

    async fn try_lock(
        &self,
        id: &str,
        worker_id: &str,
        stale_after: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(id) else {
            return Ok(None);
        };
        if job.locked_by.is_some() && !job.lock_is_stale(now, stale_after) {
            return Ok(None);
        }
        job.locked_by = Some(worker_id.to_string());
        job.locked_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn find_stuck(
        &self,
        stuck_after: Duration,
        limit: u32,
    ) -> Result<Vec<Job>, StoreError> {
        let stuck_after = chrono::Duration::from_std(stuck_after).unwrap_or(chrono::Duration::MAX);
        let lock_margin = stuck_after + chrono::Duration::minutes(5);
        Ok(self.collect_sorted(limit, |job, now| {
            job.status == JobStatus::Processing
                && job.updated_at < now - stuck_after
                && match job.locked_at {
                    None => true,
                    Some(locked_at) => locked_at < now - lock_margin,
                }
        }))
    }

    async fn find_ready_for_retry(&self, limit: u32) -> Result<Vec<Job>, StoreError> {
        Ok(self.collect_sorted(limit, |job, now| {
            job.status == JobStatus::Queued
                && job.is_retryable
                && job.locked_by.is_none()
                && job.next_retry_at.is_some_and(|at| at <= now)
        }))
    }

    async fn find_orphaned(&self, grace: Duration, limit: u32) -> Result<Vec<Job>, StoreError> {
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
        Ok(self.collect_sorted(limit, |job, now| {
            job.status == JobStatus::Queued
                && job.next_retry_at.is_none()
                && job.locked_by.is_none()
                && job.updated_at < now - grace
        }))
    }

    async fn find_failed_retryable(&self, limit: u32) -> Result<Vec<Job>, StoreError> {
        Ok(self.collect_sorted(limit, |job, _| {
            job.status == JobStatus::Failed
                && job.is_retryable
                && job.retry_count < job.max_retries
                && job.locked_by.is_none()
        }))
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let jobs = self.jobs.lock().unwrap();
        let mut stats = JobStats {
            total: jobs.len() as u64,
            ..Default::default()
        };
        for job in jobs.values() {
            *stats.by_status.entry(job.status.to_string()).or_default() += 1;
            *stats
                .by_format
                .entry(job.request.format.to_string())
                .or_default() += 1;
        }
        let completed = stats.by_status.get("completed").copied().unwrap_or(0);
        let failed = stats.by_status.get("failed").copied().unwrap_or(0);
        if completed + failed > 0 {
            stats.success_rate = completed as f64 / (completed + failed) as f64;
        }
        Ok(stats)
    }
}
