use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

use crate::error::StoreError;
use crate::store::JobStore;
use crate::types::{Job, JobStats, JobStatus};

/// Job store backed by a PostgreSQL table.
///
/// All queries use the runtime API so the crate builds without a database;
/// the schema lives in the workspace `migrations/` directory.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(StoreError::Connection)?;
        Ok(Self { pool })
    }

    fn query_error(command: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
        move |error| StoreError::Query {
            command: command.to_owned(),
            error,
        }
    }
}

const ALL_COLUMNS: &str = r#"
id, user_id, api_key_id, kind, request, status,
result_url, result_metadata, error_message, last_failure_reason,
retry_count, max_retries, is_retryable, retry_type, next_retry_at,
locked_by, locked_at, webhook_url, webhook_sent,
created_at, updated_at, started_at, completed_at, processing_time_ms
"#;

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let query = format!(
            r#"
INSERT INTO snap_jobs ({ALL_COLUMNS})
VALUES
    ($1, $2, $3, $4, $5, $6,
     $7, $8, $9, $10,
     $11, $12, $13, $14, $15,
     $16, $17, $18, $19,
     $20, NOW(), $21, $22, $23)
            "#
        );
        sqlx::query(&query)
            .bind(&job.id)
            .bind(&job.user_id)
            .bind(&job.api_key_id)
            .bind(job.kind)
            .bind(&job.request)
            .bind(job.status)
            .bind(&job.result_url)
            .bind(&job.result_metadata)
            .bind(&job.error_message)
            .bind(&job.last_failure_reason)
            .bind(job.retry_count)
            .bind(job.max_retries)
            .bind(job.is_retryable)
            .bind(job.retry_type)
            .bind(job.next_retry_at)
            .bind(&job.locked_by)
            .bind(job.locked_at)
            .bind(&job.webhook_url)
            .bind(job.webhook_sent)
            .bind(job.created_at)
            .bind(job.started_at)
            .bind(job.completed_at)
            .bind(job.processing_time_ms)
            .execute(&self.pool)
            .await
            .map_err(Self::query_error("INSERT"))?;
        Ok(())
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
UPDATE snap_jobs
SET
    status = $2,
    result_url = $3,
    result_metadata = $4,
    error_message = $5,
    last_failure_reason = $6,
    retry_count = $7,
    max_retries = $8,
    is_retryable = $9,
    retry_type = $10,
    next_retry_at = $11,
    locked_by = $12,
    locked_at = $13,
    webhook_sent = $14,
    started_at = $15,
    completed_at = $16,
    processing_time_ms = $17,
    updated_at = NOW()
WHERE id = $1
            "#,
        )
        .bind(&job.id)
        .bind(job.status)
        .bind(&job.result_url)
        .bind(&job.result_metadata)
        .bind(&job.error_message)
        .bind(&job.last_failure_reason)
        .bind(job.retry_count)
        .bind(job.max_retries)
        .bind(job.is_retryable)
        .bind(job.retry_type)
        .bind(job.next_retry_at)
        .bind(&job.locked_by)
        .bind(job.locked_at)
        .bind(job.webhook_sent)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.processing_time_ms)
        .execute(&self.pool)
        .await
        .map_err(Self::query_error("UPDATE"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RowVanished(job.id.clone()));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {ALL_COLUMNS} FROM snap_jobs WHERE id = $1");
        sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::query_error("SELECT"))
    }

    async fn find_by_id_and_user(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<Option<Job>, StoreError> {
        let query =
            format!("SELECT {ALL_COLUMNS} FROM snap_jobs WHERE id = $1 AND user_id = $2");
        sqlx::query_as(&query)
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::query_error("SELECT"))
    }

    async fn find_by_user(
        &self,
        user_id: &str,
        page: u32,
        limit: u32,
        status: Option<JobStatus>,
    ) -> Result<(Vec<Job>, u64), StoreError> {
        let offset = i64::from(page) * i64::from(limit);

        let (jobs, total): (Vec<Job>, i64) = match status {
            Some(status) => {
                let query = format!(
                    r#"
SELECT {ALL_COLUMNS} FROM snap_jobs
WHERE user_id = $1 AND status = $2
ORDER BY created_at DESC
LIMIT $3 OFFSET $4
                    "#
                );
                let jobs = sqlx::query_as(&query)
                    .bind(user_id)
                    .bind(status)
                    .bind(i64::from(limit))
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(Self::query_error("SELECT"))?;
                let total = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM snap_jobs WHERE user_id = $1 AND status = $2",
                )
                .bind(user_id)
                .bind(status)
                .fetch_one(&self.pool)
                .await
                .map_err(Self::query_error("SELECT"))?;
                (jobs, total)
            }
            None => {
                let query = format!(
                    r#"
SELECT {ALL_COLUMNS} FROM snap_jobs
WHERE user_id = $1
ORDER BY created_at DESC
LIMIT $2 OFFSET $3
                    "#
                );
                let jobs = sqlx::query_as(&query)
                    .bind(user_id)
                    .bind(i64::from(limit))
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(Self::query_error("SELECT"))?;
                let total =
                    sqlx::query_scalar("SELECT COUNT(*) FROM snap_jobs WHERE user_id = $1")
                        .bind(user_id)
                        .fetch_one(&self.pool)
                        .await
                        .map_err(Self::query_error("SELECT"))?;
                (jobs, total)
            }
        };

        Ok((jobs, total as u64))
    }

    async fn find_by_ids(&self, ids: &[String], user_id: &str) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            "SELECT {ALL_COLUMNS} FROM snap_jobs WHERE id = ANY($1) AND user_id = $2"
        );
        sqlx::query_as(&query)
            .bind(ids)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Self::query_error("SELECT"))
    }

    async fn find_pending(&self) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            r#"
SELECT {ALL_COLUMNS} FROM snap_jobs
WHERE status = 'queued'::snap_job_status
ORDER BY updated_at ASC
            "#
        );
        sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(Self::query_error("SELECT"))
    }

    async fn try_lock(
        &self,
        id: &str,
        worker_id: &str,
        stale_after: Duration,
    ) -> Result<Option<Job>, StoreError> {
        // The lock-if-free-or-stale condition and the lock write happen in a
        // single statement, so exactly one contender wins.
        let stale_cutoff =
            Utc::now() - chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
        let query = format!(
            r#"
UPDATE snap_jobs
SET locked_by = $2, locked_at = NOW(), updated_at = NOW()
WHERE id = $1 AND (locked_by IS NULL OR locked_at < $3)
RETURNING {ALL_COLUMNS}
            "#
        );
        sqlx::query_as(&query)
            .bind(id)
            .bind(worker_id)
            .bind(stale_cutoff)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::query_error("UPDATE"))
    }

    async fn find_stuck(
        &self,
        stuck_after: Duration,
        limit: u32,
    ) -> Result<Vec<Job>, StoreError> {
        let stuck_after = chrono::Duration::from_std(stuck_after).unwrap_or(chrono::Duration::MAX);
        let updated_cutoff = Utc::now() - stuck_after;
        let lock_cutoff = updated_cutoff - chrono::Duration::minutes(5);
        let query = format!(
            r#"
SELECT {ALL_COLUMNS} FROM snap_jobs
WHERE
    status = 'processing'::snap_job_status
    AND updated_at < $1
    AND (locked_at IS NULL OR locked_at < $2)
ORDER BY updated_at ASC
LIMIT $3
            "#
        );
        sqlx::query_as(&query)
            .bind(updated_cutoff)
            .bind(lock_cutoff)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(Self::query_error("SELECT"))
    }

    async fn find_ready_for_retry(&self, limit: u32) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            r#"
SELECT {ALL_COLUMNS} FROM snap_jobs
WHERE
    status = 'queued'::snap_job_status
    AND is_retryable
    AND locked_by IS NULL
    AND next_retry_at IS NOT NULL
    AND next_retry_at <= NOW()
ORDER BY updated_at ASC
LIMIT $1
            "#
        );
        sqlx::query_as(&query)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(Self::query_error("SELECT"))
    }

    async fn find_orphaned(&self, grace: Duration, limit: u32) -> Result<Vec<Job>, StoreError> {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
        let query = format!(
            r#"
SELECT {ALL_COLUMNS} FROM snap_jobs
WHERE
    status = 'queued'::snap_job_status
    AND next_retry_at IS NULL
    AND locked_by IS NULL
    AND updated_at < $1
ORDER BY updated_at ASC
LIMIT $2
            "#
        );
        sqlx::query_as(&query)
            .bind(cutoff)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(Self::query_error("SELECT"))
    }

    async fn find_failed_retryable(&self, limit: u32) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            r#"
SELECT {ALL_COLUMNS} FROM snap_jobs
WHERE
    status = 'failed'::snap_job_status
    AND is_retryable
    AND retry_count < max_retries
    AND locked_by IS NULL
ORDER BY updated_at ASC
LIMIT $1
            "#
        );
        sqlx::query_as(&query)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(Self::query_error("SELECT"))
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let mut stats = JobStats::default();

        let status_rows =
            sqlx::query("SELECT status::text AS status, COUNT(*) AS count FROM snap_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(Self::query_error("SELECT"))?;
        for row in status_rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            stats.total += count as u64;
            stats.by_status.insert(status, count as u64);
        }

        let format_rows = sqlx::query(
            "SELECT request->>'format' AS format, COUNT(*) AS count FROM snap_jobs GROUP BY 1",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Self::query_error("SELECT"))?;
        for row in format_rows {
            let format: Option<String> = row.get("format");
            let count: i64 = row.get("count");
            if let Some(format) = format {
                stats.by_format.insert(format, count as u64);
            }
        }

        let completed = stats.by_status.get("completed").copied().unwrap_or(0);
        let failed = stats.by_status.get("failed").copied().unwrap_or(0);
        if completed + failed > 0 {
            stats.success_rate = completed as f64 / (completed + failed) as f64;
        }
        Ok(stats)
    }
}
