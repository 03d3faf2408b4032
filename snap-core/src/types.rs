use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

use crate::ids;

/// Output format of a capture. Lives inside the canonical request JSON, so
/// it never needs its own column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Pdf,
    Webp,
}

impl ImageFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Pdf => "application/pdf",
            ImageFormat::Webp => "image/webp",
        }
    }

    pub fn file_extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Pdf => "pdf",
            ImageFormat::Webp => "webp",
        }
    }

    /// Lossy formats accept a quality setting; the rest ignore it.
    pub fn supports_quality(&self) -> bool {
        matches!(self, ImageFormat::Jpeg | ImageFormat::Webp)
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ImageFormat::Png => write!(f, "PNG"),
            ImageFormat::Jpeg => write!(f, "JPEG"),
            ImageFormat::Pdf => write!(f, "PDF"),
            ImageFormat::Webp => write!(f, "WEBP"),
        }
    }
}

/// What kind of work a job carries. Analysis jobs run an AI pass over the
/// captured image and are priced higher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "snap_job_kind", rename_all = "lowercase")]
pub enum JobKind {
    Screenshot,
    Analysis,
}

impl JobKind {
    pub fn credit_cost(&self) -> u32 {
        match self {
            JobKind::Screenshot => 1,
            JobKind::Analysis => 3,
        }
    }
}

/// Enumeration of possible statuses for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "snap_job_status", rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the queue (or for a retry slot) to be picked up by a worker.
    Queued,
    /// Locked by a worker and currently being rendered.
    Processing,
    /// Finished with a stored artifact.
    Completed,
    /// Finished without an artifact, retries exhausted or not applicable.
    Failed,
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            invalid => Err(format!("{invalid} is not a valid job status")),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// How the most recent requeue of a job was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "snap_retry_type", rename_all = "lowercase")]
pub enum RetryType {
    None,
    Automatic,
    Manual,
}

/// Immutable parameters of a capture, stored on the job row as canonical JSON
/// so the store stays schema-agnostic to request evolution. Fields may be
/// added over time but never renamed or removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotRequest {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    #[serde(default)]
    pub full_page: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl ScreenshotRequest {
    pub fn to_canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_canonical_json(encoded: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(encoded)
    }
}

/// What the renderer learned about the page, persisted next to the artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub page_title: Option<String>,
    pub final_url: Option<String>,
    pub byte_size: i64,
    pub load_time_ms: Option<i64>,
}

/// A unit of capture work, tracked end to end by a stable id.
///
/// The row is only ever mutated by the holder of the row lock (see
/// [`crate::JobStore::try_lock`]); readers may observe stale state but never
/// partial writes.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: String,
    pub user_id: String,
    pub api_key_id: String,
    pub kind: JobKind,
    pub request: Json<ScreenshotRequest>,
    pub status: JobStatus,

    pub result_url: Option<String>,
    pub result_metadata: Option<Json<ResultMetadata>>,
    pub error_message: Option<String>,
    pub last_failure_reason: Option<String>,

    pub retry_count: i32,
    pub max_retries: i32,
    pub is_retryable: bool,
    pub retry_type: RetryType,
    pub next_retry_at: Option<DateTime<Utc>>,

    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,

    pub webhook_url: Option<String>,
    pub webhook_sent: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time_ms: Option<i64>,
}

impl Job {
    /// True when the lock on this row is older than `stale_after` and may be
    /// reclaimed by another worker.
    pub fn lock_is_stale(&self, now: DateTime<Utc>, stale_after: std::time::Duration) -> bool {
        match self.locked_at {
            Some(locked_at) => {
                now.signed_duration_since(locked_at)
                    > chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX)
            }
            None => false,
        }
    }

    pub fn clear_lock(&mut self) {
        self.locked_by = None;
        self.locked_at = None;
    }
}

/// The chunk of data needed to admit a job. Consumed on insert so a specific
/// submission can only be persisted once.
pub struct NewJob {
    pub user_id: String,
    pub api_key_id: String,
    pub kind: JobKind,
    pub request: ScreenshotRequest,
    pub webhook_url: Option<String>,
    pub max_retries: i32,
}

impl NewJob {
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: ids::job_id(now),
            user_id: self.user_id,
            api_key_id: self.api_key_id,
            kind: self.kind,
            request: Json(self.request),
            status: JobStatus::Queued,
            result_url: None,
            result_metadata: None,
            error_message: None,
            last_failure_reason: None,
            retry_count: 0,
            max_retries: self.max_retries,
            is_retryable: true,
            retry_type: RetryType::None,
            next_retry_at: None,
            locked_by: None,
            locked_at: None,
            webhook_url: self.webhook_url,
            webhook_sent: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            processing_time_ms: None,
        }
    }
}

/// The snapshot carried through the queue. Deliberately small: the canonical
/// row stays in the store, and the worker re-reads it when taking the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: String,
    pub user_id: String,
    pub kind: JobKind,
}

impl From<&Job> for QueuedJob {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            user_id: job.user_id.clone(),
            kind: job.kind,
        }
    }
}

/// Read-only aggregates for the admin surface. Not on the hot path.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStats {
    pub total: u64,
    pub by_status: std::collections::HashMap<String, u64>,
    pub by_format: std::collections::HashMap<String, u64>,
    pub success_rate: f64,
}
