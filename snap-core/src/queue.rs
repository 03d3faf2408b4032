use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::error::QueueError;
use crate::types::QueuedJob;

/// The dispatch side of the substrate: a FIFO of jobs eligible to run now,
/// plus a time-ordered set of jobs waiting out a retry delay.
///
/// The queue carries identifiers and a small snapshot; the job row in the
/// store stays authoritative. Entries may be delivered more than once after a
/// crash — the store's row lock deduplicates.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError>;

    /// Non-blocking pop. Workers poll with a small backoff when empty.
    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError>;

    async fn size(&self) -> usize;

    /// Park a job until `delay` has elapsed; a promoter task then moves it to
    /// the ready queue.
    async fn enqueue_delayed(&self, job: QueuedJob, delay: Duration) -> Result<(), QueueError>;

    /// Remove a parked job before it is promoted. Returns whether an entry
    /// was actually removed.
    async fn cancel_delayed(&self, job_id: &str) -> bool;
}

struct QueueInner {
    ready: VecDeque<QueuedJob>,
    // Keyed by (due instant, job id) so entries promote in time order and
    // two jobs due at the same instant don't collide.
    delayed: BTreeMap<(DateTime<Utc>, String), QueuedJob>,
}

/// In-process queue. Suits a single-node deployment; the scheduled scanners
/// recover anything it loses across restarts.
pub struct MemoryQueue {
    inner: Mutex<QueueInner>,
    clock: Arc<dyn Clock>,
    capacity: usize,
}

impl MemoryQueue {
    pub fn new(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                ready: VecDeque::new(),
                delayed: BTreeMap::new(),
            }),
            clock,
            capacity,
        }
    }

    /// Move every delayed entry that has come due onto the ready queue.
    /// Called by the promoter task on a short fixed interval.
    pub fn promote_due(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();

        let mut promoted = 0;
        while let Some(entry) = inner.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let job = entry.remove();
            inner.ready.push_back(job);
            promoted += 1;
        }
        promoted
    }

    pub fn delayed_len(&self) -> usize {
        self.inner.lock().unwrap().delayed.len()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.ready.len() >= self.capacity {
            return Err(QueueError::Full(self.capacity));
        }
        inner.ready.push_back(job);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        Ok(self.inner.lock().unwrap().ready.pop_front())
    }

    async fn size(&self) -> usize {
        self.inner.lock().unwrap().ready.len()
    }

    async fn enqueue_delayed(&self, job: QueuedJob, delay: Duration) -> Result<(), QueueError> {
        let due = self.clock.now()
            + chrono::Duration::from_std(delay).map_err(|_| QueueError::Closed)?;
        let mut inner = self.inner.lock().unwrap();
        inner.delayed.insert((due, job.job_id.clone()), job);
        Ok(())
    }

    async fn cancel_delayed(&self, job_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let key = inner
            .delayed
            .iter()
            .find(|(_, job)| job.job_id == job_id)
            .map(|(key, _)| key.clone());
        match key {
            Some(key) => inner.delayed.remove(&key).is_some(),
            None => false,
        }
    }
}
