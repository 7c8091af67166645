//! Priority + delayed + dead-letter job store.
//!
//! Four tracking structures per queue: `pending` (served highest priority
//! first, ties by job ID), `scheduled` (invisible until due), `processing`
//! (liveness bookkeeping for the stale-job reclaimer) and `dead_letter`
//! (terminal). Removal from any of them is keyed by job ID.

mod memory_queue;
mod redis_queue;

pub use memory_queue::MemoryQueue;
pub use redis_queue::RedisQueue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::{add_duration, Job};

/// Message recorded on jobs reclaimed by [`Queue::cleanup_stale_jobs`].
pub const STALE_JOB_ERROR: &str = "processing timeout";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub scheduled: u64,
    pub dead_letter: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.scheduled + self.dead_letter
    }
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Stores the job as pending, or as scheduled when `scheduled_at` is in
    /// the future. Returns the stored job with its ID and defaults filled in.
    async fn enqueue(&self, job: Job) -> Result<Job>;

    /// Promotes due scheduled jobs, then waits up to `timeout` for the
    /// highest-priority pending job. `Ok(None)` means nothing showed up.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>>;

    /// Resolves a processing job successfully and drops its record.
    async fn complete(&self, job: &Job) -> Result<()>;

    /// Records a failure; the job goes back to scheduled after
    /// `attempts * retry_delay`, or to dead-letter once its attempts run out.
    async fn fail(&self, job: &Job, error: &str) -> Result<Job>;

    /// Dead-letters the job immediately, whatever its attempt count.
    async fn fail_permanently(&self, job: &Job, error: &str) -> Result<Job>;

    /// Fails every processing job that started more than `timeout` ago.
    /// Returns how many were reclaimed.
    async fn cleanup_stale_jobs(&self, timeout: Duration) -> Result<usize>;

    async fn stats(&self) -> Result<QueueStats>;

    async fn get_job(&self, id: &str) -> Result<Option<Job>>;

    /// Most recently failed first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<Job>>;

    /// Moves a dead-lettered job back to pending with a fresh attempt budget.
    async fn retry_dead_letter(&self, id: &str) -> Result<Job>;

    async fn enqueue_in(&self, job: Job, delay: Duration) -> Result<Job> {
        let at = add_duration(Utc::now(), delay);
        self.enqueue(job.scheduled_at(at)).await
    }
}

/// Jobs that started at or before this instant count as stale. A threshold
/// too large to represent means nothing is stale.
fn stale_cutoff(now: DateTime<Utc>, threshold: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(threshold)
        .ok()
        .and_then(|threshold| now.checked_sub_signed(threshold))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_cutoff() {
        let now = Utc::now();
        assert_eq!(
            stale_cutoff(now, Duration::from_secs(30 * 60)),
            now - chrono::Duration::minutes(30)
        );
        assert_eq!(stale_cutoff(now, Duration::ZERO), now);
        assert_eq!(stale_cutoff(now, Duration::from_secs(u64::MAX)), DateTime::<Utc>::MIN_UTC);
    }
}
