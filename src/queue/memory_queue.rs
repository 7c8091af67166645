// src/queue/memory_queue.rs
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{stale_cutoff, Queue, QueueStats, STALE_JOB_ERROR};
use crate::error::{PantryError, Result};
use crate::job::{Job, JobStatus};
use crate::utils::time::instant_after;

/// In-process [`Queue`] with the same ordering and retry rules as
/// [`super::RedisQueue`]. Meant for tests and single-process setups.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    records: HashMap<String, Job>,
    /// (-priority, id): the smallest entry is served first.
    pending: BTreeSet<(i64, String)>,
    scheduled: HashMap<String, DateTime<Utc>>,
    processing: HashMap<String, DateTime<Utc>>,
    dead_letter: HashMap<String, DateTime<Utc>>,
}

impl State {
    fn push_pending(&mut self, job: Job) {
        self.pending.insert((-i64::from(job.priority), job.id.clone()));
        self.records.insert(job.id.clone(), job);
    }

    fn remove_everywhere(&mut self, id: &str) {
        self.pending.retain(|(_, pending_id)| pending_id != id);
        self.scheduled.remove(id);
        self.processing.remove(id);
        self.dead_letter.remove(id);
    }

    fn promote_due(&mut self, now: DateTime<Utc>) -> usize {
        let due: Vec<String> = self
            .scheduled
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut moved = 0;
        for id in due {
            self.scheduled.remove(&id);
            match self.records.remove(&id) {
                Some(mut job) => {
                    job.status = JobStatus::Pending;
                    job.updated_at = now;
                    self.push_pending(job);
                    moved += 1;
                }
                None => warn!(job_id = %id, "Dropping scheduled entry without a record"),
            }
        }
        moved
    }

    fn pop_pending(&mut self, now: DateTime<Utc>) -> Option<Job> {
        while let Some((_, id)) = self.pending.pop_first() {
            let Some(job) = self.records.get_mut(&id) else {
                warn!(job_id = %id, "Popped pending entry without a record");
                continue;
            };
            job.mark_processing(now);
            self.processing.insert(id, now);
            return Some(job.clone());
        }
        None
    }

    fn next_due(&self) -> Option<DateTime<Utc>> {
        self.scheduled.values().min().copied()
    }

    fn store_failed(&mut self, job: Job, retry_at: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        self.processing.remove(&job.id);
        match retry_at {
            Some(at) => {
                self.scheduled.insert(job.id.clone(), at);
            }
            None => {
                self.dead_letter.insert(job.id.clone(), now);
            }
        }
        self.records.insert(job.id.clone(), job);
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| PantryError::Internal("memory queue poisoned".into()))
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, mut job: Job) -> Result<Job> {
        let now = Utc::now();
        job.apply_defaults(now);
        job.status = JobStatus::Pending;

        {
            let mut state = self.state()?;
            state.remove_everywhere(&job.id);
            match job.scheduled_at.filter(|at| *at > now) {
                Some(at) => {
                    state.scheduled.insert(job.id.clone(), at);
                    state.records.insert(job.id.clone(), job.clone());
                }
                None => state.push_pending(job.clone()),
            }
        }
        debug!(job_id = %job.id, job_type = %job.job_type, "Enqueued job");
        self.notify.notify_waiters();

        Ok(job)
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>> {
        let deadline = instant_after(Instant::now(), timeout);
        loop {
            // Registered before checking, so an enqueue in between still wakes us.
            let notified = self.notify.notified();
            let next_due = {
                let mut state = self.state()?;
                let now = Utc::now();
                state.promote_due(now);
                if let Some(job) = state.pop_pending(now) {
                    return Ok(Some(job));
                }
                state.next_due()
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let mut wait = deadline - now;
            if let Some(due) = next_due {
                let until_due = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                wait = wait.min(until_due.max(Duration::from_millis(1)));
            }
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn complete(&self, job: &Job) -> Result<()> {
        let mut state = self.state()?;
        if !state.processing.contains_key(&job.id) {
            warn!(job_id = %job.id, "Completed job was not tracked as processing");
        }
        // A late completion after a stale reclaim also clears the retry or
        // dead-letter entry the reclaim created.
        state.remove_everywhere(&job.id);
        state.records.remove(&job.id);
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<Job> {
        let now = Utc::now();
        let mut job = job.clone();
        let retry_at = job.record_failure(error, now);
        self.state()?.store_failed(job.clone(), retry_at, now);
        self.notify.notify_waiters();
        Ok(job)
    }

    async fn fail_permanently(&self, job: &Job, error: &str) -> Result<Job> {
        let now = Utc::now();
        let mut job = job.clone();
        job.mark_dead(error, now);

        let mut state = self.state()?;
        state.remove_everywhere(&job.id);
        state.store_failed(job.clone(), None, now);
        Ok(job)
    }

    async fn cleanup_stale_jobs(&self, timeout: Duration) -> Result<usize> {
        let now = Utc::now();
        let cutoff = stale_cutoff(now, timeout);

        let mut state = self.state()?;
        let stale: Vec<String> = state
            .processing
            .iter()
            .filter(|(_, started_at)| **started_at <= cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        let mut reclaimed = 0;
        for id in stale {
            state.processing.remove(&id);
            let Some(mut job) = state.records.remove(&id) else {
                warn!(job_id = %id, "Dropped processing entry without a record");
                continue;
            };
            warn!(job_id = %job.id, started_at = ?job.started_at, "Reclaiming stale job");
            let retry_at = job.record_failure(STALE_JOB_ERROR, now);
            state.store_failed(job, retry_at, now);
            reclaimed += 1;
        }
        drop(state);
        if reclaimed > 0 {
            self.notify.notify_waiters();
        }
        Ok(reclaimed)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state()?;
        Ok(QueueStats {
            pending: state.pending.len() as u64,
            processing: state.processing.len() as u64,
            scheduled: state.scheduled.len() as u64,
            dead_letter: state.dead_letter.len() as u64,
        })
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.state()?.records.get(id).cloned())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<Job>> {
        let state = self.state()?;
        let mut entries: Vec<(&DateTime<Utc>, &String)> =
            state.dead_letter.iter().map(|(id, at)| (at, id)).collect();
        entries.sort_by(|a, b| b.cmp(a));
        Ok(entries
            .into_iter()
            .take(limit)
            .filter_map(|(_, id)| state.records.get(id).cloned())
            .collect())
    }

    async fn retry_dead_letter(&self, id: &str) -> Result<Job> {
        let job = {
            let mut state = self.state()?;
            if state.dead_letter.remove(id).is_none() {
                return Err(PantryError::NotFound(format!("dead-lettered job {id}")));
            }
            let Some(mut job) = state.records.remove(id) else {
                return Err(PantryError::NotFound(format!("job record {id}")));
            };
            job.reset_for_retry(Utc::now());
            state.push_pending(job.clone());
            job
        };
        self.notify.notify_waiters();
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobType, Payload};

    fn job(priority: i32) -> Job {
        Job::new(JobType::ExtractProducts, Payload::new()).with_priority(priority)
    }

    #[tokio::test]
    async fn test_equal_priority_served_in_creation_order() {
        let queue = MemoryQueue::new();
        let first = queue.enqueue(job(3)).await.unwrap();
        let second = queue.enqueue(job(3)).await.unwrap();

        let a = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let b = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(a.id, first.id);
        assert_eq!(b.id, second.id);
    }

    #[tokio::test]
    async fn test_stale_processing_job_is_reclaimed() {
        let queue = MemoryQueue::new();
        queue.enqueue(job(1)).await.unwrap();
        let taken = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();

        // Pretend the worker picked it up 31 minutes ago.
        let started_at = Utc::now() - chrono::Duration::minutes(31);
        {
            let mut state = queue.state().unwrap();
            state.processing.insert(taken.id.clone(), started_at);
            state.records.get_mut(&taken.id).unwrap().started_at = Some(started_at);
        }

        let reclaimed = queue
            .cleanup_stale_jobs(Duration::from_secs(30 * 60))
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);

        let stored = queue.get_job(&taken.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Retrying);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.error.as_deref(), Some(STALE_JOB_ERROR));

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.scheduled, 1);
    }

    #[tokio::test]
    async fn test_fresh_processing_job_is_left_alone() {
        let queue = MemoryQueue::new();
        queue.enqueue(job(1)).await.unwrap();
        queue.dequeue(Duration::ZERO).await.unwrap().unwrap();

        let reclaimed = queue
            .cleanup_stale_jobs(Duration::from_secs(30 * 60))
            .await
            .unwrap();
        assert_eq!(reclaimed, 0);
        assert_eq!(queue.stats().await.unwrap().processing, 1);
    }
}
