// src/queue/redis_queue.rs
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{stale_cutoff, Queue, QueueStats, STALE_JOB_ERROR};
use crate::config::QueueConfig;
use crate::error::{PantryError, Result};
use crate::job::{Job, JobStatus};
use crate::rdconfig::open_client;
use crate::utils::constants::{
    DEAD_LETTER_SUFFIX, PROCESSING_SUFFIX, RECORDS_SUFFIX, SCHEDULED_SUFFIX,
};

// KEYS: scheduled, pending, records. ARGV: id, pending score, record json.
// Only the caller whose ZREM wins moves the job, so concurrent promoters
// never duplicate it.
const PROMOTE_SCRIPT: &str = r#"
if redis.call("ZREM", KEYS[1], ARGV[1]) == 1 then
    redis.call("ZADD", KEYS[2], ARGV[2], ARGV[1])
    redis.call("HSET", KEYS[3], ARGV[1], ARGV[3])
    return 1
end
return 0
"#;

/// Queue backed by Redis sorted sets plus a hash of job records keyed by ID.
pub struct RedisQueue {
    client: Client,
    conn: MultiplexedConnection,
    /// Connections reserved for BZPOPMIN, which would stall the shared one.
    blocking: Mutex<Vec<MultiplexedConnection>>,
    pending_key: String,
    processing_key: String,
    scheduled_key: String,
    dead_letter_key: String,
    records_key: String,
    promote: Script,
}

impl RedisQueue {
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        let client = open_client(&config.redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(client, conn, &config.name))
    }

    pub fn new(client: Client, conn: MultiplexedConnection, name: &str) -> Self {
        Self {
            client,
            conn,
            blocking: Mutex::new(Vec::new()),
            pending_key: name.to_string(),
            processing_key: format!("{name}:{PROCESSING_SUFFIX}"),
            scheduled_key: format!("{name}:{SCHEDULED_SUFFIX}"),
            dead_letter_key: format!("{name}:{DEAD_LETTER_SUFFIX}"),
            records_key: format!("{name}:{RECORDS_SUFFIX}"),
            promote: Script::new(PROMOTE_SCRIPT),
        }
    }

    /// Shared connection, handy for building a [`crate::lock::RedisLock`].
    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    async fn load(&self, conn: &mut MultiplexedConnection, id: &str) -> Result<Option<Job>> {
        let raw: Option<String> = conn.hget(&self.records_key, id).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn promote_due(&self, conn: &mut MultiplexedConnection) -> Result<usize> {
        let now = Utc::now();
        let due: Vec<String> = conn
            .zrangebyscore(&self.scheduled_key, "-inf", unix_score(now))
            .await?;

        let mut moved = 0;
        for id in due {
            let Some(mut job) = self.load(conn, &id).await? else {
                warn!(job_id = %id, "Dropping scheduled entry without a record");
                let _: () = conn.zrem(&self.scheduled_key, &id).await?;
                continue;
            };
            job.status = JobStatus::Pending;
            job.updated_at = now;
            let record = serde_json::to_string(&job)?;

            let promoted: i64 = self
                .promote
                .key(&self.scheduled_key)
                .key(&self.pending_key)
                .key(&self.records_key)
                .arg(&id)
                .arg(pending_score(&job))
                .arg(record)
                .invoke_async(conn)
                .await?;
            moved += promoted as usize;
        }

        if moved > 0 {
            debug!("Promoted {} scheduled jobs to pending", moved);
        }
        Ok(moved)
    }

    async fn pop_pending(&self, timeout: Duration) -> Result<Option<String>> {
        if timeout.is_zero() {
            // BZPOPMIN treats 0 as "block forever".
            let mut conn = self.conn.clone();
            let popped: Vec<String> = redis::cmd("ZPOPMIN")
                .arg(&self.pending_key)
                .query_async(&mut conn)
                .await?;
            return Ok(popped.into_iter().next());
        }

        let reused = self.blocking.lock().await.pop();
        let mut conn = match reused {
            Some(conn) => conn,
            None => self.client.get_multiplexed_async_connection().await?,
        };
        let popped: Option<(String, String, f64)> = redis::cmd("BZPOPMIN")
            .arg(&self.pending_key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        self.blocking.lock().await.push(conn);

        Ok(popped.map(|(_, id, _)| id))
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn enqueue(&self, mut job: Job) -> Result<Job> {
        let now = Utc::now();
        job.apply_defaults(now);
        job.status = JobStatus::Pending;
        let record = serde_json::to_string(&job)?;

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().hset(&self.records_key, &job.id, &record).ignore();
        match job.scheduled_at.filter(|at| *at > now) {
            Some(at) => {
                pipe.zadd(&self.scheduled_key, &job.id, unix_score(at)).ignore();
                debug!(job_id = %job.id, job_type = %job.job_type, run_at = %at, "Scheduled job");
            }
            None => {
                pipe.zadd(&self.pending_key, &job.id, pending_score(&job)).ignore();
                debug!(job_id = %job.id, job_type = %job.job_type, priority = job.priority, "Enqueued job");
            }
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(job)
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        self.promote_due(&mut conn).await?;

        let Some(id) = self.pop_pending(timeout).await? else {
            return Ok(None);
        };
        let Some(mut job) = self.load(&mut conn, &id).await? else {
            warn!(job_id = %id, "Popped pending entry without a record");
            return Ok(None);
        };

        let now = Utc::now();
        job.mark_processing(now);
        let record = serde_json::to_string(&job)?;
        redis::pipe()
            .atomic()
            .hset(&self.records_key, &job.id, &record)
            .ignore()
            .zadd(&self.processing_key, &job.id, unix_score(now))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(Some(job))
    }

    async fn complete(&self, job: &Job) -> Result<()> {
        let mut conn = self.conn.clone();
        let (removed, _, _, _, _): (i64, i64, i64, i64, i64) = redis::pipe()
            .atomic()
            .zrem(&self.processing_key, &job.id)
            .zrem(&self.scheduled_key, &job.id)
            .zrem(&self.dead_letter_key, &job.id)
            .zrem(&self.pending_key, &job.id)
            .hdel(&self.records_key, &job.id)
            .query_async(&mut conn)
            .await?;
        if removed == 0 {
            warn!(job_id = %job.id, "Completed job was not tracked as processing");
        }
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<Job> {
        let now = Utc::now();
        let mut job = job.clone();
        let retry_at = job.record_failure(error, now);
        let record = serde_json::to_string(&job)?;

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&self.records_key, &job.id, &record)
            .ignore()
            .zrem(&self.processing_key, &job.id)
            .ignore();
        match retry_at {
            Some(at) => {
                pipe.zadd(&self.scheduled_key, &job.id, unix_score(at)).ignore();
                info!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    retry_at = %at,
                    "Job failed, retry scheduled: {}", error
                );
            }
            None => {
                pipe.zadd(&self.dead_letter_key, &job.id, unix_score(now)).ignore();
                warn!(job_id = %job.id, attempts = job.attempts, "Job moved to dead-letter: {}", error);
            }
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(job)
    }

    async fn fail_permanently(&self, job: &Job, error: &str) -> Result<Job> {
        let now = Utc::now();
        let mut job = job.clone();
        job.mark_dead(error, now);
        let record = serde_json::to_string(&job)?;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset(&self.records_key, &job.id, &record)
            .ignore()
            .zrem(&self.processing_key, &job.id)
            .ignore()
            .zrem(&self.scheduled_key, &job.id)
            .ignore()
            .zrem(&self.pending_key, &job.id)
            .ignore()
            .zadd(&self.dead_letter_key, &job.id, unix_score(now))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        warn!(job_id = %job.id, "Job dead-lettered without retry: {}", error);

        Ok(job)
    }

    async fn cleanup_stale_jobs(&self, timeout: Duration) -> Result<usize> {
        let cutoff = stale_cutoff(Utc::now(), timeout);
        let mut conn = self.conn.clone();
        let stale: Vec<String> = conn
            .zrangebyscore(&self.processing_key, "-inf", unix_score(cutoff))
            .await?;

        let mut reclaimed = 0;
        for id in stale {
            // Claim first so two reclaimers never fail the same job twice.
            let claimed: i64 = conn.zrem(&self.processing_key, &id).await?;
            if claimed == 0 {
                continue;
            }
            match self.load(&mut conn, &id).await? {
                Some(job) => {
                    warn!(job_id = %job.id, started_at = ?job.started_at, "Reclaiming stale job");
                    self.fail(&job, STALE_JOB_ERROR).await?;
                    reclaimed += 1;
                }
                None => warn!(job_id = %id, "Dropped processing entry without a record"),
            }
        }

        Ok(reclaimed)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut conn = self.conn.clone();
        let (pending, processing, scheduled, dead_letter): (u64, u64, u64, u64) = redis::pipe()
            .zcard(&self.pending_key)
            .zcard(&self.processing_key)
            .zcard(&self.scheduled_key)
            .zcard(&self.dead_letter_key)
            .query_async(&mut conn)
            .await?;
        Ok(QueueStats {
            pending,
            processing,
            scheduled,
            dead_letter,
        })
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        self.load(&mut conn, id).await
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrevrange(&self.dead_letter_key, 0, range_stop(limit))
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.load(&mut conn, &id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn retry_dead_letter(&self, id: &str) -> Result<Job> {
        let mut conn = self.conn.clone();
        let claimed: i64 = conn.zrem(&self.dead_letter_key, id).await?;
        if claimed == 0 {
            return Err(PantryError::NotFound(format!("dead-lettered job {id}")));
        }
        let Some(mut job) = self.load(&mut conn, id).await? else {
            return Err(PantryError::NotFound(format!("job record {id}")));
        };

        job.reset_for_retry(Utc::now());
        let record = serde_json::to_string(&job)?;
        redis::pipe()
            .atomic()
            .hset(&self.records_key, &job.id, &record)
            .ignore()
            .zadd(&self.pending_key, &job.id, pending_score(&job))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        info!(job_id = %job.id, "Dead-lettered job requeued");

        Ok(job)
    }
}

/// Lowest score pops first, so higher priority gets the more negative score.
fn pending_score(job: &Job) -> f64 {
    -f64::from(job.priority)
}

/// Inclusive stop index for the first `limit` members; `limit` must be non-zero.
fn range_stop(limit: usize) -> isize {
    isize::try_from(limit).unwrap_or(isize::MAX) - 1
}

fn unix_score(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobType, Payload};

    #[test]
    fn test_higher_priority_scores_lower() {
        let urgent = Job::new(JobType::ScrapeFlyer, Payload::new()).with_priority(10);
        let routine = Job::new(JobType::ScrapeFlyer, Payload::new()).with_priority(1);
        assert!(pending_score(&urgent) < pending_score(&routine));
    }

    #[test]
    fn test_range_stop_never_wraps() {
        assert_eq!(range_stop(1), 0);
        assert_eq!(range_stop(10), 9);
        assert_eq!(range_stop(usize::MAX), isize::MAX - 1);
        assert_eq!(range_stop(1 << 63), isize::MAX - 1);
    }

    #[test]
    fn test_unix_score_keeps_millis() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_250).unwrap();
        assert_eq!(unix_score(at), 1_700_000_000.25);
    }
}
