// src/job.rs
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::utils::constants::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY};

/// Opaque handler input. The queue never looks inside.
pub type Payload = Map<String, Value>;

/// Kind of background work. Handlers are registered per type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobType {
    ScrapeFlyer,
    ExtractProducts,
    UpdatePrices,
    ArchiveData,
    CleanupData,
    Custom(String),
}

impl JobType {
    pub fn as_str(&self) -> &str {
        match self {
            JobType::ScrapeFlyer => "scrape_flyer",
            JobType::ExtractProducts => "extract_products",
            JobType::UpdatePrices => "update_prices",
            JobType::ArchiveData => "archive_data",
            JobType::CleanupData => "cleanup_data",
            JobType::Custom(name) => name,
        }
    }
}

impl From<String> for JobType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "scrape_flyer" => JobType::ScrapeFlyer,
            "extract_products" => JobType::ExtractProducts,
            "update_prices" => JobType::UpdatePrices,
            "archive_data" => JobType::ArchiveData,
            "cleanup_data" => JobType::CleanupData,
            _ => JobType::Custom(value),
        }
    }
}

impl From<&str> for JobType {
    fn from(value: &str) -> Self {
        JobType::from(value.to_string())
    }
}

impl From<JobType> for String {
    fn from(value: JobType) -> Self {
        match value {
            JobType::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Retrying,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A unit of background work and its lifecycle bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: i32,
    #[serde(default)]
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Base unit of the linear retry backoff.
    #[serde(with = "duration_millis", rename = "retry_delay_ms")]
    pub retry_delay: Duration,
}

impl Job {
    pub fn new(job_type: impl Into<JobType>, payload: Payload) -> Self {
        let now = Utc::now();
        Self {
            id: new_job_id(),
            job_type: job_type.into(),
            status: JobStatus::Pending,
            priority: 0,
            payload,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            error: None,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn scheduled_in(self, delay: Duration) -> Self {
        self.scheduled_at(add_duration(Utc::now(), delay))
    }

    /// Fills whatever the caller left blank before the job is stored.
    pub(crate) fn apply_defaults(&mut self, now: DateTime<Utc>) {
        if self.id.is_empty() {
            self.id = new_job_id();
        }
        if self.max_attempts == 0 {
            self.max_attempts = DEFAULT_MAX_ATTEMPTS;
        }
        if self.retry_delay.is_zero() {
            self.retry_delay = DEFAULT_RETRY_DELAY;
        }
        self.updated_at = now;
    }

    /// Linear backoff: the n-th failure waits `n * retry_delay`.
    pub fn backoff(&self) -> Duration {
        self.retry_delay.saturating_mul(self.attempts)
    }

    pub(crate) fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// Records a failure and moves the job to `retrying` or `failed`.
    /// Returns the time the retry becomes due, or `None` when the job is dead.
    pub(crate) fn record_failure(&mut self, error: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.error = Some(error.to_string());
        self.attempts = self.attempts.saturating_add(1);
        self.updated_at = now;

        if self.attempts < self.max_attempts {
            let retry_at = add_duration(now, self.backoff());
            self.status = JobStatus::Retrying;
            self.scheduled_at = Some(retry_at);
            Some(retry_at)
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
            None
        }
    }

    pub(crate) fn mark_dead(&mut self, error: &str, now: DateTime<Utc>) {
        self.error = Some(error.to_string());
        self.attempts = self.attempts.saturating_add(1).min(self.max_attempts.max(1));
        self.status = JobStatus::Failed;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn reset_for_retry(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.attempts = 0;
        self.error = None;
        self.scheduled_at = None;
        self.started_at = None;
        self.completed_at = None;
        self.updated_at = now;
    }
}

/// Saturates at the largest representable instant instead of panicking.
pub(crate) fn add_duration(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| at.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// UUIDv7 so that lexical ID order follows creation order.
pub fn new_job_id() -> String {
    Uuid::now_v7().to_string()
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_type_wire_names() {
        assert_eq!(String::from(JobType::ScrapeFlyer), "scrape_flyer");
        assert_eq!(JobType::from("update_prices"), JobType::UpdatePrices);
        assert_eq!(
            JobType::from("reindex_search"),
            JobType::Custom("reindex_search".to_string())
        );
    }

    #[test]
    fn test_job_serializes_type_tag() {
        let job = Job::new(JobType::ArchiveData, Payload::new());
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], json!("archive_data"));
        assert_eq!(value["status"], json!("pending"));
        assert_eq!(value["retry_delay_ms"], json!(30_000));
    }

    #[test]
    fn test_failure_backoff_is_linear() {
        let now = Utc::now();
        let mut job = Job::new(JobType::UpdatePrices, Payload::new())
            .with_max_attempts(5)
            .with_retry_delay(Duration::from_secs(10));

        for n in 1..=3u32 {
            let retry_at = job.record_failure("boom", now).unwrap();
            assert_eq!(job.attempts, n);
            assert_eq!(job.status, JobStatus::Retrying);
            assert_eq!((retry_at - now).num_seconds(), 10 * n as i64);
        }
    }

    #[test]
    fn test_failure_turns_terminal_at_max_attempts() {
        let now = Utc::now();
        let mut job = Job::new(JobType::UpdatePrices, Payload::new()).with_max_attempts(2);

        assert!(job.record_failure("first", now).is_some());
        assert!(job.record_failure("second", now).is_none());
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, job.max_attempts);
        assert_eq!(job.error.as_deref(), Some("second"));
    }

    #[test]
    fn test_generated_ids_sort_by_creation() {
        let a = new_job_id();
        let b = new_job_id();
        assert!(a < b);
    }
}
