use std::time::Duration;

// ---------------------------------------------------------
// Jobs
// ---------------------------------------------------------
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_LIST_LIMIT: usize = 10;

// ---------------------------------------------------------
// Redis keys
// ---------------------------------------------------------
pub const DEFAULT_QUEUE_NAME: &str = "pantry:jobs";

// Suffixes appended to the queue name
pub const PROCESSING_SUFFIX: &str = "processing"; // ZSET score=started_at, member=id
pub const SCHEDULED_SUFFIX: &str = "scheduled"; // ZSET score=due ts, member=id
pub const DEAD_LETTER_SUFFIX: &str = "dead_letter"; // ZSET score=failed ts, member=id
pub const RECORDS_SUFFIX: &str = "records"; // HASH id -> json(job)

// Lock prefixes
pub const JOB_LOCK_PREFIX: &str = "job_lock:";
pub const SCHEDULER_LOCK_PREFIX: &str = "scheduler_lock:";
pub const SCHEDULED_JOB_LOCK_PREFIX: &str = "scheduled_job_";

// ---------------------------------------------------------
// Worker pool
// ---------------------------------------------------------
pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

// ---------------------------------------------------------
// Scheduler
// ---------------------------------------------------------
pub const DEFAULT_SCHEDULER_LOCK_TTL: Duration = Duration::from_secs(5 * 60);
pub const SCHEDULED_JOB_PRIORITY: i32 = 5;
pub const SCHEDULED_JOB_MAX_ATTEMPTS: u32 = 3;
pub const SCHEDULED_JOB_RETRY_DELAY: Duration = Duration::from_secs(60);
// Upper bound on a coordinator sleep with nothing scheduled
pub const SCHEDULER_IDLE_WAIT: Duration = Duration::from_secs(60);
