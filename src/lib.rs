// src/lib.rs
//! Background work for the price-comparison backend: a Redis-backed priority
//! queue with delayed retries and a dead-letter set, a lock-guarded worker
//! pool, and a cron scheduler that enqueues recurring jobs.

pub mod config;
pub mod context;
pub mod cron;
pub mod error;
pub mod job;
pub mod lock;
pub mod queue;
pub mod rdconfig;
pub mod registry;
pub mod routes;
pub mod runner;
pub mod services;
pub mod utils;

pub use config::{PantryConfig, QueueConfig, SchedulerConfig, WorkerConfig};
pub use context::JobContext;
pub use cron::{CronParser, JobScheduler, ScheduledJobDefinition};
pub use error::{PantryError, Result};
pub use job::{Job, JobStatus, JobType, Payload};
pub use lock::{DistributedLock, MemoryLock, RedisLock};
pub use queue::{MemoryQueue, Queue, QueueStats, RedisQueue};
pub use runner::{ProcessOutcome, WorkerProcessor};
