// src/cron/scheduler.rs
//! Cron-driven enqueuer.
//!
//! One coordinator task sleeps until the earliest `next_run`, then fires every
//! due definition in turn. A firing only enqueues if it wins the definition's
//! distributed lock, so several processes running the same schedules produce
//! one job per tick. `last_run`/`next_run` live in memory only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cron_parser::{next_after, CronParser};
use super::defaults::default_schedules;
use crate::config::SchedulerConfig;
use crate::error::{PantryError, Result};
use crate::job::{Job, JobType, Payload};
use crate::lock::{new_lock_token, DistributedLock};
use crate::queue::Queue;
use crate::utils::constants::{
    SCHEDULED_JOB_LOCK_PREFIX, SCHEDULED_JOB_MAX_ATTEMPTS, SCHEDULED_JOB_PRIORITY,
    SCHEDULED_JOB_RETRY_DELAY, SCHEDULER_IDLE_WAIT,
};

// Scheduler locks must expire before the definition fires again.
const LOCK_EXPIRY_MARGIN: Duration = Duration::from_millis(500);

/// A recurring job template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJobDefinition {
    pub id: String,
    pub name: String,
    /// Cron expression, seconds field first.
    pub schedule: String,
    pub job_type: JobType,
    #[serde(default)]
    pub payload_template: Payload,
    pub enabled: bool,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
}

impl ScheduledJobDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        schedule: impl Into<String>,
        job_type: impl Into<JobType>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            schedule: schedule.into(),
            job_type: job_type.into(),
            payload_template: Payload::new(),
            enabled: true,
            last_run: None,
            next_run: None,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload_template = payload;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// A fresh job for one firing of this definition.
    pub fn build_job(&self) -> Job {
        Job::new(self.job_type.clone(), self.payload_template.clone())
            .with_priority(SCHEDULED_JOB_PRIORITY)
            .with_max_attempts(SCHEDULED_JOB_MAX_ATTEMPTS)
            .with_retry_delay(SCHEDULED_JOB_RETRY_DELAY)
    }
}

struct Entry {
    definition: ScheduledJobDefinition,
    schedule: cron::Schedule,
}

impl Entry {
    fn refresh_next_run(&mut self, now: DateTime<Utc>) {
        self.definition.next_run = if self.definition.enabled {
            next_after(&self.schedule, now)
        } else {
            None
        };
    }
}

pub struct JobScheduler {
    shared: Arc<Shared>,
    state: Mutex<Option<RunState>>,
}

struct RunState {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared {
    id: String,
    queue: Arc<dyn Queue>,
    lock: Arc<dyn DistributedLock>,
    config: SchedulerConfig,
    entries: Mutex<HashMap<String, Entry>>,
    wake: Notify,
}

impl JobScheduler {
    pub fn new(queue: Arc<dyn Queue>, lock: Arc<dyn DistributedLock>, config: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: format!("scheduler_{}_{}", std::process::id(), nanoid!(6)),
                queue,
                lock,
                config,
                entries: Mutex::new(HashMap::new()),
                wake: Notify::new(),
            }),
            state: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.is_some())
            .unwrap_or(false)
    }

    pub fn start(&self, ctx: &CancellationToken) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PantryError::Internal("scheduler state poisoned".into()))?;
        if state.is_some() {
            return Err(PantryError::conflict("scheduler is already running"));
        }

        let cancel = ctx.child_token();
        let shared = self.shared.clone();
        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            shared.run(loop_cancel).await;
        });

        *state = Some(RunState { cancel, task });
        info!(scheduler = %self.shared.id, "Scheduler started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let run = self
            .state
            .lock()
            .map_err(|_| PantryError::Internal("scheduler state poisoned".into()))?
            .take()
            .ok_or_else(|| PantryError::conflict("scheduler is not running"))?;

        run.cancel.cancel();
        if let Err(e) = run.task.await {
            error!("Scheduler task ended abnormally: {}", e);
        }
        info!(scheduler = %self.shared.id, "Scheduler stopped");
        Ok(())
    }

    /// Registers a definition and returns it with `next_run` filled in.
    /// A definition with the same ID is replaced.
    pub fn add_job(&self, definition: ScheduledJobDefinition) -> Result<ScheduledJobDefinition> {
        if !self.is_running() {
            return Err(PantryError::conflict("scheduler is not running"));
        }

        let schedule = CronParser::parse(&definition.schedule)?;
        let mut entry = Entry {
            definition,
            schedule,
        };
        entry.refresh_next_run(Utc::now());
        let snapshot = entry.definition.clone();

        let replaced = self
            .shared
            .entries()?
            .insert(snapshot.id.clone(), entry)
            .is_some();
        if replaced {
            warn!(schedule_id = %snapshot.id, "Replaced existing scheduled job");
        }
        info!(
            schedule_id = %snapshot.id,
            name = %snapshot.name,
            cron = %snapshot.schedule,
            next_run = ?snapshot.next_run,
            "Scheduled job registered"
        );
        self.shared.wake.notify_one();

        Ok(snapshot)
    }

    pub fn remove_job(&self, id: &str) -> Result<ScheduledJobDefinition> {
        let removed = self
            .shared
            .entries()?
            .remove(id)
            .ok_or_else(|| PantryError::NotFound(format!("scheduled job {id}")))?;
        info!(schedule_id = %id, "Scheduled job removed");
        self.shared.wake.notify_one();
        Ok(removed.definition)
    }

    /// Remove-then-add under the given ID.
    pub fn update_job(
        &self,
        id: &str,
        mut definition: ScheduledJobDefinition,
    ) -> Result<ScheduledJobDefinition> {
        match self.remove_job(id) {
            Ok(_) | Err(PantryError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        definition.id = id.to_string();
        self.add_job(definition)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<ScheduledJobDefinition> {
        let snapshot = {
            let mut entries = self.shared.entries()?;
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| PantryError::NotFound(format!("scheduled job {id}")))?;
            entry.definition.enabled = enabled;
            entry.refresh_next_run(Utc::now());
            entry.definition.clone()
        };
        info!(schedule_id = %id, enabled, "Scheduled job toggled");
        self.shared.wake.notify_one();
        Ok(snapshot)
    }

    pub fn get_job(&self, id: &str) -> Option<ScheduledJobDefinition> {
        self.shared
            .entries()
            .ok()?
            .get(id)
            .map(|entry| entry.definition.clone())
    }

    pub fn list_jobs(&self) -> Vec<ScheduledJobDefinition> {
        let mut definitions: Vec<ScheduledJobDefinition> = match self.shared.entries() {
            Ok(entries) => entries.values().map(|e| e.definition.clone()).collect(),
            Err(_) => Vec::new(),
        };
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        definitions
    }

    /// Fires a definition right away, outside its cron schedule. Still goes
    /// through the lock, so it returns `None` if another process holds it.
    pub async fn trigger_now(&self, id: &str) -> Result<Option<Job>> {
        let definition = self
            .get_job(id)
            .ok_or_else(|| PantryError::NotFound(format!("scheduled job {id}")))?;
        self.shared.execute_scheduled_job(&definition).await
    }

    /// Seeds the recurring jobs every deployment runs.
    pub fn setup_default_schedules(&self) -> Result<()> {
        for definition in default_schedules() {
            self.add_job(definition)?;
        }
        Ok(())
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(run) = state.take() {
                run.cancel.cancel();
            }
        }
    }
}

impl Shared {
    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| PantryError::Internal("scheduler entries poisoned".into()))
    }

    async fn run(&self, cancel: CancellationToken) {
        debug!(scheduler = %self.id, "Scheduler loop started");
        loop {
            for definition in self.take_due(Utc::now()) {
                if let Err(e) = self.execute_scheduled_job(&definition).await {
                    error!(schedule_id = %definition.id, "Failed to run scheduled job: {}", e);
                }
            }

            let wait = self.time_until_next(Utc::now());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = sleep(wait) => {}
            }
        }
        debug!(scheduler = %self.id, "Scheduler loop stopped");
    }

    /// Due definitions, with their `next_run` already advanced past `now`.
    fn take_due(&self, now: DateTime<Utc>) -> Vec<ScheduledJobDefinition> {
        let Ok(mut entries) = self.entries() else {
            return Vec::new();
        };
        let mut due = Vec::new();
        for entry in entries.values_mut() {
            let is_due = entry.definition.enabled
                && entry.definition.next_run.map(|at| at <= now).unwrap_or(false);
            if is_due {
                entry.refresh_next_run(now);
                due.push(entry.definition.clone());
            }
        }
        due
    }

    fn time_until_next(&self, now: DateTime<Utc>) -> Duration {
        let next = self.entries().ok().and_then(|entries| {
            entries
                .values()
                .filter(|e| e.definition.enabled)
                .filter_map(|e| e.definition.next_run)
                .min()
        });
        match next {
            Some(at) => (at - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(SCHEDULER_IDLE_WAIT),
            None => SCHEDULER_IDLE_WAIT,
        }
    }

    fn lock_ttl(&self, definition: &ScheduledJobDefinition, now: DateTime<Utc>) -> Duration {
        let ttl = self.config.lock_ttl;
        match definition.next_run.and_then(|at| (at - now).to_std().ok()) {
            Some(until_next) => ttl
                .min(until_next.saturating_sub(LOCK_EXPIRY_MARGIN))
                .max(LOCK_EXPIRY_MARGIN),
            None => ttl,
        }
    }

    async fn execute_scheduled_job(&self, definition: &ScheduledJobDefinition) -> Result<Option<Job>> {
        let now = Utc::now();
        let key = format!(
            "{}{}{}",
            self.config.lock_prefix, SCHEDULED_JOB_LOCK_PREFIX, definition.id
        );
        let token = new_lock_token(&self.id);

        // The lock is left to expire so a late firing elsewhere sees it held.
        let ttl = self.lock_ttl(definition, now);
        if !self.lock.acquire(&key, &token, ttl).await? {
            debug!(schedule_id = %definition.id, "Scheduled job already fired elsewhere");
            return Ok(None);
        }

        let job = self.queue.enqueue(definition.build_job()).await?;
        if let Some(entry) = self.entries()?.get_mut(&definition.id) {
            entry.definition.last_run = Some(now);
        }
        info!(
            schedule_id = %definition.id,
            job_id = %job.id,
            job_type = %job.job_type,
            "Scheduled job enqueued"
        );

        Ok(Some(job))
    }
}
