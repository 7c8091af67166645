// src/runner.rs
//! Worker pool: `concurrency` poll loops plus one stale-job reclaimer.
//!
//! Each dequeued job runs under a per-job distributed lock, so the same job
//! never runs on two workers at once while the lock's TTL holds. Losing the
//! lock race is normal: the loser just goes back to polling.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::FutureExt;
use nanoid::nanoid;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::context::JobContext;
use crate::error::{PantryError, Result};
use crate::job::{Job, JobType};
use crate::lock::{new_lock_token, DistributedLock};
use crate::queue::Queue;
use crate::registry::HandlerRegistry;
use crate::utils::time::instant_after;

/// What happened to a job handed to [`WorkerProcessor::process_job_with_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    /// The handler (or routing) failed; the job went through `Queue::fail`.
    Failed(String),
    /// Another worker owns the job.
    LockNotAcquired,
    /// A lock or store call failed; the stale-job reclaimer will pick the job up.
    Aborted(String),
}

pub struct WorkerProcessor {
    shared: Arc<Shared>,
    state: Mutex<Option<RunState>>,
}

struct RunState {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    id: String,
    queue: Arc<dyn Queue>,
    lock: Arc<dyn DistributedLock>,
    handlers: RwLock<HandlerRegistry>,
    config: WorkerConfig,
}

impl WorkerProcessor {
    pub fn new(queue: Arc<dyn Queue>, lock: Arc<dyn DistributedLock>, config: WorkerConfig) -> Self {
        let id = format!("worker_{}_{}", std::process::id(), nanoid!(6));
        Self {
            shared: Arc::new(Shared {
                id,
                queue,
                lock,
                handlers: RwLock::new(HandlerRegistry::new()),
                config,
            }),
            state: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Register before [`WorkerProcessor::start`]. A second registration for
    /// the same type replaces the first.
    pub fn register_handler<F, Fut>(&self, job_type: impl Into<JobType>, handler: F)
    where
        F: Fn(JobContext, Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let job_type = job_type.into();
        debug!(job_type = %job_type, "Registering handler");
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(job_type, handler);
    }

    pub fn handler_types(&self) -> Vec<JobType> {
        self.shared
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .job_types()
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.is_some())
            .unwrap_or(false)
    }

    /// Spawns the workers and the cleanup task. They stop when `ctx` is
    /// cancelled or [`WorkerProcessor::stop`] is called.
    pub fn start(&self, ctx: &CancellationToken) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PantryError::Internal("worker state poisoned".into()))?;
        if state.is_some() {
            return Err(PantryError::conflict("worker processor is already running"));
        }

        let cancel = ctx.child_token();
        let concurrency = self.shared.config.concurrency;
        let mut tasks = Vec::with_capacity(concurrency + 1);
        for worker in 0..concurrency {
            let shared = self.shared.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                shared.worker_loop(worker, cancel).await;
            }));
        }
        let shared = self.shared.clone();
        let cleanup_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            shared.cleanup_loop(cleanup_cancel).await;
        }));

        *state = Some(RunState { cancel, tasks });
        info!(
            processor = %self.shared.id,
            concurrency,
            handlers = ?self.handler_types(),
            "Worker Pool Started"
        );
        Ok(())
    }

    /// Signals shutdown and waits for every worker to finish its current job.
    /// There is no upper bound on the wait; wrap it in a timeout if needed.
    pub async fn stop(&self) -> Result<()> {
        let run = self
            .state
            .lock()
            .map_err(|_| PantryError::Internal("worker state poisoned".into()))?
            .take()
            .ok_or_else(|| PantryError::conflict("worker processor is not running"))?;

        info!(processor = %self.shared.id, "Stopping worker pool");
        run.cancel.cancel();
        for task in run.tasks {
            if let Err(e) = task.await {
                error!("Worker task ended abnormally: {}", e);
            }
        }
        info!(processor = %self.shared.id, "Worker pool stopped");
        Ok(())
    }

    /// Runs one already-dequeued job: lock, dispatch, resolve, unlock.
    pub async fn process_job_with_lock(&self, job: Job) -> ProcessOutcome {
        let cancel = self
            .state
            .lock()
            .ok()
            .and_then(|state| state.as_ref().map(|run| run.cancel.clone()))
            .unwrap_or_default();
        self.shared.process_job_with_lock(job, &cancel).await
    }
}

impl Drop for WorkerProcessor {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(run) = state.take() {
                run.cancel.cancel();
            }
        }
    }
}

impl Shared {
    async fn worker_loop(&self, worker: usize, cancel: CancellationToken) {
        debug!(processor = %self.id, worker, "Worker started");

        // A dequeue in flight is never cancelled: dropping it could lose a
        // job that was already popped. The poll timeout bounds shutdown.
        while !cancel.is_cancelled() {
            match self.queue.dequeue(self.config.poll_timeout).await {
                Ok(Some(job)) => {
                    let outcome = self.process_job_with_lock(job, &cancel).await;
                    debug!(worker, ?outcome, "Job processed");
                }
                Ok(None) => {}
                Err(e) => {
                    error!(processor = %self.id, worker, "Failed to dequeue job: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        debug!(processor = %self.id, worker, "Worker stopped");
    }

    async fn cleanup_loop(&self, cancel: CancellationToken) {
        let interval = self.config.cleanup_interval;

        loop {
            let next_run = instant_after(Instant::now(), interval);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_until(next_run) => {
                    match self.queue.cleanup_stale_jobs(self.config.stale_threshold).await {
                        Ok(0) => debug!("No stale jobs"),
                        Ok(reclaimed) => info!(reclaimed, "Reclaimed stale jobs"),
                        Err(e) => error!("Failed to clean up stale jobs: {}", e),
                    }
                }
            }
        }
    }

    async fn process_job_with_lock(&self, job: Job, cancel: &CancellationToken) -> ProcessOutcome {
        let lock_key = format!("{}{}", self.config.lock_prefix, job.id);
        let token = new_lock_token(&self.id);

        match self.lock.acquire(&lock_key, &token, self.config.lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job.id, "Job locked by another worker, skipping");
                return ProcessOutcome::LockNotAcquired;
            }
            Err(e) => {
                error!(job_id = %job.id, "Failed to acquire job lock: {}", e);
                return ProcessOutcome::Aborted(e.to_string());
            }
        }

        let job_id = job.id.clone();
        let outcome = self.execute(job, cancel).await;

        match self.lock.release(&lock_key, &token).await {
            Ok(true) => {}
            Ok(false) => warn!(
                job_id = %job_id,
                "Job lock expired before release; another worker may have run this job"
            ),
            Err(e) => warn!(job_id = %job_id, "Failed to release job lock: {}", e),
        }

        outcome
    }

    async fn execute(&self, job: Job, cancel: &CancellationToken) -> ProcessOutcome {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job.job_type);

        let Some(handler) = handler else {
            let message = format!("no handler registered for job type {}", job.job_type);
            warn!(job_id = %job.id, "{}", message);
            let resolved = if self.config.dead_letter_unroutable {
                self.queue.fail_permanently(&job, &message).await
            } else {
                self.queue.fail(&job, &message).await
            };
            return match resolved {
                Ok(_) => ProcessOutcome::Failed(message),
                Err(e) => {
                    error!(job_id = %job.id, "Failed to record job failure: {}", e);
                    ProcessOutcome::Aborted(e.to_string())
                }
            };
        };

        let timeout = self.config.handler_timeout;
        let job_token = cancel.child_token();
        let ctx = JobContext {
            cancellation_token: job_token.clone(),
            job_id: job.id.clone(),
            attempt: job.attempts + 1,
            deadline: instant_after(Instant::now(), timeout),
        };

        info!(job_id = %job.id, job_type = %job.job_type, attempt = ctx.attempt, "Running job");
        let run = AssertUnwindSafe(handler(ctx, job.clone())).catch_unwind();
        tokio::pin!(run);

        // Past the deadline the handler is asked to stop, then awaited anyway.
        let first = tokio::time::timeout(timeout, &mut run).await;
        let result = match first {
            Ok(result) => result,
            Err(_) => {
                warn!(job_id = %job.id, ?timeout, "Handler overran its timeout, cancelling");
                job_token.cancel();
                run.await
            }
        };
        let result = result.unwrap_or_else(|panic| {
            Err(anyhow::anyhow!("handler panicked: {}", panic_message(panic.as_ref())))
        });

        match result {
            Ok(()) => match self.queue.complete(&job).await {
                Ok(()) => {
                    info!(job_id = %job.id, "Job completed");
                    ProcessOutcome::Completed
                }
                Err(e) => {
                    error!(job_id = %job.id, "Failed to mark job completed: {}", e);
                    ProcessOutcome::Aborted(e.to_string())
                }
            },
            Err(err) => {
                let message = format!("{err:#}");
                match self.queue.fail(&job, &message).await {
                    Ok(_) => ProcessOutcome::Failed(message),
                    Err(e) => {
                        error!(job_id = %job.id, "Failed to record job failure: {}", e);
                        ProcessOutcome::Aborted(e.to_string())
                    }
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
