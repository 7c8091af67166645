// src/bin/commands/pantry_cli.rs
use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use anyhow::{anyhow, Context, Result};
use clap::ArgMatches;
use serde_json::Value as JsonValue;
use tokio::signal;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pantry::routes::metrics_route::pantry_metrics_routes;
use pantry::services::metrics_service::AppState;
use pantry::{
    Job, JobContext, JobScheduler, JobType, PantryConfig, Payload, Queue, RedisLock, RedisQueue,
    WorkerProcessor,
};

async fn connect(config: &PantryConfig) -> Result<Arc<RedisQueue>> {
    let queue = RedisQueue::connect(&config.queue)
        .await
        .with_context(|| format!("connecting to {}", config.queue.redis_url))?;
    Ok(Arc::new(queue))
}

/// Stand-in handler for the built-in job types. Deployments embedding the
/// library register their own handlers instead.
async fn log_job(ctx: JobContext, job: Job) -> anyhow::Result<()> {
    info!(
        job_id = %ctx.job_id,
        job_type = %job.job_type,
        attempt = ctx.attempt,
        payload = %JsonValue::Object(job.payload),
        "Handled job"
    );
    Ok(())
}

// Start workers, the scheduler and optionally the metrics server
pub async fn start_command(matches: &ArgMatches) -> Result<()> {
    let mut config = PantryConfig::from_env();
    if let Some(concurrency) = matches.get_one::<usize>("concurrency") {
        config.worker.concurrency = *concurrency;
    }
    if matches.get_flag("dead_letter_unroutable") {
        config.worker.dead_letter_unroutable = true;
    }
    let shutdown_timeout = Duration::from_secs(
        matches.get_one::<u64>("shutdown_timeout").copied().unwrap_or(25),
    );

    let queue = connect(&config).await?;
    let lock = Arc::new(RedisLock::new(queue.connection()));

    let processor = WorkerProcessor::new(queue.clone(), lock.clone(), config.worker.clone());
    for job_type in [
        JobType::ScrapeFlyer,
        JobType::ExtractProducts,
        JobType::UpdatePrices,
        JobType::ArchiveData,
        JobType::CleanupData,
    ] {
        processor.register_handler(job_type, log_job);
    }
    let scheduler = Arc::new(JobScheduler::new(
        queue.clone(),
        lock.clone(),
        config.scheduler.clone(),
    ));

    let shutdown = CancellationToken::new();
    processor.start(&shutdown)?;
    scheduler.start(&shutdown)?;
    if !matches.get_flag("no_schedules") {
        scheduler.setup_default_schedules()?;
    }

    let server = match matches.get_one::<u16>("metrics_port") {
        Some(port) => {
            let host = matches
                .get_one::<String>("bind")
                .cloned()
                .unwrap_or_else(|| "127.0.0.1".to_string());
            let state = web::Data::new(AppState {
                queue: queue.clone(),
                scheduler: Some(scheduler.clone()),
            });
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(state.clone())
                    .configure(pantry_metrics_routes)
            })
            .disable_signals()
            .bind((host.as_str(), *port))?
            .run();
            let handle = server.handle();
            tokio::spawn(server);
            info!("Metrics server listening on {}:{}", host, port);
            Some(handle)
        }
        None => None,
    };

    println!(
        "Pantry {} started on queue {} ({} workers). Press Ctrl+C to stop.",
        processor.id(),
        config.queue.name,
        config.worker.concurrency
    );
    signal::ctrl_c().await?;
    println!("Shutting down...");

    let stop = async {
        scheduler.stop().await?;
        processor.stop().await?;
        anyhow::Ok(())
    };
    match timeout(shutdown_timeout, stop).await {
        Ok(result) => result?,
        Err(_) => warn!(?shutdown_timeout, "Shutdown timed out; running jobs will be reclaimed"),
    }
    shutdown.cancel();

    if let Some(handle) = server {
        handle.stop(true).await;
    }
    println!("Stopped.");
    Ok(())
}

pub async fn stats_command(matches: &ArgMatches) -> Result<()> {
    let config = PantryConfig::from_env();
    let queue = connect(&config).await?;
    let stats = queue.stats().await?;

    if matches.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Queue: {}", config.queue.name);
    println!("  Pending:     {}", stats.pending);
    println!("  Processing:  {}", stats.processing);
    println!("  Scheduled:   {}", stats.scheduled);
    println!("  Dead letter: {}", stats.dead_letter);
    Ok(())
}

pub async fn enqueue_command(matches: &ArgMatches) -> Result<()> {
    let job_type = matches
        .get_one::<String>("job_type")
        .ok_or_else(|| anyhow!("--type is required"))?;
    let raw_payload = matches
        .get_one::<String>("payload")
        .map(String::as_str)
        .unwrap_or("{}");
    let payload: Payload = match serde_json::from_str(raw_payload).context("parsing --payload")? {
        JsonValue::Object(map) => map,
        _ => return Err(anyhow!("--payload must be a JSON object")),
    };

    let mut job = Job::new(job_type.as_str(), payload)
        .with_priority(matches.get_one::<i32>("priority").copied().unwrap_or(0));
    if let Some(max_attempts) = matches.get_one::<u32>("max_attempts") {
        job = job.with_max_attempts(*max_attempts);
    }

    let config = PantryConfig::from_env();
    let queue = connect(&config).await?;
    let job = match matches.get_one::<u64>("delay") {
        Some(secs) => queue.enqueue_in(job, Duration::from_secs(*secs)).await?,
        None => queue.enqueue(job).await?,
    };

    match job.scheduled_at {
        Some(at) => println!("Scheduled job {} ({}) for {}", job.id, job.job_type, at.to_rfc3339()),
        None => println!("Enqueued job {} ({})", job.id, job.job_type),
    }
    Ok(())
}

pub async fn dead_command(matches: &ArgMatches) -> Result<()> {
    let limit = matches.get_one::<usize>("limit").copied().unwrap_or(10);
    let config = PantryConfig::from_env();
    let queue = connect(&config).await?;
    let jobs = queue.dead_letters(limit).await?;

    if jobs.is_empty() {
        println!("No dead-lettered jobs.");
        return Ok(());
    }
    for job in jobs {
        println!(
            "{}  {}  attempts={}/{}  failed_at={}  error={}",
            job.id,
            job.job_type,
            job.attempts,
            job.max_attempts,
            job.completed_at.map(|at| at.to_rfc3339()).unwrap_or_else(|| "-".into()),
            job.error.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

pub async fn retry_command(matches: &ArgMatches) -> Result<()> {
    let job_id = matches
        .get_one::<String>("job_id")
        .ok_or_else(|| anyhow!("job ID is required"))?;
    let config = PantryConfig::from_env();
    let queue = connect(&config).await?;
    let job = queue.retry_dead_letter(job_id).await?;
    println!("Requeued job {} ({})", job.id, job.job_type);
    Ok(())
}

pub async fn cleanup_command(matches: &ArgMatches) -> Result<()> {
    let config = PantryConfig::from_env();
    let threshold = matches
        .get_one::<u64>("older_than")
        .map(|secs| Duration::from_secs(*secs))
        .unwrap_or(config.worker.stale_threshold);
    let queue = connect(&config).await?;
    let reclaimed = queue.cleanup_stale_jobs(threshold).await?;
    println!("Reclaimed {} stale job(s).", reclaimed);
    Ok(())
}
