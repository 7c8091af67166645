// src/bin/pantry.rs
use anyhow::Result;
use clap::{value_parser, Arg, ArgAction, Command};
use std::process;
use tracing_subscriber::EnvFilter;

mod commands;
use commands::*;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let app = Command::new("pantry")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Pantry - background jobs and schedules for the price-comparison backend")
        .subcommand(
            Command::new("start")
                .about("Start workers and the cron scheduler")
                .arg(Arg::new("concurrency")
                    .short('c')
                    .long("concurrency")
                    .value_name("NUMBER")
                    .help("Number of workers (default: PANTRY_CONCURRENCY or 5)")
                    .value_parser(value_parser!(usize)))
                .arg(Arg::new("shutdown_timeout")
                    .short('t')
                    .long("shutdown-timeout")
                    .value_name("SECONDS")
                    .help("How long to wait for running jobs on Ctrl+C")
                    .value_parser(value_parser!(u64))
                    .default_value("25"))
                .arg(Arg::new("metrics_port")
                    .short('p')
                    .long("metrics-port")
                    .value_name("PORT")
                    .help("Serve /stats and friends on this port")
                    .value_parser(value_parser!(u16)))
                .arg(Arg::new("bind")
                    .long("bind")
                    .value_name("HOST")
                    .help("Address for the metrics server")
                    .default_value("127.0.0.1"))
                .arg(Arg::new("no_schedules")
                    .long("no-schedules")
                    .help("Skip the default recurring schedules")
                    .action(ArgAction::SetTrue))
                .arg(Arg::new("dead_letter_unroutable")
                    .long("dead-letter-unroutable")
                    .help("Dead-letter jobs with no handler instead of retrying them")
                    .action(ArgAction::SetTrue))
        )
        .subcommand(
            Command::new("stats")
                .about("Show queue statistics")
                .arg(Arg::new("json")
                    .long("json")
                    .help("Print raw JSON")
                    .action(ArgAction::SetTrue))
        )
        .subcommand(
            Command::new("enqueue")
                .about("Enqueue a job")
                .arg(Arg::new("job_type")
                    .short('t')
                    .long("type")
                    .value_name("TYPE")
                    .help("Job type, e.g. scrape_flyer")
                    .required(true))
                .arg(Arg::new("payload")
                    .short('p')
                    .long("payload")
                    .value_name("JSON")
                    .help("Job payload as a JSON object")
                    .default_value("{}"))
                .arg(Arg::new("priority")
                    .long("priority")
                    .value_name("NUMBER")
                    .help("Higher runs first")
                    .value_parser(value_parser!(i32))
                    .allow_negative_numbers(true)
                    .default_value("0"))
                .arg(Arg::new("max_attempts")
                    .long("max-attempts")
                    .value_name("NUMBER")
                    .value_parser(value_parser!(u32)))
                .arg(Arg::new("delay")
                    .short('d')
                    .long("delay")
                    .value_name("SECONDS")
                    .help("Delay execution by N seconds")
                    .value_parser(value_parser!(u64)))
        )
        .subcommand(
            Command::new("dead")
                .about("List dead-lettered jobs, most recent first")
                .arg(Arg::new("limit")
                    .short('l')
                    .long("limit")
                    .value_name("NUMBER")
                    .value_parser(value_parser!(usize))
                    .default_value("10"))
        )
        .subcommand(
            Command::new("retry")
                .about("Move a dead-lettered job back to pending")
                .arg(Arg::new("job_id")
                    .help("Job ID")
                    .required(true))
        )
        .subcommand(
            Command::new("cleanup")
                .about("Reclaim jobs stuck in processing")
                .arg(Arg::new("older_than")
                    .long("older-than")
                    .value_name("SECONDS")
                    .help("Stale threshold (default: PANTRY_STALE_THRESHOLD_SECS or 1800)")
                    .value_parser(value_parser!(u64)))
        );

    let matches = app.get_matches();

    match matches.subcommand() {
        Some(("start", sub_matches)) => start_command(sub_matches).await,
        Some(("stats", sub_matches)) => stats_command(sub_matches).await,
        Some(("enqueue", sub_matches)) => enqueue_command(sub_matches).await,
        Some(("dead", sub_matches)) => dead_command(sub_matches).await,
        Some(("retry", sub_matches)) => retry_command(sub_matches).await,
        Some(("cleanup", sub_matches)) => cleanup_command(sub_matches).await,
        _ => {
            println!("No command specified. Use --help for usage information.");
            process::exit(1);
        }
    }
}
