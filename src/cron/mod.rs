// src/cron/mod.rs
pub mod cron_parser;
pub mod defaults;
pub mod scheduler;

pub use cron_parser::CronParser;
pub use defaults::default_schedules;
pub use scheduler::{JobScheduler, ScheduledJobDefinition};
