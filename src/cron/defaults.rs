// src/cron/defaults.rs
use serde_json::json;

use super::scheduler::ScheduledJobDefinition;
use crate::job::{JobType, Payload};

fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Payload::new(),
    }
}

/// Recurring work every deployment runs. All times are UTC.
pub fn default_schedules() -> Vec<ScheduledJobDefinition> {
    vec![
        ScheduledJobDefinition::new(
            "weekly_flyer_scrape",
            "Weekly full-store flyer scrape",
            "0 0 2 * * Sun",
            JobType::ScrapeFlyer,
        )
        .with_payload(payload(json!({ "scope": "all_stores" }))),
        ScheduledJobDefinition::new(
            "daily_price_update",
            "Daily price check",
            "0 0 6 * * *",
            JobType::UpdatePrices,
        ),
        ScheduledJobDefinition::new(
            "weekly_archive",
            "Weekly archival of expired flyers",
            "0 0 3 * * Mon",
            JobType::ArchiveData,
        ),
        ScheduledJobDefinition::new(
            "monthly_cleanup",
            "Monthly data cleanup",
            "0 0 4 1 * *",
            JobType::CleanupData,
        ),
        ScheduledJobDefinition::new(
            "hourly_product_extraction",
            "Hourly product extraction batch",
            "0 0 * * * *",
            JobType::ExtractProducts,
        )
        .with_payload(payload(json!({ "batch_size": 50 }))),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::CronParser;

    #[test]
    fn test_default_schedules_parse() {
        let defaults = default_schedules();
        assert_eq!(defaults.len(), 5);
        for def in &defaults {
            assert!(CronParser::parse(&def.schedule).is_ok(), "{}", def.schedule);
            assert!(def.enabled);
        }
    }

    #[test]
    fn test_default_ids_are_unique() {
        let mut ids: Vec<_> = default_schedules().into_iter().map(|d| d.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn test_hourly_extraction_batch_size() {
        let hourly = default_schedules()
            .into_iter()
            .find(|d| d.job_type == JobType::ExtractProducts)
            .unwrap();
        assert_eq!(hourly.payload_template["batch_size"], 50);
    }
}
