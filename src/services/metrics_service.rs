use std::sync::Arc;

use actix_web::{web, HttpResponse, Responder};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::cron::JobScheduler;
use crate::error::PantryError;
use crate::queue::Queue;
use crate::utils::constants::DEFAULT_LIST_LIMIT;

/// Shared state behind the metrics routes.
pub struct AppState {
    pub queue: Arc<dyn Queue>,
    pub scheduler: Option<Arc<JobScheduler>>,
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

fn error_response(err: PantryError) -> HttpResponse {
    if err.is_internal() {
        tracing::error!("Metrics request failed: {}", err);
        return HttpResponse::InternalServerError().json(json!({ "error": "store error" }));
    }

    let body = json!({ "error": err.to_string() });
    match err {
        PantryError::NotFound(_) => HttpResponse::NotFound().json(body),
        PantryError::Conflict(_) => HttpResponse::Conflict().json(body),
        _ => HttpResponse::BadRequest().json(body),
    }
}

pub async fn stats(state: web::Data<AppState>) -> impl Responder {
    match state.queue.stats().await {
        Ok(stats) => HttpResponse::Ok().json(json!({
            "pending": stats.pending,
            "processing": stats.processing,
            "scheduled": stats.scheduled,
            "dead_letter": stats.dead_letter,
            "total": stats.total(),
            "generated_at": Utc::now().to_rfc3339(),
        })),
        Err(e) => error_response(e),
    }
}

pub async fn schedules(state: web::Data<AppState>) -> impl Responder {
    let definitions = state
        .scheduler
        .as_ref()
        .map(|scheduler| scheduler.list_jobs())
        .unwrap_or_default();
    HttpResponse::Ok().json(definitions)
}

pub async fn dead_letters(
    state: web::Data<AppState>,
    query: web::Query<DeadLetterQuery>,
) -> impl Responder {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    match state.queue.dead_letters(limit).await {
        Ok(jobs) => HttpResponse::Ok().json(jobs),
        Err(e) => error_response(e),
    }
}

pub async fn retry_dead_letter(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let job_id = path.into_inner();
    match state.queue.retry_dead_letter(&job_id).await {
        Ok(job) => HttpResponse::Ok().json(json!({ "status": "retried", "job": job })),
        Err(e) => error_response(e),
    }
}
