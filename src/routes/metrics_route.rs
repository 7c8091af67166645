use actix_web::web;

use crate::services::metrics_service::{dead_letters, retry_dead_letter, schedules, stats};

/// Read-mostly operations surface. Expects `web::Data<AppState>` to be registered.
pub fn pantry_metrics_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/stats", web::get().to(stats))
            .route("/schedules", web::get().to(schedules))
            .route("/dead_letters", web::get().to(dead_letters))
            .route("/dead_letters/{id}/retry", web::post().to(retry_dead_letter)),
    );
}
