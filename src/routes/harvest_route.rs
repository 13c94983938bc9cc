use actix_web::{get, post, web, HttpResponse};
use serde_json::json;

use crate::services::{HarvestRequest, RunRegistry, StartError};

#[post("")]
async fn start_harvest(
    registry: web::Data<RunRegistry>,
    body: web::Json<HarvestRequest>,
) -> HttpResponse {
    match registry.start(body.into_inner()) {
        Ok(ticket) => HttpResponse::Accepted().json(ticket),
        Err(StartError::AlreadyRunning) => HttpResponse::Conflict().json(json!({
            "error": StartError::AlreadyRunning.to_string(),
            "status": registry.status(),
        })),
        Err(e) => {
            log::warn!("Rejected harvest request: {}", e);
            HttpResponse::BadRequest().json(json!({ "error": e.to_string() }))
        }
    }
}

#[get("/status")]
async fn harvest_status(registry: web::Data<RunRegistry>) -> HttpResponse {
    HttpResponse::Ok().json(registry.status())
}

#[post("/cancel")]
async fn cancel_harvest(registry: web::Data<RunRegistry>) -> HttpResponse {
    match registry.cancel() {
        true => HttpResponse::Accepted().json(registry.status()),
        false => HttpResponse::NotFound().json(json!({ "error": "No active harvest run" })),
    }
}
