use actix_web::{http::header, web, HttpResponse, Responder};

use super::error_response;
use crate::error::{EngineError, StoreError};
use crate::metrics;
use crate::{AppState, ErrorResponse};

#[utoipa::path(
    tag = "Artifacts",
    get,
    path = "/artifacts/{key}",
    params(("key" = String, Path, description = "Artifact key, e.g. policy-packages/2024/03/POL-WCP-000001-00-DOC-....pdf")),
    responses(
        (status = 200, description = "Stored PDF", content_type = "application/pdf"),
        (status = 400, description = "Malformed key", body = ErrorResponse),
        (status = 404, description = "Artifact not found", body = ErrorResponse)
    )
)]
pub async fn get_artifact(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let key = path.into_inner();
    match state.store.get(&key).await {
        Ok(bytes) => HttpResponse::Ok()
            .content_type("application/pdf")
            .insert_header((header::CACHE_CONTROL, "public, max-age=31536000, immutable"))
            .body(bytes),
        Err(StoreError::NotFound(_)) => error_response(EngineError::not_found(format!("artifact {key}"))),
        Err(StoreError::InvalidKey(_)) => {
            error_response(EngineError::validation(format!("invalid artifact key {key:?}")))
        }
        Err(e) => error_response(e.into()),
    }
}

#[utoipa::path(
    tag = "Operations",
    get,
    path = "/metrics",
    responses(
        (status = 200, description = "Prometheus text exposition", content_type = "text/plain")
    )
)]
pub async fn metrics_handler() -> impl Responder {
    match metrics::gather_text() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => {
            log::error!("metrics encoding failed: {}", e);
            HttpResponse::InternalServerError().json(ErrorResponse::internal_error(&e))
        }
    }
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/artifacts/{key:.*}").route(web::get().to(get_artifact)))
        .service(web::resource("/metrics").route(web::get().to(metrics_handler)));
}
