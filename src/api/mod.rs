//! HTTP surface over the engine.
//!
//! - `packages` - package and component operations
//! - `endorsements` - endorsement creation and listing
//! - `artifacts` - stored artifact download and metrics exposition

pub mod artifacts;
pub mod endorsements;
pub mod packages;

use actix_web::{http::StatusCode, web, HttpResponse};

use crate::error::EngineError;
use crate::ErrorResponse;

pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Validation(_)
        | EngineError::ProductUnknown(_)
        | EngineError::TemplateApplicability { .. } => StatusCode::BAD_REQUEST,
        EngineError::SequenceExhausted(_) | EngineError::Concurrency(_) => StatusCode::CONFLICT,
        EngineError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Render(_)
        | EngineError::Combiner(_)
        | EngineError::Store(_)
        | EngineError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// JSON error body carrying the machine-readable kind and the user message.
pub fn error_response(err: EngineError) -> HttpResponse {
    let status = status_for(&err);
    if status.is_server_error() {
        log::error!("request failed: {:?}", err);
    } else {
        log::info!("request rejected: {}", err);
    }
    HttpResponse::build(status).json(ErrorResponse::new(err.kind(), &err.user_message()))
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/policies/{policy_id}/packages")
            .route(web::post().to(packages::create_package)),
    )
    .service(
        web::resource("/policies/{policy_id}/documents/status")
            .route(web::get().to(packages::get_status)),
    )
    .service(
        web::resource("/policies/{policy_id}/documents/generate-missing")
            .route(web::post().to(packages::generate_missing)),
    )
    .service(
        web::resource("/policies/{policy_id}/components")
            .route(web::post().to(packages::add_component)),
    )
    .service(
        web::resource("/policies/{policy_id}/components/{component_id}")
            .route(web::delete().to(packages::delete_component)),
    )
    .service(
        web::resource("/policies/{policy_id}/components/{component_id}/regenerate")
            .route(web::post().to(packages::regenerate_component)),
    )
    .service(
        web::resource("/policies/{policy_id}/templates")
            .route(web::get().to(packages::list_available_templates)),
    )
    .service(
        web::resource("/policies/{policy_id}/deliveries")
            .route(web::post().to(packages::deliver_package)),
    )
    .service(
        web::resource("/policies/{policy_id}/endorsements")
            .route(web::get().to(endorsements::list_endorsements))
            .route(web::post().to(endorsements::create_endorsement)),
    )
    .service(web::resource("/documents/bulk").route(web::post().to(packages::bulk_generate)))
    .service(
        web::resource("/packages/{package_id}/combine")
            .route(web::post().to(packages::combine_package)),
    )
    .service(
        web::resource("/packages/{package_id}/issue")
            .route(web::post().to(packages::issue_package)),
    );
}
