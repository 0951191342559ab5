use actix_web::{web, HttpResponse, Responder};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;
use utoipa::ToSchema;

use super::error_response;
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateEndorsementRequest {
    pub template_code: String,
    /// Values exposed to the endorsement template under `custom`.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub data: Value,
    /// Defaults to today (UTC).
    #[serde(default)]
    pub effective_date: Option<NaiveDate>,
}

#[utoipa::path(
    context_path = "/api",
    tag = "Endorsements",
    get,
    path = "/policies/{policy_id}/endorsements",
    params(("policy_id" = i64, Path, description = "Policy ID")),
    responses(
        (status = 200, description = "Endorsements in sequence order", body = [crate::endorsement::EndorsementSummary]),
        (status = 404, description = "Policy not found", body = crate::ErrorResponse)
    )
)]
pub async fn list_endorsements(state: web::Data<AppState>, path: web::Path<i64>) -> impl Responder {
    match state.endorsements.list_endorsements(path.into_inner()).await {
        Ok(items) => HttpResponse::Ok().json(items),
        Err(e) => error_response(e),
    }
}

#[utoipa::path(
    context_path = "/api",
    tag = "Endorsements",
    post,
    path = "/policies/{policy_id}/endorsements",
    request_body = CreateEndorsementRequest,
    params(("policy_id" = i64, Path, description = "Policy ID")),
    responses(
        (status = 201, description = "Endorsement rendered and recorded", body = crate::endorsement::EndorsementSummary),
        (status = 400, description = "Template is not an endorsement for this product", body = crate::ErrorResponse),
        (status = 404, description = "Policy or template not found", body = crate::ErrorResponse),
        (status = 409, description = "Endorsement sequence exhausted", body = crate::ErrorResponse)
    )
)]
pub async fn create_endorsement(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    body: web::Json<CreateEndorsementRequest>,
) -> impl Responder {
    let body = body.into_inner();
    match state
        .endorsements
        .create_endorsement(
            path.into_inner(),
            &body.template_code,
            body.data,
            body.effective_date,
        )
        .await
    {
        Ok(endorsement) => HttpResponse::Created().json(endorsement),
        Err(e) => error_response(e),
    }
}
