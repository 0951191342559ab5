use actix_web::{web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};

use super::error_response;
use crate::error::EngineError;
use crate::models::TemplateType;
use crate::package::BulkMode;
use crate::AppState;

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CreatePackageRequest {
    /// Create a new package version even when a current one exists.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddComponentRequest {
    pub template_id: i64,
    /// Extra values exposed to the template under `custom`.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub custom: Option<Value>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BulkGenerateRequest {
    pub policy_ids: Vec<i64>,
    #[serde(default)]
    pub mode: BulkMode,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DeliverRequest {
    pub recipients: Vec<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct TemplateQuery {
    /// Template type filter, e.g. `endorsement`.
    #[serde(rename = "type")]
    #[param(rename = "type")]
    pub template_type: Option<String>,
    /// State code; defaults to the policy's state.
    pub state: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AckResponse {
    pub message: String,
}

#[utoipa::path(
    context_path = "/api",
    tag = "Packages",
    post,
    path = "/policies/{policy_id}/packages",
    request_body = CreatePackageRequest,
    params(("policy_id" = i64, Path, description = "Policy ID")),
    responses(
        (status = 201, description = "Package created", body = crate::package::CreatePackageResult),
        (status = 200, description = "Existing current package returned", body = crate::package::CreatePackageResult),
        (status = 404, description = "Policy not found", body = crate::ErrorResponse)
    )
)]
pub async fn create_package(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    body: Option<web::Json<CreatePackageRequest>>,
) -> impl Responder {
    let force = body.map(|b| b.force).unwrap_or(false);
    match state.packages.create_package(path.into_inner(), force).await {
        Ok(result) if result.created => HttpResponse::Created().json(result),
        Ok(result) => HttpResponse::Ok().json(result),
        Err(e) => error_response(e),
    }
}

#[utoipa::path(
    context_path = "/api",
    tag = "Packages",
    get,
    path = "/policies/{policy_id}/documents/status",
    params(("policy_id" = i64, Path, description = "Policy ID")),
    responses(
        (status = 200, description = "Current package and component statuses", body = crate::package::StatusReport),
        (status = 404, description = "Policy not found", body = crate::ErrorResponse)
    )
)]
pub async fn get_status(state: web::Data<AppState>, path: web::Path<i64>) -> impl Responder {
    match state.packages.get_status(path.into_inner()).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => error_response(e),
    }
}

#[utoipa::path(
    context_path = "/api",
    tag = "Packages",
    post,
    path = "/policies/{policy_id}/components/{component_id}/regenerate",
    params(
        ("policy_id" = i64, Path, description = "Policy ID"),
        ("component_id" = i64, Path, description = "Component ID")
    ),
    responses(
        (status = 200, description = "Component regenerated; a failed render is reported on the component", body = crate::package::ComponentSummary),
        (status = 404, description = "Component not found for this policy", body = crate::ErrorResponse),
        (status = 400, description = "Package is issued or no longer current", body = crate::ErrorResponse),
        (status = 409, description = "Component is being generated elsewhere", body = crate::ErrorResponse)
    )
)]
pub async fn regenerate_component(
    state: web::Data<AppState>,
    path: web::Path<(i64, i64)>,
) -> impl Responder {
    let (policy_id, component_id) = path.into_inner();
    match state
        .packages
        .regenerate_component(policy_id, component_id)
        .await
    {
        Ok(component) => HttpResponse::Ok().json(component),
        Err(e) => error_response(e),
    }
}

#[utoipa::path(
    context_path = "/api",
    tag = "Packages",
    post,
    path = "/policies/{policy_id}/documents/generate-missing",
    params(("policy_id" = i64, Path, description = "Policy ID")),
    responses(
        (status = 200, description = "Pending and errored components regenerated", body = crate::package::GenerateMissingSummary),
        (status = 404, description = "Policy not found", body = crate::ErrorResponse)
    )
)]
pub async fn generate_missing(state: web::Data<AppState>, path: web::Path<i64>) -> impl Responder {
    match state.packages.generate_missing(path.into_inner()).await {
        Ok(summary) => HttpResponse::Ok().json(summary),
        Err(e) => error_response(e),
    }
}

#[utoipa::path(
    context_path = "/api",
    tag = "Packages",
    post,
    path = "/policies/{policy_id}/components",
    request_body = AddComponentRequest,
    params(("policy_id" = i64, Path, description = "Policy ID")),
    responses(
        (status = 201, description = "Component appended and generated", body = crate::package::ComponentSummary),
        (status = 400, description = "Template not usable for this policy", body = crate::ErrorResponse),
        (status = 404, description = "Policy, template or current package not found", body = crate::ErrorResponse)
    )
)]
pub async fn add_component(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    body: web::Json<AddComponentRequest>,
) -> impl Responder {
    let body = body.into_inner();
    match state
        .packages
        .add_component(path.into_inner(), body.template_id, body.custom)
        .await
    {
        Ok(component) => HttpResponse::Created().json(component),
        Err(e) => error_response(e),
    }
}

#[utoipa::path(
    context_path = "/api",
    tag = "Packages",
    delete,
    path = "/policies/{policy_id}/components/{component_id}",
    params(
        ("policy_id" = i64, Path, description = "Policy ID"),
        ("component_id" = i64, Path, description = "Component ID")
    ),
    responses(
        (status = 200, description = "Component and its artifact removed", body = AckResponse),
        (status = 400, description = "Package is issued or no longer current", body = crate::ErrorResponse),
        (status = 404, description = "Component not found for this policy", body = crate::ErrorResponse)
    )
)]
pub async fn delete_component(
    state: web::Data<AppState>,
    path: web::Path<(i64, i64)>,
) -> impl Responder {
    let (policy_id, component_id) = path.into_inner();
    match state.packages.delete_component(policy_id, component_id).await {
        Ok(()) => HttpResponse::Ok().json(AckResponse {
            message: format!("component {component_id} deleted"),
        }),
        Err(e) => error_response(e),
    }
}

#[utoipa::path(
    context_path = "/api",
    tag = "Packages",
    post,
    path = "/documents/bulk",
    request_body = BulkGenerateRequest,
    responses(
        (status = 200, description = "Per-policy results in request order", body = [crate::package::BulkResult]),
        (status = 400, description = "No policies given", body = crate::ErrorResponse)
    )
)]
pub async fn bulk_generate(
    state: web::Data<AppState>,
    body: web::Json<BulkGenerateRequest>,
) -> impl Responder {
    if body.policy_ids.is_empty() {
        return error_response(EngineError::validation("policy_ids must not be empty"));
    }
    let results = state.packages.bulk_generate(&body.policy_ids, body.mode).await;
    HttpResponse::Ok().json(results)
}

#[utoipa::path(
    context_path = "/api",
    tag = "Packages",
    get,
    path = "/policies/{policy_id}/templates",
    params(("policy_id" = i64, Path, description = "Policy ID"), TemplateQuery),
    responses(
        (status = 200, description = "Templates that can be added, with usage counts", body = [crate::package::AvailableTemplate]),
        (status = 400, description = "Unknown template type", body = crate::ErrorResponse),
        (status = 404, description = "Policy not found", body = crate::ErrorResponse)
    )
)]
pub async fn list_available_templates(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    query: web::Query<TemplateQuery>,
) -> impl Responder {
    let template_type = match query.template_type.as_deref().map(str::parse::<TemplateType>) {
        Some(Ok(ty)) => Some(ty),
        Some(Err(e)) => return error_response(e),
        None => None,
    };
    match state
        .packages
        .list_available_templates(path.into_inner(), template_type, query.state.as_deref())
        .await
    {
        Ok(templates) => HttpResponse::Ok().json(templates),
        Err(e) => error_response(e),
    }
}

#[utoipa::path(
    context_path = "/api",
    tag = "Packages",
    post,
    path = "/packages/{package_id}/combine",
    params(("package_id" = i64, Path, description = "Package ID")),
    responses(
        (status = 200, description = "Combined artifact, or a fallback cover when merging is unavailable", body = crate::package::CombineResult),
        (status = 404, description = "Package not found", body = crate::ErrorResponse)
    )
)]
pub async fn combine_package(state: web::Data<AppState>, path: web::Path<i64>) -> impl Responder {
    match state.packages.combine_package(path.into_inner()).await {
        Ok(result) => HttpResponse::Ok().json(result),
        Err(e) => error_response(e),
    }
}

#[utoipa::path(
    context_path = "/api",
    tag = "Packages",
    post,
    path = "/packages/{package_id}/issue",
    params(("package_id" = i64, Path, description = "Package ID")),
    responses(
        (status = 200, description = "Package issued", body = crate::package::PackageSummary),
        (status = 400, description = "Package is not current or already issued", body = crate::ErrorResponse),
        (status = 404, description = "Package not found", body = crate::ErrorResponse)
    )
)]
pub async fn issue_package(state: web::Data<AppState>, path: web::Path<i64>) -> impl Responder {
    match state.packages.issue_package(path.into_inner()).await {
        Ok(package) => HttpResponse::Ok().json(package),
        Err(e) => error_response(e),
    }
}

#[utoipa::path(
    context_path = "/api",
    tag = "Packages",
    post,
    path = "/policies/{policy_id}/deliveries",
    request_body = DeliverRequest,
    params(("policy_id" = i64, Path, description = "Policy ID")),
    responses(
        (status = 200, description = "Package handed to the delivery channel", body = crate::delivery::DeliveryReceipt),
        (status = 400, description = "Bad recipients or package not ready", body = crate::ErrorResponse),
        (status = 404, description = "Policy or current package not found", body = crate::ErrorResponse)
    )
)]
pub async fn deliver_package(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    body: web::Json<DeliverRequest>,
) -> impl Responder {
    match state
        .packages
        .deliver_package(path.into_inner(), &body.recipients)
        .await
    {
        Ok(receipt) => HttpResponse::Ok().json(receipt),
        Err(e) => error_response(e),
    }
}
