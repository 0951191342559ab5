use actix_web::middleware::Compress;
use actix_web::{web, App, HttpServer};
use serde::{Deserialize, Serialize};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

pub mod api;
pub mod combine;
pub mod config;
pub mod db;
pub mod delivery;
pub mod endorsement;
pub mod error;
pub mod identifiers;
pub mod merge;
pub mod metrics;
pub mod models;
pub mod package;
pub mod render;
pub mod state;
pub mod storage;
pub mod templates;

pub use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error_type: &str, message: &str) -> Self {
        Self {
            error: error_type.to_string(),
            message: message.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn internal_error(message: &str) -> Self {
        Self::new("InternalServerError", message)
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::packages::create_package,
        crate::api::packages::get_status,
        crate::api::packages::regenerate_component,
        crate::api::packages::generate_missing,
        crate::api::packages::add_component,
        crate::api::packages::delete_component,
        crate::api::packages::bulk_generate,
        crate::api::packages::list_available_templates,
        crate::api::packages::combine_package,
        crate::api::packages::issue_package,
        crate::api::packages::deliver_package,
        crate::api::endorsements::list_endorsements,
        crate::api::endorsements::create_endorsement,
        crate::api::artifacts::get_artifact,
        crate::api::artifacts::metrics_handler
    ),
    components(
        schemas(
            api::packages::CreatePackageRequest,
            api::packages::AddComponentRequest,
            api::packages::BulkGenerateRequest,
            api::packages::DeliverRequest,
            api::packages::AckResponse,
            api::endorsements::CreateEndorsementRequest,
            package::ComponentSummary,
            package::PackageSummary,
            package::CreatePackageResult,
            package::ComponentResult,
            package::GenerateMissingSummary,
            package::BulkMode,
            package::BulkResult,
            package::AvailableTemplate,
            package::CombineResult,
            package::StatusReport,
            endorsement::EndorsementSummary,
            delivery::DeliveryReceipt,
            models::TemplateType,
            models::TemplateFormat,
            models::PackageStatus,
            models::ComponentStatus,
            ErrorResponse,
        )
    ),
    tags(
        (name = "Packages", description = "Policy document packages and their components."),
        (name = "Endorsements", description = "Standalone endorsement documents."),
        (name = "Artifacts", description = "Stored PDF downloads."),
        (name = "Operations", description = "Metrics exposition.")
    ),
    servers(
        (url = "http://127.0.0.1:8080", description = "Local server")
    )
)]
pub struct ApiDoc;

/// Log level comes from `RUST_LOG`, defaulting to `info`.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// Routes shared by the server and the HTTP tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::scope("/api").configure(api::config))
        .configure(api::artifacts::config);
}

pub async fn run(state: AppState) -> std::io::Result<()> {
    let bind_addr = state.config.bind_addr.clone();
    let app_state = web::Data::new(state);

    log::info!("Starting server at http://{}", bind_addr);

    HttpServer::new(move || {
        App::new()
            .wrap(Compress::default())
            .app_data(app_state.clone())
            .configure(configure)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-doc/openapi.json", ApiDoc::openapi()),
            )
    })
    .backlog(8192)
    .max_connections(25000)
    .keep_alive(actix_web::http::KeepAlive::Os)
    .bind(bind_addr.as_str())?
    .run()
    .await
}
