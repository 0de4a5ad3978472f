use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dockscale_common::{Instance, ServiceDefinition};
use dockscale_controller::{
    ControlError, Controller, InstanceInfo, Member, Progress, ReconcileOutcome, ResourceEntry,
    TeardownOutcome, Target,
};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{instrument, warn};

pub mod config;

pub use config::{ConfigError, ServerConfig, DEFAULT_LOG_FILTER};

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
}

impl AppState {
    pub fn new(controller: Controller) -> Self {
        Self {
            controller: Arc::new(controller),
        }
    }
}

/// Error body returned by every endpoint.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        let status = match &err {
            ControlError::ServiceNotFound(_)
            | ControlError::InstanceNotFound(_)
            | ControlError::ImageNotFound(_) => StatusCode::NOT_FOUND,
            ControlError::InvalidReplicaCount { .. } => StatusCode::BAD_REQUEST,
            ControlError::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ControlError::ContainerStartError { .. }
            | ControlError::PartialReconciliation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(code = err.code(), error = %err, "Request failed");
        }
        Self {
            status,
            error: err.to_string(),
            code: err.code().to_string(),
            progress: err.progress(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        // Registry
        .route("/api/v1/services", get(list_services_handler))
        // Service-scoped lifecycle
        .route("/api/v1/services/:service/run", post(run_handler))
        .route("/api/v1/services/:service/scale/:replicas", post(scale_handler))
        .route("/api/v1/services/:service/stop", post(stop_service_handler))
        .route("/api/v1/services/:service/remove", post(remove_service_handler))
        // Single instances
        .route("/api/v1/instances/:id/stop", post(stop_instance_handler))
        .route("/api/v1/instances/:id/remove", post(remove_instance_handler))
        // Observability
        .route("/api/v1/info", get(info_all_handler))
        .route("/api/v1/info/:service", get(info_service_handler))
        .route("/api/v1/resource", get(resource_all_handler))
        .route("/api/v1/resource/:service", get(resource_service_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn index_handler() -> impl IntoResponse {
    Json(json!({
        "service": "dockscale",
        "endpoints": [
            "GET /health",
            "GET /api/v1/services",
            "POST /api/v1/services/:service/run",
            "POST /api/v1/services/:service/scale/:replicas",
            "POST /api/v1/services/:service/stop",
            "POST /api/v1/services/:service/remove",
            "POST /api/v1/instances/:id/stop",
            "POST /api/v1/instances/:id/remove",
            "GET /api/v1/info[/:service]",
            "GET /api/v1/resource[/:service]",
        ]
    }))
}

async fn health_handler(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    state.controller.health().await?;
    Ok(Json(json!({
        "status": "healthy",
        "services": state.controller.registry().len(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

async fn list_services_handler(State(state): State<AppState>) -> Json<Vec<ServiceDefinition>> {
    Json(state.controller.registry().list_all().cloned().collect())
}

#[instrument(skip(state))]
async fn run_handler(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> ApiResult<(StatusCode, Json<Instance>)> {
    let instance = state.controller.start_one(&service).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

#[instrument(skip(state))]
async fn scale_handler(
    State(state): State<AppState>,
    Path((service, replicas)): Path<(String, String)>,
) -> ApiResult<Json<ReconcileOutcome>> {
    let desired = replicas.trim().parse::<i64>().map_err(|_| ApiError {
        status: StatusCode::BAD_REQUEST,
        error: format!("Invalid replica count '{replicas}': not an integer"),
        code: "INVALID_REPLICA_COUNT".to_string(),
        progress: None,
    })?;
    Ok(Json(state.controller.reconcile(&service, desired).await?))
}

#[derive(Debug, Serialize)]
struct StoppedResponse {
    service: String,
    stopped: usize,
}

#[instrument(skip(state))]
async fn stop_service_handler(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> ApiResult<Json<StoppedResponse>> {
    let stopped = state.controller.stop_all_for_service(&service).await?;
    Ok(Json(StoppedResponse { service, stopped }))
}

#[derive(Debug, Serialize)]
struct TeardownResponse {
    service: String,
    #[serde(flatten)]
    outcome: TeardownOutcome,
}

#[instrument(skip(state))]
async fn remove_service_handler(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> ApiResult<Json<TeardownResponse>> {
    let outcome = state.controller.teardown_service(&service).await?;
    Ok(Json(TeardownResponse { service, outcome }))
}

#[instrument(skip(state))]
async fn stop_instance_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Member>> {
    Ok(Json(state.controller.stop_instance(&id).await?))
}

#[instrument(skip(state))]
async fn remove_instance_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Member>> {
    Ok(Json(state.controller.remove_instance(&id).await?))
}

async fn info_all_handler(
    State(state): State<AppState>,
) -> ApiResult<Json<BTreeMap<String, InstanceInfo>>> {
    Ok(Json(state.controller.info(&Target::All).await?))
}

async fn info_service_handler(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> ApiResult<Json<BTreeMap<String, InstanceInfo>>> {
    Ok(Json(state.controller.info(&Target::Service(service)).await?))
}

async fn resource_all_handler(
    State(state): State<AppState>,
) -> ApiResult<Json<BTreeMap<String, ResourceEntry>>> {
    Ok(Json(state.controller.resource(&Target::All).await?))
}

async fn resource_service_handler(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> ApiResult<Json<BTreeMap<String, ResourceEntry>>> {
    Ok(Json(state.controller.resource(&Target::Service(service)).await?))
}
