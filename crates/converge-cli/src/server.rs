//! HTTP/JSON control API over a `ControlPlane`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use converge::registry::{RegistryError, DEFAULT_HISTORY_LIMIT};
use converge::sync::SyncRequestOutcome;
use converge::{Application, ControlPlane, ConvergeError, PolicyOverride, SyncOperation};

use crate::api::{
    ApiResponse, DeregisterResponse, Health, RegisterRequest, WebhookRequest, WebhookResponse,
};

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

pub fn router(control: Arc<ControlPlane>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/api/applications",
            get(list_applications).post(register_application),
        )
        .route(
            "/api/applications/{name}",
            get(get_application).delete(deregister_application),
        )
        .route("/api/applications/{name}/sync", post(sync_application))
        .route("/api/applications/{name}/policy", put(override_policy))
        .route("/api/applications/{name}/history", get(application_history))
        .route("/api/webhook", post(webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(control)
}

/// A `ConvergeError` rendered as an error envelope with a matching status code.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<ConvergeError> for ApiError {
    fn from(e: ConvergeError) -> Self {
        let status = match &e {
            ConvergeError::ApplicationNotFound(_) => StatusCode::NOT_FOUND,
            ConvergeError::InvalidApplication(_) | ConvergeError::Config(_) => {
                StatusCode::BAD_REQUEST
            }
            ConvergeError::Registry(RegistryError::AlreadyExists(_)) => StatusCode::CONFLICT,
            ConvergeError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
            ConvergeError::Policy(_) => StatusCode::CONFLICT,
            ConvergeError::Source(_) | ConvergeError::Runtime(_) => StatusCode::BAD_GATEWAY,
            ConvergeError::Render(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ConvergeError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::error!("Request failed: {}", e);
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::<()>::err(self.message))).into_response()
    }
}

async fn healthz(State(control): State<Arc<ControlPlane>>) -> ApiResult<Health> {
    Ok(Json(ApiResponse::ok(Health {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        applications: control.list()?.len(),
    })))
}

async fn list_applications(State(control): State<Arc<ControlPlane>>) -> ApiResult<Vec<Application>> {
    Ok(Json(ApiResponse::ok(control.list()?)))
}

async fn register_application(
    State(control): State<Arc<ControlPlane>>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Application>>), ApiError> {
    let app = control.register(&request.name, request.spec)?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(app))))
}

async fn get_application(
    State(control): State<Arc<ControlPlane>>,
    Path(name): Path<String>,
) -> ApiResult<Application> {
    Ok(Json(ApiResponse::ok(control.status(&name)?)))
}

#[derive(Debug, Deserialize)]
struct DeregisterQuery {
    #[serde(default)]
    prune: bool,
}

async fn deregister_application(
    State(control): State<Arc<ControlPlane>>,
    Path(name): Path<String>,
    Query(query): Query<DeregisterQuery>,
) -> ApiResult<DeregisterResponse> {
    let pruned = control.deregister(&name, query.prune).await?;
    Ok(Json(ApiResponse::ok(DeregisterResponse { name, pruned })))
}

async fn sync_application(
    State(control): State<Arc<ControlPlane>>,
    Path(name): Path<String>,
) -> ApiResult<SyncRequestOutcome> {
    Ok(Json(ApiResponse::ok(control.trigger_sync(&name).await?)))
}

async fn override_policy(
    State(control): State<Arc<ControlPlane>>,
    Path(name): Path<String>,
    Json(policy): Json<PolicyOverride>,
) -> ApiResult<Application> {
    Ok(Json(ApiResponse::ok(
        control.override_policy(&name, &policy).await?,
    )))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn application_history(
    State(control): State<Arc<ControlPlane>>,
    Path(name): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<SyncOperation>> {
    // History outlives deregistration, so unknown names just return nothing.
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(ApiResponse::ok(control.history(&name, limit)?)))
}

async fn webhook(
    State(control): State<Arc<ControlPlane>>,
    Json(request): Json<WebhookRequest>,
) -> ApiResult<WebhookResponse> {
    let matched = control.notify_webhook(&request.repo_url, &request.reference)?;
    Ok(Json(ApiResponse::ok(WebhookResponse { matched })))
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = sigint.recv() => {}
                }
            }
            _ => {
                log::warn!("Could not register signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    log::info!("Shutdown signal received");
}
