// src/delivery/routes.rs

//! Axum router for the delivery controller
//!
//! Defines the HTTP surface over a `DeliveryController`:
//! - `/health` - Health check endpoint
//! - `/v1/modules/:id/*` - Install, confirm, acknowledge, query
//! - `/v1/uninstall` - Deferred uninstall
//! - `/v1/sessions`, `/v1/installed` - Listings
//! - `/v1/metrics` - Prometheus counters
//! - `/v1/events` - SSE stream of session snapshots

use super::{Action, DeliveryController, DeliverySession, ModuleId, SessionEvent};
use crate::error::Error;
use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::warn;

/// Shared router state
pub type SharedState = DeliveryController;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub backend: String,
}

/// RFC 7807 problem document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    /// Error type URI
    #[serde(rename = "type")]
    pub error_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

impl Problem {
    pub fn new(error_type: &str, title: &str, status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            error_type: format!("urn:ondemand:error:{}", error_type),
            title: title.to_string(),
            status: status.as_u16(),
            detail: detail.into(),
            module: None,
        }
    }

    fn for_module(mut self, module: &str) -> Self {
        self.module = Some(module.to_string());
        self
    }
}

/// Error response wrapper for RFC 7807 format
pub struct ApiError(Problem);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let detail = err.to_string();
        let problem = match &err {
            Error::NotInstalled { .. } => {
                Problem::new("not_installed", "Not Installed", StatusCode::NOT_FOUND, detail)
            }
            Error::NoConfirmationPending { module } => Problem::new(
                "no_confirmation_pending",
                "No Confirmation Pending",
                StatusCode::CONFLICT,
                detail,
            )
            .for_module(module),
            Error::AlreadyInProgress { module } => Problem::new(
                "already_in_progress",
                "Already In Progress",
                StatusCode::CONFLICT,
                detail,
            )
            .for_module(module),
            Error::BackendFailure { .. } => {
                Problem::new("backend_failure", "Backend Failure", StatusCode::BAD_GATEWAY, detail)
            }
            Error::InvalidModuleId { id, .. } => Problem::new(
                "invalid_module_id",
                "Invalid Module Id",
                StatusCode::BAD_REQUEST,
                detail,
            )
            .for_module(id),
            Error::UnknownBackendStatus { module, .. } => Problem::new(
                "unknown_backend_status",
                "Unknown Backend Status",
                StatusCode::INTERNAL_SERVER_ERROR,
                detail,
            )
            .for_module(module),
            Error::Config(_) | Error::Io(_) => Problem::new(
                "internal",
                "Internal Error",
                StatusCode::INTERNAL_SERVER_ERROR,
                detail,
            ),
        };
        ApiError(problem)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        (
            status,
            [("content-type", "application/problem+json")],
            Json(&self.0),
        )
            .into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct UninstallRequest {
    pub modules: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct UninstallResponse {
    pub status: &'static str,
    pub modules: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmationRequest {
    pub approve: bool,
}

#[derive(Debug, Serialize)]
pub struct ConfirmationResponse {
    pub module: ModuleId,
    pub approved: bool,
}

#[derive(Debug, Serialize)]
pub struct InstalledResponse {
    pub modules: Vec<ModuleId>,
}

/// Build the main router
pub fn build_router(controller: DeliveryController) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", build_v1_router())
        .with_state(controller)
}

/// Build the v1 API router
fn build_v1_router() -> Router<SharedState> {
    Router::new()
        // Modules
        .route("/modules/:id", get(get_module_handler))
        .route("/modules/:id/install", post(install_handler))
        .route("/modules/:id/confirmation", post(confirmation_handler))
        .route("/modules/:id/acknowledge", post(acknowledge_handler))
        .route("/uninstall", post(uninstall_handler))
        // Listings
        .route("/sessions", get(sessions_handler))
        .route("/installed", get(installed_handler))
        // Metrics (Prometheus format)
        .route("/metrics", get(metrics_handler))
        // Session snapshot stream
        .route("/events", get(events_handler))
}

/// GET /health
async fn health_handler(State(controller): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        backend: controller.backend_name().to_string(),
    })
}

/// Install or open a module
///
/// POST /v1/modules/:id/install
///
/// Returns 202 when a backend install was started and 200 when the module
/// is already installed or already being installed.
async fn install_handler(
    State(controller): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Action>)> {
    let action = controller.install_or_open(&id).await?;
    let status = match action {
        Action::InstallStarted(_) => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(action)))
}

/// Request deferred uninstall
///
/// POST /v1/uninstall
async fn uninstall_handler(
    State(controller): State<SharedState>,
    Json(request): Json<UninstallRequest>,
) -> ApiResult<(StatusCode, Json<UninstallResponse>)> {
    controller.uninstall(&request.modules).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(UninstallResponse {
            status: "accepted",
            modules: request.modules,
        }),
    ))
}

/// Resolve a confirmation gate
///
/// POST /v1/modules/:id/confirmation
async fn confirmation_handler(
    State(controller): State<SharedState>,
    Path(id): Path<String>,
    Json(request): Json<ConfirmationRequest>,
) -> ApiResult<Json<ConfirmationResponse>> {
    let module = controller.module_id(&id)?;
    controller
        .resolve_confirmation_for(&module, request.approve)
        .await?;
    Ok(Json(ConfirmationResponse {
        module,
        approved: request.approve,
    }))
}

/// POST /v1/modules/:id/acknowledge
async fn acknowledge_handler(
    State(controller): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    controller.acknowledge(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/modules/:id
async fn get_module_handler(
    State(controller): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeliverySession>> {
    match controller.get_session(&id)? {
        Some(session) => Ok(Json(session)),
        None => Err(ApiError(
            Problem::new(
                "no_session",
                "Not Found",
                StatusCode::NOT_FOUND,
                format!("No session for module '{}'", id),
            )
            .for_module(&id),
        )),
    }
}

/// GET /v1/sessions
async fn sessions_handler(State(controller): State<SharedState>) -> Json<Vec<DeliverySession>> {
    Json(controller.sessions())
}

/// GET /v1/installed
async fn installed_handler(
    State(controller): State<SharedState>,
) -> ApiResult<Json<InstalledResponse>> {
    let modules = controller.installed_modules().await?;
    Ok(Json(InstalledResponse {
        modules: modules.into_iter().collect(),
    }))
}

/// Metrics endpoint (Prometheus format)
///
/// GET /v1/metrics
async fn metrics_handler(State(controller): State<SharedState>) -> String {
    let m = controller.metrics();

    format!(
        r#"# HELP ondemand_install_requests_total install_or_open calls
# TYPE ondemand_install_requests_total counter
ondemand_install_requests_total {}

# HELP ondemand_opens_total Requests answered with open
# TYPE ondemand_opens_total counter
ondemand_opens_total {}

# HELP ondemand_duplicates_suppressed_total Requests answered with in_progress
# TYPE ondemand_duplicates_suppressed_total counter
ondemand_duplicates_suppressed_total {}

# HELP ondemand_backend_install_calls_total Install requests issued to the backend
# TYPE ondemand_backend_install_calls_total counter
ondemand_backend_install_calls_total {}

# HELP ondemand_sessions_installed_total Sessions that reached installed
# TYPE ondemand_sessions_installed_total counter
ondemand_sessions_installed_total {}

# HELP ondemand_sessions_failed_total Sessions that failed
# TYPE ondemand_sessions_failed_total counter
ondemand_sessions_failed_total {}

# HELP ondemand_sessions_canceled_total Sessions that were canceled
# TYPE ondemand_sessions_canceled_total counter
ondemand_sessions_canceled_total {}

# HELP ondemand_events_ignored_total Backend events that did not apply
# TYPE ondemand_events_ignored_total counter
ondemand_events_ignored_total {}

# HELP ondemand_unknown_statuses_total Backend events with an unknown status code
# TYPE ondemand_unknown_statuses_total counter
ondemand_unknown_statuses_total {}

# HELP ondemand_modules_uninstalled_total Modules acknowledged for uninstall
# TYPE ondemand_modules_uninstalled_total counter
ondemand_modules_uninstalled_total {}

# HELP ondemand_subscribers Live session subscriptions
# TYPE ondemand_subscribers gauge
ondemand_subscribers {}
"#,
        m.install_requests,
        m.opens,
        m.duplicates_suppressed,
        m.backend_install_calls,
        m.sessions_installed,
        m.sessions_failed,
        m.sessions_canceled,
        m.events_ignored,
        m.unknown_statuses,
        m.modules_uninstalled,
        controller.subscriber_count(),
    )
}

/// Session snapshot stream (SSE)
///
/// GET /v1/events
///
/// The stream will:
/// - Send a "connected" event immediately on connection
/// - Send a "session" event for every snapshot published afterwards
/// - Send a "warning" event with the lagged count when the client falls behind
/// - Send keepalive comments every 30 seconds
async fn events_handler(
    State(controller): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let event_stream = controller
        .subscribe()
        .into_stream()
        .filter_map(|event| match event {
            SessionEvent::Snapshot(session) => match serde_json::to_string(&session) {
                Ok(json) => Some(Ok(Event::default().event("session").data(json))),
                Err(e) => {
                    warn!("Failed to serialize session for {}: {}", session.module_id, e);
                    None
                }
            },
            SessionEvent::Lagged(n) => {
                warn!("SSE client lagged {} snapshots", n);
                Some(Ok(Event::default()
                    .event("warning")
                    .data(format!(r#"{{"lagged": {}}}"#, n))))
            }
        });

    let connected_event = stream::once(async {
        Ok(Event::default()
            .event("connected")
            .data(r#"{"status": "connected"}"#))
    });

    Sse::new(connected_event.chain(event_stream)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keepalive"),
    )
}
