//! HTTP surface
//!
//! JSON endpoints for every execution mode plus the websocket relay for
//! interactive sessions. Only upgrade requests under the configured
//! websocket prefix are routed to the relay; anything else falls through to
//! the router's 404.

use axum::Json;
use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod relay;

use crate::app::{AppPreview, AppStatus};
use crate::runner::{InteractiveStart, InteractiveStatus, RunError, Runner};
use crate::session::SessionSnapshot;
use crate::types::{BatchOutput, ErrorKind, ErrorReport, StopOutcome, SubmissionRef};

/// Errors from running the HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Error response carrying an [`ErrorReport`]
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    report: ErrorReport,
}

impl ApiError {
    pub fn new(report: ErrorReport) -> Self {
        Self {
            status: status_for(report.kind),
            report,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn report(&self) -> &ErrorReport {
        &self.report
    }
}

impl From<RunError> for ApiError {
    fn from(error: RunError) -> Self {
        let report = error.report();
        if report.kind.is_user_fault() || report.kind == ErrorKind::InputError {
            info!(kind = ?report.kind, error = %error, "request rejected");
        } else {
            warn!(kind = ?report.kind, error = %error, "request failed");
        }
        Self::new(report)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(ErrorReport::new(ErrorKind::InputError, rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.report)).into_response()
    }
}

/// HTTP status for an error kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InputError => StatusCode::BAD_REQUEST,
        ErrorKind::BuildError | ErrorKind::RuntimeError | ErrorKind::NoEntryPointFound => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorKind::RuntimeTimeout | ErrorKind::StartupTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::ResourceError => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::DownloadFailed => StatusCode::BAD_GATEWAY,
        ErrorKind::ResolutionError | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Build the router over `runner`
pub fn router(runner: Runner) -> Router {
    let ws_route = format!(
        "{}/{{session_id}}",
        runner.config().server.ws_prefix.trim_end_matches('/')
    );

    Router::new()
        .route("/healthz", get(health))
        .route("/api/execute", post(execute))
        .route("/api/interactive", post(start_interactive))
        .route("/api/interactive/{id}/stop", post(stop_interactive))
        .route("/api/interactive/{id}/status", get(interactive_status))
        .route("/api/preview", post(start_preview))
        .route("/api/preview/{id}/stop", post(stop_preview))
        .route("/api/preview/{id}/status", get(preview_status))
        .route("/api/preview/{id}/logs", get(preview_logs))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}/touch", post(touch_session))
        .route(&ws_route, get(relay::upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(runner)
}

/// Serve until `shutdown` is cancelled, then tear down every session
///
/// The session reaper runs for as long as the server does.
pub async fn serve(runner: Runner, shutdown: CancellationToken) -> Result<(), ServerError> {
    let addr = runner.config().server.bind.clone();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!(addr = %addr, ws_prefix = %runner.config().server.ws_prefix, "listening");

    let reaper = runner.reaper().spawn(shutdown.child_token());
    let served = axum::serve(listener, router(runner.clone()))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;

    shutdown.cancel();
    if let Err(e) = reaper.await {
        warn!(error = %e, "reaper task failed");
    }
    let stopped = runner.shutdown().await;
    info!(stopped, "server stopped");

    served.map_err(ServerError::from)
}

async fn health(State(runner): State<Runner>) -> Json<Value> {
    let docker = runner.engine().ping().await.is_ok();
    Json(json!({
        "status": if docker { "ok" } else { "degraded" },
        "docker": docker,
        "sessions": runner.registry().len(),
    }))
}

async fn execute(
    State(runner): State<Runner>,
    body: Result<Json<SubmissionRef>, JsonRejection>,
) -> ApiResult<BatchOutput> {
    let Json(submission) = body?;
    Ok(Json(runner.execute(&submission).await?))
}

async fn start_interactive(
    State(runner): State<Runner>,
    body: Result<Json<SubmissionRef>, JsonRejection>,
) -> ApiResult<InteractiveStart> {
    let Json(submission) = body?;
    Ok(Json(runner.start_interactive(&submission).await?))
}

async fn stop_interactive(State(runner): State<Runner>, Path(id): Path<String>) -> Json<StopOutcome> {
    Json(runner.stop_interactive(&id).await)
}

async fn interactive_status(
    State(runner): State<Runner>,
    Path(id): Path<String>,
) -> Json<InteractiveStatus> {
    Json(runner.interactive_status(&id))
}

async fn start_preview(
    State(runner): State<Runner>,
    body: Result<Json<SubmissionRef>, JsonRejection>,
) -> ApiResult<AppPreview> {
    let Json(submission) = body?;
    Ok(Json(runner.start_preview(&submission).await?))
}

async fn stop_preview(State(runner): State<Runner>, Path(id): Path<String>) -> Json<StopOutcome> {
    Json(runner.app().stop(&id).await)
}

fn session_not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "sessionId": id, "status": "not_found" })),
    )
        .into_response()
}

async fn preview_status(State(runner): State<Runner>, Path(id): Path<String>) -> Response {
    match runner.app().status(&id) {
        Some(status) => Json::<AppStatus>(status).into_response(),
        None => session_not_found(&id),
    }
}

async fn preview_logs(State(runner): State<Runner>, Path(id): Path<String>) -> Response {
    match runner.app().logs(&id) {
        Some(logs) => Json(json!({ "sessionId": id, "logs": logs })).into_response(),
        None => session_not_found(&id),
    }
}

async fn list_sessions(State(runner): State<Runner>) -> Json<Vec<SessionSnapshot>> {
    Json(runner.registry().snapshot())
}

async fn touch_session(State(runner): State<Runner>, Path(id): Path<String>) -> Json<Value> {
    Json(json!({ "success": runner.registry().touch(&id) }))
}
