//! Route table and handlers.
//!
//! - `GET /` - name and version
//! - `GET /health` - liveness
//! - `POST /api/send-dm` - start an outreach task
//! - `GET /api/task-status/{task_id}` - poll a task
//! - `GET /api/logs` - captured logs of every task, newest first
//! - `POST /api/tasks/{task_id}/cancel` - cancel a running task
//! - `POST /api/auth-code` - hand a verification code to a waiting login

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use igdm_core::auth::CodeKind;
use igdm_core::tasks::{LogEntry, RegistryError, TaskSnapshot};
use igdm_core::{OutreachService, SubmitRequest};

use crate::auth::require_api_key;

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Job runner and task registry.
    pub service: OutreachService,
    /// Required API key, when `SECRET_KEY` is set.
    pub api_key: Option<Arc<str>>,
}

/// JSON error payload: `{"status": "error", "message": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Error with the given status and message.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "status": "error", "message": self.message }));
        (self.status, body).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        let status = match e {
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Full { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RegistryError::AccountBusy { .. } | RegistryError::AlreadyFinished { .. } => {
                StatusCode::CONFLICT
            }
        };
        Self::new(status, e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/send-dm", post(send_dm))
        .route("/task-status/{task_id}", get(task_status))
        .route("/logs", get(logs))
        .route("/tasks/{task_id}/cancel", post(cancel_task))
        .route("/auth-code", post(auth_code))
        .route_layer(middleware::from_fn_with_state(
            state.api_key.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest("/api", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct RootResponse {
    name: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SendDmRequest {
    username: String,
    password: String,
    targets: String,
    message: String,
}

async fn send_dm(
    State(state): State<AppState>,
    body: Result<Json<SendDmRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body?;
    let request =
        SubmitRequest::from_form(&body.username, &body.password, &body.targets, &body.message)
            .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;

    let task_id = state.service.submit(request)?;
    Ok(Json(json!({ "status": "started", "task_id": task_id })))
}

async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskSnapshot>, ApiError> {
    state
        .service
        .registry()
        .snapshot(&task_id)
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Task not found"))
}

async fn logs(State(state): State<AppState>) -> Json<Vec<LogEntry>> {
    Json(state.service.registry().logs())
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.service.registry().cancel(&task_id)?;
    log::info!("cancellation requested for {task_id}");
    Ok(Json(json!({ "status": "cancelling", "task_id": task_id })))
}

#[derive(Debug, Deserialize)]
struct AuthCodeRequest {
    username: String,
    kind: CodeKind,
    code: String,
}

async fn auth_code(
    State(state): State<AppState>,
    body: Result<Json<AuthCodeRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body?;
    let Some(inbox) = state.service.code_inbox() else {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "verification codes are read from drop files on this server",
        ));
    };
    if body.code.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "code is required"));
    }

    if inbox.deliver(&body.username, body.kind, &body.code) {
        Ok(Json(json!({ "status": "accepted" })))
    } else {
        Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("no login is waiting for a {} code for {}", body.kind, body.username),
        ))
    }
}
