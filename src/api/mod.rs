//! Admin HTTP surface.
//!
//! Thin axum handlers over the scheduler, monitor and automation engine,
//! plus the refresh websocket.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::automation::{AutomationEngine, Value};
use crate::clock::Clock;
use crate::compliance::initialize_company_compliance;
use crate::db::Database;
use crate::error::{AutomationError, MonitorError, SchedulerError};
use crate::monitor::{EventMonitor, EventStatus};
use crate::refresh::RefreshBus;
use crate::refresh::ws::serve_socket;
use crate::scheduler::Scheduler;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// Services the handlers reach.
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<dyn Database>,
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<Scheduler>,
    pub monitor: Arc<EventMonitor>,
    pub automations: Arc<AutomationEngine>,
    pub refresh: Arc<RefreshBus>,
}

/// An error rendered as `{"error": "..."}` with a mapped status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(error: impl std::fmt::Display) -> Self {
        tracing::error!(error = %error, "Admin request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<SchedulerError> for ApiError {
    fn from(error: SchedulerError) -> Self {
        match error {
            SchedulerError::TaskNotFound(_) => Self::not_found(error.to_string()),
            SchedulerError::InvalidCron(_) => Self::new(StatusCode::BAD_REQUEST, error.to_string()),
            SchedulerError::Database(e) => Self::internal(e),
        }
    }
}

impl From<MonitorError> for ApiError {
    fn from(error: MonitorError) -> Self {
        match error {
            MonitorError::NotFound(_) => Self::not_found(error.to_string()),
            MonitorError::Conflict { .. } => Self::new(StatusCode::CONFLICT, error.to_string()),
            MonitorError::Database(e) => Self::internal(e),
        }
    }
}

impl From<AutomationError> for ApiError {
    fn from(error: AutomationError) -> Self {
        match error {
            AutomationError::NotFound(_) => Self::not_found(error.to_string()),
            AutomationError::Validation(_) => Self::new(StatusCode::BAD_REQUEST, error.to_string()),
            AutomationError::Database(e) => Self::internal(e),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the admin router.
pub fn routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/scheduler/tasks/{id}", patch(update_task).delete(delete_task))
        .route("/scheduler/tasks/{id}/run", post(run_task))
        .route("/scheduler/refresh", post(refresh_scheduler))
        .route("/scheduler/registrations", get(list_registrations))
        .route("/webhooks", get(list_webhooks))
        .route("/webhooks/{id}", get(get_webhook).delete(delete_webhook))
        .route("/webhooks/{id}/retry", post(retry_webhook))
        .route("/automations/{id}/execute", post(execute_automation))
        .route("/events/{event_name}", post(publish_event))
        .route("/companies/{id}/compliance", post(initialize_compliance))
        .route("/ws/refresh", get(refresh_socket))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn run_task(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    state.scheduler.trigger_now(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "task_id": id })),
    ))
}

#[derive(Debug, Deserialize)]
struct TaskUpdate {
    active: Option<bool>,
    cron: Option<String>,
}

async fn update_task(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(update): Json<TaskUpdate>,
) -> ApiResult<impl IntoResponse> {
    if update.active.is_none() && update.cron.is_none() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Nothing to update"));
    }
    let mut task = None;
    if let Some(cron) = update.cron.as_deref() {
        task = Some(state.scheduler.update_task_cron(id, cron).await?);
    }
    if let Some(active) = update.active {
        task = Some(state.scheduler.set_task_active(id, active).await?);
    }
    Ok(Json(task))
}

async fn delete_task(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    state.scheduler.delete_task(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn refresh_scheduler(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let registered = state.scheduler.refresh().await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "registered": registered })),
    ))
}

async fn list_registrations(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.scheduler.list_registrations().await)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_webhooks(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            raw.parse::<EventStatus>()
                .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e))?,
        ),
        None => None,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    Ok(Json(state.monitor.list_events(status, limit).await?))
}

async fn get_webhook(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    let event = state
        .monitor
        .get_event(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Webhook event {id} not found")))?;
    let attempts = state.monitor.list_attempts(id).await?;
    Ok(Json(json!({ "event": event, "attempts": attempts })))
}

async fn delete_webhook(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    if state.monitor.delete(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("Webhook event {id} not found")))
    }
}

async fn retry_webhook(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    let event = state
        .monitor
        .force_retry(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Webhook event {id} not found")))?;
    Ok(Json(event))
}

async fn execute_automation(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let report = state.automations.execute_now(id).await?;
    Ok(Json(json!({
        "status": report.status,
        "result": report.result,
        "error": report.error,
        "started_at": report.started_at,
        "finished_at": report.finished_at,
        "next_run_at": report.next_run_at,
    })))
}

async fn publish_event(
    State(state): State<ApiState>,
    Path(event_name): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let context = if body.iter().all(u8::is_ascii_whitespace) {
        Value::map()
    } else {
        let json: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("Invalid JSON context: {e}")))?;
        Value::from(json)
    };
    let acks = state.automations.handle_event(&event_name, context).await?;
    Ok((StatusCode::ACCEPTED, Json(acks)))
}

async fn initialize_compliance(
    State(state): State<ApiState>,
    Path(company_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let inserted = initialize_company_compliance(state.db.as_ref(), company_id, state.clock.now())
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(json!({ "company_id": company_id, "inserted": inserted })))
}

async fn refresh_socket(State(state): State<ApiState>, ws: WebSocketUpgrade) -> Response {
    let bus = Arc::clone(&state.refresh);
    ws.on_upgrade(move |socket| serve_socket(socket, bus))
}

/// Serves the admin router until shut down.
pub struct AdminServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl AdminServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Bind and spawn the server. Returns the bound address.
    pub async fn start(&mut self, router: Router) -> std::io::Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "Admin API listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);
        self.handle = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::info!("Admin API shutting down");
                })
                .await
            {
                tracing::error!(error = %e, "Admin API server error");
            }
        }));
        Ok(local)
    }

    /// Resolves when the server task ends on its own.
    pub async fn wait(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            let _ = handle.await;
            self.handle = None;
        }
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
