/**
 * API REST SHELLGATE - Serveur HTTP du kernel
 *
 * RÔLE :
 * Interface entre les appelants (dashboard, CLI, scripts) et les devices.
 * Chaque route délègue au registre ou au dispatcher.
 *
 * ROUTES :
 * - GET    /health                                          santé du kernel
 * - GET    /devices, POST /devices, DELETE /devices/{id}    registre
 * - POST   /devices/{id}/commands/{command_id}/execute      ExecuteCommand
 * - GET    /devices/{id}/commands                           ListCommands
 * - POST   /devices/{id}/reload                             ReloadConfig
 * - GET    /devices/{id}/health                             HealthCheck manuel
 *
 * SÉCURITÉ :
 * - Header x-api-key exigé sur toutes les routes sauf /health, si une clé
 *   est configurée
 * - Le PIN voyage dans `x-pin`, jamais dans l'URL
 * - Erreurs : `{kind, message}` avec le code HTTP associé au `ErrorKind`
 */

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use shellgate_shared::contracts::{ExecuteCommandRequest, PIN_HEADER};
use shellgate_shared::{ErrorBody, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::dispatcher::{CallContext, CommandDispatcher, DispatchError};
use crate::health::HealthTracker;
use crate::registry::RegistryError;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<CommandDispatcher>,
    pub health_tracker: HealthTracker,
    pub api_key: Option<Arc<str>>,
}

#[derive(Debug, Clone)]
struct ClientKey(String);

#[derive(Debug, Deserialize)]
struct AddDeviceBody {
    device_id: String,
    address: String,
}

/// Erreur HTTP : code dérivé du `ErrorKind`, corps JSON `ErrorBody`
pub struct ApiError(ErrorBody);

impl ApiError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self(ErrorBody::new(kind, message))
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        let output = e.partial_output().map(str::to_string);
        let body = ErrorBody::new(e.kind(), e.to_string());
        Self(match output {
            Some(output) => body.with_output(output),
            None => body,
        })
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0)).into_response()
    }
}

async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // Health check toujours accessible
    if path == "/health" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = state.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    let ok = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!("rejected request to {} without a valid API key", path);
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

async fn track_client(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    state.health_tracker.record_request();
    let key = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    req.extensions_mut().insert(ClientKey(key));
    next.run(req).await
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/devices", get(list_devices).post(add_device))
        .route("/devices/{id}", delete(remove_device))
        .route("/devices/{id}/commands", get(list_commands))
        .route("/devices/{id}/commands/{command_id}/execute", post(execute_command))
        .route("/devices/{id}/reload", post(reload_device))
        .route("/devices/{id}/health", get(probe_device))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .layer(middleware::from_fn_with_state(app_state.clone(), track_client))
        .with_state(app_state)
}

fn call_context(key: ClientKey, headers: &HeaderMap) -> CallContext {
    let pin = headers
        .get(PIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    CallContext::new(key.0, pin)
}

// GET /health
async fn get_health(State(app): State<AppState>) -> impl IntoResponse {
    let dispatcher = &app.dispatcher;
    Json(
        app.health_tracker
            .get_health(dispatcher.registry(), dispatcher.gate().tracked_clients())
            .await,
    )
}

// GET /devices
async fn list_devices(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.dispatcher.registry().list().await)
}

// POST /devices
async fn add_device(State(app): State<AppState>, Json(body): Json<AddDeviceBody>) -> Result<Response, ApiError> {
    if body.device_id.trim().is_empty() {
        return Err(ApiError::new(ErrorKind::InvalidRequest, "device_id must not be empty"));
    }
    let view = app
        .dispatcher
        .registry()
        .add_connection(&body.device_id, &body.address)
        .await?;
    Ok((StatusCode::CREATED, Json(view)).into_response())
}

// DELETE /devices/{id}
async fn remove_device(State(app): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    app.dispatcher.registry().remove_connection(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// POST /devices/{id}/commands/{command_id}/execute
async fn execute_command(
    State(app): State<AppState>,
    Extension(key): Extension<ClientKey>,
    Path((id, command_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: ExecuteCommandRequest = if body.is_empty() {
        ExecuteCommandRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(e) => {
                return Err(ApiError::new(ErrorKind::InvalidRequest, format!("invalid request body: {}", e)));
            }
        }
    };

    let ctx = call_context(key, &headers);
    let timeout = request.timeout_seconds.map(Duration::from_secs);
    let result = app.dispatcher.execute(&ctx, &id, &command_id, timeout).await?;
    Ok(Json(result).into_response())
}

// GET /devices/{id}/commands
async fn list_commands(
    State(app): State<AppState>,
    Extension(key): Extension<ClientKey>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = call_context(key, &headers);
    Ok(Json(app.dispatcher.list(&ctx, &id).await?).into_response())
}

// POST /devices/{id}/reload
async fn reload_device(
    State(app): State<AppState>,
    Extension(key): Extension<ClientKey>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = call_context(key, &headers);
    Ok(Json(app.dispatcher.reload(&ctx, &id).await?).into_response())
}

// GET /devices/{id}/health
async fn probe_device(
    State(app): State<AppState>,
    Extension(key): Extension<ClientKey>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = call_context(key, &headers);
    Ok(Json(app.dispatcher.probe(&ctx, &id).await?).into_response())
}
