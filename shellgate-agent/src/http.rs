//! Agent HTTP surface
//!
//! Serves the four calls to the kernel:
//! - `POST /api/v1/commands/{id}/execute` (PIN via `x-pin`, deadline via `x-request-timeout-ms`)
//! - `GET  /api/v1/commands` (`?category=`), `GET /api/v1/commands/homepage`
//! - `POST /api/v1/reload`
//! - `GET  /api/v1/health`
//!
//! Rate limiting is keyed by the caller's IP address, captured by a
//! middleware from the connection info. Errors answer `{kind, message}`.

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use shellgate_shared::contracts::{
    ExecuteCommandRequest, COMMANDS_PATH, DEADLINE_HEADER, EXECUTE_ROUTE, HEALTH_PATH, HOMEPAGE_PATH,
    PIN_HEADER, RELOAD_PATH, REQUEST_ID_HEADER,
};
use shellgate_shared::{ErrorBody, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::execution::ExecutionError;
use crate::service::{AgentError, AgentService, CallContext};

pub type AgentState = Arc<AgentService>;

/// Rate-limit key of the current caller
#[derive(Debug, Clone)]
struct ClientKey(String);

#[derive(Debug, Deserialize)]
struct ListParams {
    category: Option<String>,
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = match self {
            AgentError::Execution(ExecutionError::Timeout { ref output, .. }) => {
                let output = output.clone();
                ErrorBody::new(kind, self.to_string()).with_output(output)
            }
            other => ErrorBody::new(kind, other.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

async fn client_key(mut req: Request, next: Next) -> Response {
    let key = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    req.extensions_mut().insert(ClientKey(key));
    next.run(req).await
}

pub fn build_router(service: AgentState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(COMMANDS_PATH, get(list_commands))
        .route(HOMEPAGE_PATH, get(homepage_commands))
        .route(EXECUTE_ROUTE, post(execute_command))
        .route(RELOAD_PATH, post(reload_config))
        .with_state(service)
        .layer(middleware::from_fn(client_key))
}

fn call_context(key: ClientKey, headers: &HeaderMap) -> CallContext {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);

    if let Some(request_id) = header(REQUEST_ID_HEADER) {
        debug!("request {} from {}", request_id, key.0);
    }

    CallContext {
        client_key: key.0,
        pin: header(PIN_HEADER),
        deadline: header(DEADLINE_HEADER)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis),
    }
}

// POST /api/v1/commands/{id}/execute
async fn execute_command(
    State(service): State<AgentState>,
    Extension(key): Extension<ClientKey>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: ExecuteCommandRequest = if body.is_empty() {
        ExecuteCommandRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(e) => {
                let body = ErrorBody::new(ErrorKind::InvalidRequest, format!("invalid request body: {}", e));
                return (StatusCode::BAD_REQUEST, Json(body)).into_response();
            }
        }
    };

    let ctx = call_context(key, &headers);
    let requested = request.timeout_seconds.map(Duration::from_secs);
    match service.execute(&ctx, &id, requested).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => e.into_response(),
    }
}

// GET /api/v1/commands
async fn list_commands(
    State(service): State<AgentState>,
    Extension(key): Extension<ClientKey>,
    Query(params): Query<ListParams>,
    headers: HeaderMap,
) -> Response {
    let ctx = call_context(key, &headers);
    match service.list(&ctx, params.category.as_deref()) {
        Ok(list) => Json(list).into_response(),
        Err(e) => e.into_response(),
    }
}

// GET /api/v1/commands/homepage
async fn homepage_commands(
    State(service): State<AgentState>,
    Extension(key): Extension<ClientKey>,
    headers: HeaderMap,
) -> Response {
    let ctx = call_context(key, &headers);
    match service.homepage(&ctx) {
        Ok(list) => Json(list).into_response(),
        Err(e) => e.into_response(),
    }
}

// POST /api/v1/reload
async fn reload_config(
    State(service): State<AgentState>,
    Extension(key): Extension<ClientKey>,
    headers: HeaderMap,
) -> Response {
    let ctx = call_context(key, &headers);
    match service.reload(&ctx) {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => e.into_response(),
    }
}

// GET /api/v1/health
async fn health(State(service): State<AgentState>) -> Response {
    Json(service.health()).into_response()
}
