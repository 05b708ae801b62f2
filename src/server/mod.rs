// Request Surface
// HTTP endpoints, the WebSocket upgrade, and the security layers: body
// size cap, per-IP rate limiting on /api, and a CSP response header.

pub mod rate_limit;

use crate::analyzer::{self, Advisory};
use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::pins::PinRecord;
use crate::session::messages::Inbound;
use crate::session::SessionManager;
use crate::sketch::{self, HeaderTab, SourceBundle};
use crate::toolchain::{Toolchain, ToolchainError};
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path as UrlPath, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use self::rate_limit::RateLimiter;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;

/// Shared handler state. The toolchain and runtime source here are the
/// same instances the session manager compiles with.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub manager: Arc<SessionManager>,
    pub toolchain: Arc<dyn Toolchain>,
    pub runtime_source: Arc<String>,
    pub limiter: Arc<RateLimiter>,
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/compile", post(compile_handler))
        .route("/api/upload", post(upload_handler))
        .route("/api/examples", get(examples_handler))
        .route("/api/health", get(health_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(RequestBodyLimitLayer::new(state.config.max_body_bytes));

    Router::new()
        .merge(api)
        .route("/examples/*path", get(example_file_handler))
        .route("/ws", get(ws_handler))
        .layer(SetResponseHeaderLayer::overriding(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(
                "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; connect-src 'self' ws: wss:",
            ),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn rate_limit_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !state.config.disable_rate_limit {
        // ConnectInfo is absent under test harnesses; only enforce when
        // the listener provided a peer address
        let ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip());
        if let Some(ip) = ip {
            if !state.limiter.check(ip) {
                return (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
            }
        }
    }
    next.run(req).await
}

// ==================== Compile ====================

#[derive(Debug, Clone, Deserialize)]
pub struct CompileRequest {
    pub code: String,
    #[serde(default)]
    pub headers: Vec<HeaderTab>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileResponse {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub errors: Option<String>,
    pub parser_messages: Vec<Advisory>,
    pub io_registry: Vec<PinRecord>,
    pub processed_code: String,
}

async fn compile_handler(
    State(state): State<AppState>,
    body: Result<Json<CompileRequest>, JsonRejection>,
) -> Result<Json<CompileResponse>, ApiError> {
    let Json(request) =
        body.map_err(|e| ApiError::bad_request(format!("Malformed request: {}", e)))?;
    Ok(Json(run_compile_request(&state, request).await?))
}

async fn upload_handler(
    State(_state): State<AppState>,
    body: Result<Json<CompileRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(_request) =
        body.map_err(|e| ApiError::bad_request(format!("Malformed request: {}", e)))?;
    // The simulator has no board to flash; accepting the sketch is the
    // whole upload
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Shared by the HTTP endpoint and kept deliberately artifact-free: a
/// stateless compile that reports diagnostics and advisories only.
async fn run_compile_request(
    state: &AppState,
    request: CompileRequest,
) -> Result<CompileResponse, ApiError> {
    let bundle = SourceBundle::new(request.code.clone(), request.headers);

    let source = request.code.clone();
    let analysis = tokio::task::spawn_blocking(move || {
        (analyzer::analyze(&source), analyzer::static_registry(&source))
    });

    let unit = match sketch::merge(&bundle, &state.runtime_source) {
        Ok(unit) => unit,
        Err(e) => {
            let (report, registry) = analysis.await.unwrap_or_default();
            return Ok(CompileResponse {
                success: false,
                output: String::new(),
                errors: Some(format!("Compilation failed: {}", e)),
                parser_messages: report.advisories,
                io_registry: registry.pins,
                processed_code: request.code,
            });
        }
    };

    let (outcome, analysis) = tokio::join!(state.toolchain.compile(&unit, &bundle), analysis);
    let (report, registry) = analysis.unwrap_or_default();

    match outcome {
        Ok(outcome) => Ok(CompileResponse {
            success: outcome.success,
            output: outcome.output,
            errors: if outcome.diagnostics.trim().is_empty() {
                None
            } else {
                Some(outcome.diagnostics)
            },
            parser_messages: report.advisories,
            io_registry: registry.pins,
            processed_code: unit.processed_code,
        }),
        Err(ToolchainError::Unavailable(msg)) => Ok(CompileResponse {
            success: false,
            output: String::new(),
            errors: Some(format!("Toolchain unavailable: {}", msg)),
            parser_messages: report.advisories,
            io_registry: registry.pins,
            processed_code: unit.processed_code,
        }),
        Err(e) => Err(ApiError::internal(state.config.env, e)),
    }
}

// ==================== Examples ====================

async fn examples_handler(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    let dir = state.config.examples_dir.clone();
    let env = state.config.env;
    let list = tokio::task::spawn_blocking(move || list_examples(&dir))
        .await
        .map_err(|e| ApiError::internal(env, e))?
        .map_err(|e| ApiError::internal(env, e))?;
    Ok(Json(list))
}

fn list_examples(root: &Path) -> std::io::Result<Vec<String>> {
    let mut found = Vec::new();
    if !root.exists() {
        return Ok(found);
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "ino") {
                if let Ok(rel) = path.strip_prefix(root) {
                    found.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
    }
    found.sort();
    Ok(found)
}

async fn example_file_handler(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
) -> Result<Response, ApiError> {
    // Serve strictly from inside the examples dir
    if path.contains('\\')
        || path
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(ApiError::bad_request("Invalid example path"));
    }

    let full = state.config.examples_dir.join(&path);
    match tokio::fs::read_to_string(&full).await {
        Ok(content) => Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            content,
        )
            .into_response()),
        Err(_) => Err(ApiError::not_found()),
    }
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

// ==================== WebSocket ====================

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let manager = state.manager.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, manager))
}

/// Session lifetime == socket lifetime. The writer task merges the
/// session's unicast queue with the compile-status broadcast.
pub async fn handle_socket(socket: WebSocket, manager: Arc<SessionManager>) {
    let (session, mut unicast_rx, mut broadcast_rx) = manager.register();
    let session_id = session.id;
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                unicast = unicast_rx.recv() => match unicast {
                    Some(frame) => frame,
                    None => break,
                },
                bcast = broadcast_rx.recv() => match bcast {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("session {}: {} broadcast frames skipped", session_id, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    log::error!("frame serialization failed: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<Inbound>(&text) {
                Ok(frame) => manager.dispatch(&session, frame).await,
                // Invalid frames are logged and dropped; the connection
                // stays up
                Err(e) => log::warn!("session {}: invalid frame dropped: {}", session_id, e),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    manager.remove(session_id).await;
    writer.abort();
}
