mod config;
mod error;
mod services;
mod transport;

use std::{sync::Arc, time::Instant};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use crate::{
    config::GatewayConfig,
    error::GatewayError,
    services::{Gateway, SessionParams},
    transport::{DownstreamKind, InboundRequest, SESSION_ID_HEADER},
};

#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
    started_at: Instant,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageQuery {
    session_id: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match GatewayConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(error) => {
            tracing::error!("{error}");
            std::process::exit(1);
        }
    };

    let gateway = match Gateway::new(config.clone()) {
        Ok(gateway) => Arc::new(gateway),
        Err(error) => {
            tracing::error!(%error, "failed to build upstream http client");
            std::process::exit(1);
        }
    };

    let state = AppState {
        gateway,
        started_at: Instant::now(),
    };

    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(error) if error.kind() == std::io::ErrorKind::AddrInUse => {
            tracing::error!(%bind_addr, "gateway port is already in use");
            std::process::exit(1);
        }
        Err(error) => {
            tracing::error!(%bind_addr, %error, "failed to bind");
            std::process::exit(1);
        }
    };

    tracing::info!(%bind_addr, "mcp gateway listening");

    if let Err(error) = axum::serve(listener, router(state)).await {
        tracing::error!(%error, "server error");
        std::process::exit(1);
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/stdio", get(stdio_handler))
        .route("/sse", get(sse_handler))
        .route("/message", post(message_handler))
        .route(
            "/mcp",
            get(mcp_stream_handler)
                .post(mcp_post_handler)
                .delete(mcp_delete_handler),
        )
        .route("/health", get(health_handler))
        .route("/config", get(config_handler))
        .route("/api/mcp/status", get(status_handler))
        .layer(middleware::map_response(expose_session_header))
        .with_state(state)
}

async fn expose_session_header(mut response: Response) -> Response {
    response.headers_mut().insert(
        "access-control-expose-headers",
        HeaderValue::from_static(SESSION_ID_HEADER),
    );
    response
}

async fn stdio_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SessionParams>,
) -> Response {
    tracing::info!(command = ?params.command, "new stdio connection request");
    open_event_stream(&state, &headers, &params).await
}

async fn sse_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SessionParams>,
) -> Response {
    tracing::info!(url = ?params.url, "new sse connection request");
    open_event_stream(&state, &headers, &params).await
}

async fn open_event_stream(state: &AppState, headers: &HeaderMap, params: &SessionParams) -> Response {
    match state
        .gateway
        .create_session(params, headers, DownstreamKind::Sse)
        .await
    {
        Ok(session) => session.downstream.handle(InboundRequest::OpenStream),
        Err(error) => error.into_response(),
    }
}

async fn message_handler(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    Json(body): Json<Value>,
) -> Response {
    let session_id = query.session_id.unwrap_or_default();
    tracing::debug!(%session_id, "client message");
    state
        .gateway
        .deliver(&session_id, InboundRequest::Post(body))
        .await
        .into_response()
}

async fn mcp_post_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SessionParams>,
    Json(body): Json<Value>,
) -> Response {
    if let Some(session_id) = session_header(&headers) {
        return state
            .gateway
            .deliver(&session_id, InboundRequest::Post(body))
            .await
            .into_response();
    }

    tracing::info!(url = ?params.url, "new streamable-http connection request");
    match state
        .gateway
        .create_session(&params, &headers, DownstreamKind::StreamableHttp)
        .await
    {
        Ok(session) => {
            tracing::debug!(session_id = %session.session_id, "streamable-http session opened");
            session.downstream.handle(InboundRequest::Post(body))
        }
        Err(error) => error.into_response(),
    }
}

async fn mcp_stream_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session_id = session_header(&headers).unwrap_or_default();
    state
        .gateway
        .deliver(&session_id, InboundRequest::OpenStream)
        .await
        .into_response()
}

async fn mcp_delete_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(session_id) = session_header(&headers) else {
        return GatewayError::InvalidParams(format!("{SESSION_ID_HEADER} header is required"))
            .into_response();
    };
    match state.gateway.terminate_session(&session_id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(error) => error.into_response(),
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "at": Utc::now().to_rfc3339(),
        "uptimeSec": state.started_at.elapsed().as_secs(),
    }))
}

async fn config_handler(State(state): State<AppState>) -> Json<Value> {
    let config = state.gateway.config();
    Json(json!({
        "defaultEnvironment": config.default_environment,
        "defaultCommand": config.default_command,
        "defaultArgs": config.default_args,
    }))
}

async fn status_handler(State(state): State<AppState>) -> Json<Value> {
    let active_sessions = state.gateway.list_active_sessions().await;
    let sessions = state.gateway.session_summaries().await;
    let session_count = active_sessions.len();
    let message = if session_count > 0 {
        format!("{session_count} active MCP session(s)")
    } else {
        "No active MCP sessions".to_string()
    };

    Json(json!({
        "connected": session_count > 0,
        "sessionCount": session_count,
        "activeSessions": active_sessions,
        "sessions": sessions,
        "message": message,
    }))
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
