use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum TransportError {
    #[error("upstream rejected the request as unauthorized (status {status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("upstream endpoint not found (status {status})")]
    NotFound { status: u16 },

    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("transport already started")]
    AlreadyStarted,

    #[error("transport not started")]
    NotStarted,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub(crate) fn from_request(error: reqwest::Error) -> Self {
        if error.is_connect() {
            Self::Unreachable(error.to_string())
        } else {
            Self::Http(error)
        }
    }

    pub(crate) fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        match status.as_u16() {
            401 => Self::Unauthorized {
                status: 401,
                message: body,
            },
            404 => Self::NotFound { status: 404 },
            status => Self::Status { status, body },
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum GatewayError {
    #[error("invalid transport type specified: {0}")]
    InvalidTransportKind(String),

    #[error("invalid session parameters: {0}")]
    InvalidParams(String),

    #[error("upstream unauthorized: {message}")]
    UpstreamUnauthorized { status: u16, message: String },

    #[error("upstream returned not found; does the server support SSE?")]
    UpstreamNotFound { status: u16 },

    #[error("connection refused; is the upstream server running? ({0})")]
    UpstreamUnreachable(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already registered: {0}")]
    DuplicateSession(String),

    #[error(transparent)]
    Transport(TransportError),
}

impl GatewayError {
    pub(crate) fn status_code(&self) -> u16 {
        match self {
            Self::InvalidTransportKind(_) | Self::InvalidParams(_) => 400,
            Self::UpstreamUnauthorized { status, .. } | Self::UpstreamNotFound { status } => {
                *status
            }
            Self::SessionNotFound(_) => 404,
            Self::DuplicateSession(_) => 409,
            Self::UpstreamUnreachable(_) | Self::Transport(_) => 500,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTransportKind(_) => "invalid_transport_kind",
            Self::InvalidParams(_) => "invalid_params",
            Self::UpstreamUnauthorized { .. } => "upstream_unauthorized",
            Self::UpstreamNotFound { .. } => "upstream_not_found",
            Self::UpstreamUnreachable(_) => "upstream_unreachable",
            Self::SessionNotFound(_) => "session_not_found",
            Self::DuplicateSession(_) => "duplicate_session",
            Self::Transport(_) => "transport_error",
        }
    }
}

impl From<TransportError> for GatewayError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Unauthorized { status, message } => {
                Self::UpstreamUnauthorized { status, message }
            }
            TransportError::Unreachable(message) => Self::UpstreamUnreachable(message),
            other => Self::Transport(other),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(json!({
                "error": self.kind(),
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}
