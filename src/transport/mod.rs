pub(crate) mod downstream;
pub(crate) mod event_stream;
pub(crate) mod sse_client;
pub(crate) mod sse_server;
pub(crate) mod stdio;
pub(crate) mod streamable_http_client;
pub(crate) mod streamable_http_server;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

pub(crate) use downstream::{Downstream, DownstreamKind, InboundRequest};
pub(crate) use sse_client::SseClientTransport;
pub(crate) use sse_server::SseServerTransport;
pub(crate) use stdio::StdioClientTransport;
pub(crate) use streamable_http_client::StreamableHttpClientTransport;
pub(crate) use streamable_http_server::StreamableHttpServerTransport;

pub(crate) type JsonRpcMessage = Value;

pub(crate) const SESSION_ID_HEADER: &str = "mcp-session-id";
pub(crate) const STDERR_NOTIFICATION_METHOD: &str = "notifications/stderr";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

impl TransportKind {
    pub(crate) fn parse(raw: &str) -> Option<Self> {
        match raw {
            "stdio" => Some(Self::Stdio),
            "sse" => Some(Self::Sse),
            "streamable-http" => Some(Self::StreamableHttp),
            _ => None,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable-http",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportState {
    Created,
    Started,
    Closed,
}

#[async_trait]
pub(crate) trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn state(&self) -> TransportState;

    async fn start(&self) -> Result<(), TransportError>;

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError>;

    async fn close(&self);

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<JsonRpcMessage>>;

    fn close_signal(&self) -> CancellationToken;

    fn take_diagnostics(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        None
    }

    fn session_id(&self) -> Option<String> {
        None
    }

    async fn terminate(&self) -> Result<(), TransportError> {
        self.close().await;
        Ok(())
    }
}

pub(crate) struct Lifecycle {
    state: Mutex<TransportState>,
    closed: CancellationToken,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TransportState::Created),
            closed: CancellationToken::new(),
        }
    }

    pub(crate) fn state(&self) -> TransportState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn mark_started(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            TransportState::Created => {
                *state = TransportState::Started;
                Ok(())
            }
            TransportState::Started | TransportState::Closed => Err(TransportError::AlreadyStarted),
        }
    }

    // Moves to `Closed` and fires the close signal. Returns `true` only for
    // the caller that performed the transition.
    pub(crate) fn begin_close(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == TransportState::Closed {
            return false;
        }
        *state = TransportState::Closed;
        drop(state);
        self.closed.cancel();
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.state() == TransportState::Closed
    }

    pub(crate) fn ensure_started(&self) -> Result<(), TransportError> {
        match self.state() {
            TransportState::Created => Err(TransportError::NotStarted),
            TransportState::Started | TransportState::Closed => Ok(()),
        }
    }

    pub(crate) fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }
}

pub(crate) struct InboundChannel<T> {
    sender: Mutex<Option<mpsc::UnboundedSender<T>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
}

impl<T> InboundChannel<T> {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn sender(&self) -> Option<mpsc::UnboundedSender<T>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn push(&self, item: T) -> bool {
        match self.sender() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    pub(crate) fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<T>> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn shut(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

pub(crate) fn is_request(message: &JsonRpcMessage) -> bool {
    message.get("method").is_some() && message.get("id").is_some_and(|id| !id.is_null())
}

pub(crate) fn is_response(message: &JsonRpcMessage) -> bool {
    message.get("method").is_none()
        && message.get("id").is_some()
        && (message.get("result").is_some() || message.get("error").is_some())
}

// Stable map key for a JSON-RPC id; numbers and strings never collide.
pub(crate) fn request_id_key(message: &JsonRpcMessage) -> Option<String> {
    message.get("id").filter(|id| !id.is_null()).map(Value::to_string)
}

pub(crate) fn stderr_notification(content: &str) -> JsonRpcMessage {
    json!({
        "jsonrpc": "2.0",
        "method": STDERR_NOTIFICATION_METHOD,
        "params": {
            "content": content,
        }
    })
}

pub(crate) fn error_response(id: Value, code: i64, message: &str) -> JsonRpcMessage {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message,
        }
    })
}
