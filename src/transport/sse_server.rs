use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use axum::{
    http::StatusCode,
    response::{sse::Event, Response},
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    downstream::{event_stream_response, message_event, plain},
    InboundChannel, JsonRpcMessage, Lifecycle, Transport, TransportKind, TransportState,
};
use crate::error::TransportError;

pub(crate) const MESSAGE_ENDPOINT: &str = "/message";

pub(crate) struct SseServerTransport {
    session_id: String,
    lifecycle: Lifecycle,
    outbound: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    stream: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    inbound: InboundChannel<JsonRpcMessage>,
}

impl SseServerTransport {
    pub(crate) fn new(session_id: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            session_id,
            lifecycle: Lifecycle::new(),
            outbound: Mutex::new(Some(tx)),
            stream: Mutex::new(Some(rx)),
            inbound: InboundChannel::new(),
        }
    }

    fn push_event(&self, event: Event) -> bool {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    pub(crate) fn open_stream(&self) -> Response {
        let rx = self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match rx {
            Some(rx) => {
                let guard = self.lifecycle.close_signal().drop_guard();
                event_stream_response(rx, Some(guard))
            }
            None => plain(StatusCode::CONFLICT, "Event stream already open"),
        }
    }

    pub(crate) fn handle_post(&self, body: Value) -> Response {
        if self.lifecycle.ensure_started().is_err() || self.lifecycle.is_closed() {
            return plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                "SSE connection not established",
            );
        }
        if !body.is_object() {
            return plain(StatusCode::BAD_REQUEST, "Invalid message");
        }
        if !self.inbound.push(body) {
            return plain(StatusCode::INTERNAL_SERVER_ERROR, "Session closing");
        }
        plain(StatusCode::ACCEPTED, "Accepted")
    }
}

#[async_trait]
impl Transport for SseServerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.lifecycle.mark_started()?;
        let endpoint = format!("{MESSAGE_ENDPOINT}?sessionId={}", self.session_id);
        self.push_event(Event::default().event("endpoint").data(endpoint));
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        self.lifecycle.ensure_started()?;
        if self.lifecycle.is_closed() {
            return Ok(());
        }
        if let Some(event) = message_event(&message) {
            if !self.push_event(event) {
                tracing::debug!(session_id = %self.session_id, "client stream gone, message dropped");
            }
        }
        Ok(())
    }

    async fn close(&self) {
        if !self.lifecycle.begin_close() {
            return;
        }
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inbound.shut();
        tracing::debug!(session_id = %self.session_id, "client event stream closed");
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<JsonRpcMessage>> {
        self.inbound.take_receiver()
    }

    fn close_signal(&self) -> CancellationToken {
        self.lifecycle.close_signal()
    }

    fn session_id(&self) -> Option<String> {
        Some(self.session_id.clone())
    }
}
