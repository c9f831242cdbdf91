use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use axum::{
    http::StatusCode,
    response::{sse::Event, IntoResponse, Response},
    Json,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    downstream::{event_stream_response, message_event, plain, with_session_header},
    error_response, is_request, is_response, request_id_key, InboundChannel, JsonRpcMessage,
    Lifecycle, Transport, TransportKind, TransportState,
};
use crate::error::TransportError;

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;

struct ResponseStream {
    sender: mpsc::UnboundedSender<Event>,
    outstanding: usize,
}

#[derive(Default)]
struct StreamTable {
    next_key: u64,
    pending: HashMap<String, u64>,
    responses: HashMap<u64, ResponseStream>,
    standalone: Option<mpsc::UnboundedSender<Event>>,
}

impl StreamTable {
    fn open_response_stream(
        &mut self,
        request_ids: &[String],
    ) -> Option<mpsc::UnboundedReceiver<Event>> {
        let unique = request_ids.iter().collect::<HashSet<_>>();
        if unique.len() != request_ids.len()
            || request_ids.iter().any(|id| self.pending.contains_key(id))
        {
            return None;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let key = self.next_key;
        self.next_key += 1;
        for id in request_ids {
            self.pending.insert(id.clone(), key);
        }
        self.responses.insert(
            key,
            ResponseStream {
                sender: tx,
                outstanding: request_ids.len(),
            },
        );
        Some(rx)
    }

    fn deliver_response(&mut self, id: &str, event: Event) -> Option<Event> {
        let Some(key) = self.pending.remove(id) else {
            return Some(event);
        };
        let Some(stream) = self.responses.get_mut(&key) else {
            return None;
        };
        let _ = stream.sender.send(event);
        stream.outstanding = stream.outstanding.saturating_sub(1);
        if stream.outstanding == 0 {
            self.responses.remove(&key);
        }
        None
    }

    fn deliver_standalone(&mut self, event: Event) -> bool {
        match self.standalone.as_ref() {
            Some(tx) if tx.send(event).is_ok() => true,
            Some(_) => {
                self.standalone = None;
                false
            }
            None => false,
        }
    }
}

pub(crate) struct StreamableHttpServerTransport {
    session_id: String,
    lifecycle: Lifecycle,
    inbound: InboundChannel<JsonRpcMessage>,
    streams: Mutex<StreamTable>,
}

impl StreamableHttpServerTransport {
    pub(crate) fn new(session_id: String) -> Self {
        Self {
            session_id,
            lifecycle: Lifecycle::new(),
            inbound: InboundChannel::new(),
            streams: Mutex::new(StreamTable::default()),
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, StreamTable> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rpc_error(&self, status: StatusCode, code: i64, message: &str) -> Response {
        with_session_header(
            (status, Json(error_response(Value::Null, code, message))).into_response(),
            &self.session_id,
        )
    }

    pub(crate) fn handle_post(&self, body: Value) -> Response {
        if self.lifecycle.ensure_started().is_err() || self.lifecycle.is_closed() {
            return plain(StatusCode::NOT_FOUND, "Session not found");
        }

        let messages = match body {
            Value::Array(messages) if !messages.is_empty() => messages,
            message @ Value::Object(_) => vec![message],
            _ => {
                return self.rpc_error(
                    StatusCode::BAD_REQUEST,
                    PARSE_ERROR,
                    "Parse error: expected a JSON-RPC message or batch",
                )
            }
        };
        if messages.iter().any(|message| !message.is_object()) {
            return self.rpc_error(
                StatusCode::BAD_REQUEST,
                INVALID_REQUEST,
                "Invalid Request: batch entries must be objects",
            );
        }

        let request_ids = messages
            .iter()
            .filter(|message| is_request(message))
            .filter_map(request_id_key)
            .collect::<Vec<_>>();

        if request_ids.is_empty() {
            for message in messages {
                self.inbound.push(message);
            }
            return with_session_header(StatusCode::ACCEPTED.into_response(), &self.session_id);
        }

        // Registered before the requests go upstream.
        let Some(rx) = self.table().open_response_stream(&request_ids) else {
            return self.rpc_error(
                StatusCode::BAD_REQUEST,
                INVALID_REQUEST,
                "Invalid Request: request id already in flight",
            );
        };
        for message in messages {
            self.inbound.push(message);
        }
        with_session_header(event_stream_response(rx, None), &self.session_id)
    }

    pub(crate) fn open_stream(&self) -> Response {
        if self.lifecycle.ensure_started().is_err() || self.lifecycle.is_closed() {
            return plain(StatusCode::NOT_FOUND, "Session not found");
        }

        let mut table = self.table();
        if table.standalone.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return plain(
                StatusCode::CONFLICT,
                "Only one standalone stream is allowed per session",
            );
        }
        let (tx, rx) = mpsc::unbounded_channel();
        table.standalone = Some(tx);
        drop(table);

        with_session_header(event_stream_response(rx, None), &self.session_id)
    }
}

#[async_trait]
impl Transport for StreamableHttpServerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.lifecycle.mark_started()
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        self.lifecycle.ensure_started()?;
        if self.lifecycle.is_closed() {
            return Ok(());
        }
        let Some(event) = message_event(&message) else {
            return Ok(());
        };

        let mut table = self.table();
        let unrouted = match request_id_key(&message) {
            Some(id) if is_response(&message) => table.deliver_response(&id, event),
            _ => Some(event),
        };
        if let Some(event) = unrouted {
            if !table.deliver_standalone(event) {
                tracing::warn!(
                    session_id = %self.session_id,
                    method = ?message.get("method"),
                    "no open client stream for server message, dropped"
                );
            }
        }
        Ok(())
    }

    async fn close(&self) {
        if !self.lifecycle.begin_close() {
            return;
        }
        *self.table() = StreamTable::default();
        self.inbound.shut();
        tracing::debug!(session_id = %self.session_id, "client session closed");
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
