use std::{convert::Infallible, sync::Arc};

use axum::{
    http::{HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures_util::stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

use super::{
    JsonRpcMessage, SseServerTransport, StreamableHttpServerTransport, Transport,
    SESSION_ID_HEADER,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DownstreamKind {
    Sse,
    StreamableHttp,
}

#[derive(Debug)]
pub(crate) enum InboundRequest {
    OpenStream,
    Post(Value),
}

#[derive(Clone)]
pub(crate) enum Downstream {
    Sse(Arc<SseServerTransport>),
    StreamableHttp(Arc<StreamableHttpServerTransport>),
}

impl Downstream {
    pub(crate) fn new(kind: DownstreamKind, session_id: String) -> Self {
        match kind {
            DownstreamKind::Sse => Self::Sse(Arc::new(SseServerTransport::new(session_id))),
            DownstreamKind::StreamableHttp => Self::StreamableHttp(Arc::new(
                StreamableHttpServerTransport::new(session_id),
            )),
        }
    }

    pub(crate) fn kind(&self) -> DownstreamKind {
        match self {
            Self::Sse(_) => DownstreamKind::Sse,
            Self::StreamableHttp(_) => DownstreamKind::StreamableHttp,
        }
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        match self {
            Self::Sse(transport) => transport.clone(),
            Self::StreamableHttp(transport) => transport.clone(),
        }
    }

    pub(crate) fn handle(&self, request: InboundRequest) -> Response {
        match (self, request) {
            (Self::Sse(transport), InboundRequest::OpenStream) => transport.open_stream(),
            (Self::Sse(transport), InboundRequest::Post(body)) => transport.handle_post(body),
            (Self::StreamableHttp(transport), InboundRequest::OpenStream) => {
                transport.open_stream()
            }
            (Self::StreamableHttp(transport), InboundRequest::Post(body)) => {
                transport.handle_post(body)
            }
        }
    }
}

pub(crate) fn message_event(message: &JsonRpcMessage) -> Option<Event> {
    match serde_json::to_string(message) {
        Ok(data) => Some(Event::default().event("message").data(data)),
        Err(error) => {
            tracing::warn!(%error, "failed to serialize downstream message");
            None
        }
    }
}

pub(crate) fn event_stream_response(
    rx: mpsc::UnboundedReceiver<Event>,
    guard: Option<DropGuard>,
) -> Response {
    let events = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        Some((Ok::<_, Infallible>(event), (rx, guard)))
    });
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

pub(crate) fn with_session_header(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    response
}

pub(crate) fn plain(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
}
