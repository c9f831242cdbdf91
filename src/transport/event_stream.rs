use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use super::JsonRpcMessage;
use crate::error::TransportError;

pub(crate) const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub(crate) event: String,
    pub(crate) data: String,
    pub(crate) id: Option<String>,
}

impl SseEvent {
    pub(crate) fn is_message(&self) -> bool {
        self.event == "message"
    }

    pub(crate) fn message(&self) -> Option<JsonRpcMessage> {
        match serde_json::from_str(&self.data) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::warn!(%error, data = %self.data, "dropping undecodable event-stream message");
                None
            }
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let raw = self.buffer.drain(..=newline).collect::<Vec<_>>();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches('\n').trim_end_matches('\r');

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                "id" => self.id = Some(value.to_string()),
                _ => {}
            }
        }

        events
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "message".to_string()),
            data,
            id: self.id.clone(),
        })
    }
}

// Reads an event-stream response until it ends, `token` fires or
// `on_event` returns `false`.
pub(crate) async fn read_events<F>(
    response: reqwest::Response,
    token: CancellationToken,
    mut on_event: F,
) -> Result<(), TransportError>
where
    F: FnMut(SseEvent) -> bool,
{
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    loop {
        let chunk = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for event in decoder.feed(&bytes) {
                    if !on_event(event) {
                        return Ok(());
                    }
                }
            }
            Some(Err(error)) => return Err(TransportError::Http(error)),
            None => return Ok(()),
        }
    }
}

pub(crate) fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with(EVENT_STREAM_CONTENT_TYPE))
}
