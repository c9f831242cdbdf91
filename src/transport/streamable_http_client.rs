use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, PoisonError,
};

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    event_stream::{is_event_stream, read_events},
    InboundChannel, JsonRpcMessage, Lifecycle, Transport, TransportKind, TransportState,
    SESSION_ID_HEADER,
};
use crate::{error::TransportError, services::headers::HeaderSet};

const INITIALIZED_NOTIFICATION: &str = "notifications/initialized";

pub(crate) struct StreamableHttpClientTransport {
    url: Url,
    headers: HeaderSet,
    client: reqwest::Client,
    lifecycle: Lifecycle,
    session_id: Mutex<Option<String>>,
    inbound: InboundChannel<JsonRpcMessage>,
    standalone_requested: AtomicBool,
}

impl StreamableHttpClientTransport {
    pub(crate) fn new(client: reqwest::Client, url: Url, headers: HeaderSet) -> Self {
        Self {
            url,
            headers,
            client,
            lifecycle: Lifecycle::new(),
            session_id: Mutex::new(None),
            inbound: InboundChannel::new(),
            standalone_requested: AtomicBool::new(false),
        }
    }

    fn request(&self, method: Method) -> reqwest::RequestBuilder {
        let session_id = self.session_id();
        let mut builder = self.client.request(method, self.url.clone());
        for (name, value) in &self.headers {
            if session_id.is_some() && name.eq_ignore_ascii_case(SESSION_ID_HEADER) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(session_id) = session_id {
            builder = builder.header(SESSION_ID_HEADER, session_id);
        }
        builder
    }

    fn capture_session_id(&self, response: &reqwest::Response) {
        let Some(value) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
        else {
            return;
        };
        let mut session_id = self
            .session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if session_id.as_deref() != Some(value) {
            tracing::info!(url = %self.url, session_id = %value, "upstream session established");
            *session_id = Some(value.to_string());
        }
    }

    fn spawn_stream_reader(&self, response: reqwest::Response) {
        let Some(tx) = self.inbound.sender() else {
            return;
        };
        let closed = self.lifecycle.close_signal();
        let url = self.url.clone();
        tokio::spawn(async move {
            let result = read_events(response, closed, |event| {
                if !event.is_message() {
                    return true;
                }
                match event.message() {
                    Some(message) => tx.send(message).is_ok(),
                    None => true,
                }
            })
            .await;
            if let Err(error) = result {
                tracing::warn!(%url, %error, "upstream response stream failed");
            }
        });
    }

    fn open_standalone_stream(&self) {
        if self.standalone_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        let request = self.request(Method::GET);
        let Some(tx) = self.inbound.sender() else {
            return;
        };
        let closed = self.lifecycle.close_signal();
        let url = self.url.clone();

        tokio::spawn(async move {
            let response = match request.send().await {
                Ok(response) => response,
                Err(error) => {
                    tracing::warn!(%url, %error, "failed to open upstream standalone stream");
                    return;
                }
            };
            if response.status() == StatusCode::METHOD_NOT_ALLOWED {
                tracing::debug!(%url, "upstream has no standalone stream");
                return;
            }
            if !response.status().is_success() {
                tracing::warn!(%url, status = %response.status(), "upstream refused standalone stream");
                return;
            }
            let result = read_events(response, closed, |event| match event.message() {
                Some(message) if event.is_message() => tx.send(message).is_ok(),
                _ => true,
            })
            .await;
            if let Err(error) = result {
                tracing::warn!(%url, %error, "upstream standalone stream failed");
            }
        });
    }

    fn push_json_body(&self, body: Value) {
        match body {
            Value::Array(messages) => {
                for message in messages {
                    self.inbound.push(message);
                }
            }
            message => {
                self.inbound.push(message);
            }
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpClientTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.lifecycle.mark_started()?;
        tracing::info!(url = %self.url, "streamable http upstream ready");
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        self.lifecycle.ensure_started()?;
        if self.lifecycle.is_closed() {
            return Ok(());
        }

        let response = self
            .request(Method::POST)
            .json(&message)
            .send()
            .await
            .map_err(TransportError::from_request)?;
        self.capture_session_id(&response);

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status, body));
        }

        if status == StatusCode::ACCEPTED {
            if message.get("method").and_then(Value::as_str) == Some(INITIALIZED_NOTIFICATION) {
                self.open_standalone_stream();
            }
            return Ok(());
        }

        if is_event_stream(&response) {
            self.spawn_stream_reader(response);
            return Ok(());
        }

        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        let body = serde_json::from_slice::<Value>(&bytes)?;
        self.push_json_body(body);
        Ok(())
    }

    async fn close(&self) {
        if self.lifecycle.begin_close() {
            self.inbound.shut();
            tracing::debug!(url = %self.url, "streamable http upstream closed");
        }
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<JsonRpcMessage>> {
        self.inbound.take_receiver()
    }

    fn close_signal(&self) -> CancellationToken {
        self.lifecycle.close_signal()
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn terminate(&self) -> Result<(), TransportError> {
        let result = match self.session_id() {
            Some(session_id) if !self.lifecycle.is_closed() => {
                match self.request(Method::DELETE).send().await {
                    Ok(response)
                        if response.status().is_success()
                            || response.status() == StatusCode::METHOD_NOT_ALLOWED =>
                    {
                        tracing::info!(url = %self.url, %session_id, "upstream session terminated");
                        Ok(())
                    }
                    Ok(response) => {
                        let status = response.status();
                        let body = response.text().await.unwrap_or_default();
                        Err(TransportError::from_status(status, body))
                    }
                    Err(error) => Err(TransportError::from_request(error)),
                }
            }
            _ => Ok(()),
        };
        self.close().await;
        result
    }
}
