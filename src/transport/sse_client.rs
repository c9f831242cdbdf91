use std::sync::OnceLock;

use async_trait::async_trait;
use reqwest::Url;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{
    event_stream::read_events, InboundChannel, JsonRpcMessage, Lifecycle, Transport,
    TransportKind, TransportState,
};
use crate::{
    error::TransportError,
    services::headers::{apply_headers, HeaderSet},
};

pub(crate) struct SseClientTransport {
    url: Url,
    headers: HeaderSet,
    client: reqwest::Client,
    lifecycle: Lifecycle,
    endpoint: OnceLock<Url>,
    inbound: InboundChannel<JsonRpcMessage>,
}

impl SseClientTransport {
    pub(crate) fn new(client: reqwest::Client, url: Url, headers: HeaderSet) -> Self {
        Self {
            url,
            headers,
            client,
            lifecycle: Lifecycle::new(),
            endpoint: OnceLock::new(),
            inbound: InboundChannel::new(),
        }
    }

    fn spawn_reader(
        &self,
        response: reqwest::Response,
        endpoint_tx: oneshot::Sender<Result<Url, String>>,
    ) {
        let base = self.url.clone();
        let tx = self.inbound.sender();
        let closed = self.lifecycle.close_signal();

        tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            let result = read_events(response, closed.clone(), |event| {
                match event.event.as_str() {
                    "endpoint" => {
                        let resolved = base.join(&event.data).map_err(|error| error.to_string());
                        if let Some(waiter) = endpoint_tx.take() {
                            let _ = waiter.send(resolved);
                        }
                    }
                    "message" => {
                        if let (Some(tx), Some(message)) = (tx.as_ref(), event.message()) {
                            if tx.send(message).is_err() {
                                return false;
                            }
                        }
                    }
                    other => tracing::debug!(event = %other, "ignoring upstream event"),
                }
                true
            })
            .await;

            match result {
                Ok(()) => tracing::info!(url = %base, "upstream event stream ended"),
                Err(error) => tracing::warn!(url = %base, %error, "upstream event stream failed"),
            }
            drop(tx);
            closed.cancel();
        });
    }
}

#[async_trait]
impl Transport for SseClientTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.lifecycle.mark_started()?;

        let response = apply_headers(self.client.get(self.url.clone()), &self.headers)
            .send()
            .await;
        let response = match response {
            Ok(response) => response,
            Err(error) => {
                self.close().await;
                return Err(TransportError::from_request(error));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.close().await;
            return Err(TransportError::from_status(status, body));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        self.spawn_reader(response, endpoint_tx);
        self.inbound.shut();

        let endpoint = match endpoint_rx.await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(error)) => {
                self.close().await;
                return Err(TransportError::Handshake(format!(
                    "invalid endpoint announced by upstream: {error}"
                )));
            }
            Err(_) => {
                self.close().await;
                return Err(TransportError::Handshake(
                    "event stream closed before the endpoint was announced".to_string(),
                ));
            }
        };

        if endpoint.origin() != self.url.origin() {
            self.close().await;
            return Err(TransportError::Handshake(format!(
                "endpoint origin does not match connection origin: {endpoint}"
            )));
        }

        tracing::info!(url = %self.url, %endpoint, "upstream event stream connected");
        let _ = self.endpoint.set(endpoint);
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        self.lifecycle.ensure_started()?;
        if self.lifecycle.is_closed() {
            return Ok(());
        }
        let endpoint = self.endpoint.get().ok_or(TransportError::NotStarted)?;

        let response = apply_headers(self.client.post(endpoint.clone()), &self.headers)
            .json(&message)
            .send()
            .await
            .map_err(TransportError::from_request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status, body));
        }
        Ok(())
    }

    async fn close(&self) {
        if self.lifecycle.begin_close() {
            self.inbound.shut();
            tracing::debug!(url = %self.url, "upstream event stream closed");
        }
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<JsonRpcMessage>> {
        self.inbound.take_receiver()
    }

    fn close_signal(&self) -> CancellationToken {
        self.lifecycle.close_signal()
    }

    fn session_id(&self) -> Option<String> {
        self.endpoint.get().and_then(|endpoint| {
            endpoint
                .query_pairs()
                .find(|(key, _)| key == "sessionId")
                .map(|(_, value)| value.into_owned())
        })
    }
}
