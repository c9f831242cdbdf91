use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::registry::SessionRegistry;
use crate::transport::{
    error_response, is_request, stderr_notification, stdio::EXECUTABLE_MISSING_MARKER,
    JsonRpcMessage, Transport,
};

pub(crate) const RELAY_ERROR_CODE: i64 = -32001;

const EXECUTABLE_MISSING_NOTICE: &str = "Command not found, transports removed";

pub(crate) struct BridgeHandle {
    relay: Arc<Relay>,
}

impl BridgeHandle {
    #[cfg(test)]
    pub(crate) async fn finished(&self) {
        self.relay.finished.cancelled().await;
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.relay.finished.is_cancelled()
    }
}

struct Relay {
    registry: Arc<SessionRegistry>,
    session_id: String,
    downstream: Arc<dyn Transport>,
    upstream: Arc<dyn Transport>,
    stop: CancellationToken,
    torn_down: AtomicBool,
    finished: CancellationToken,
}

impl Relay {
    async fn to_upstream(&self, message: JsonRpcMessage) {
        let request_id = is_request(&message)
            .then(|| message.get("id").cloned())
            .flatten();

        if let Err(error) = self.upstream.send(message).await {
            tracing::warn!(session_id = %self.session_id, %error, "failed to forward client message upstream");
            if let Some(id) = request_id {
                let reply = error_response(id, RELAY_ERROR_CODE, &error.to_string());
                if let Err(error) = self.downstream.send(reply).await {
                    tracing::warn!(session_id = %self.session_id, %error, "failed to report relay error to client");
                }
            }
        }
    }

    async fn to_downstream(&self, message: JsonRpcMessage) {
        if let Err(error) = self.downstream.send(message).await {
            tracing::warn!(session_id = %self.session_id, %error, "failed to forward server message to client");
        }
    }

    // Runs once per session no matter which side triggered it.
    async fn teardown(&self, reason: &str) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.cancel();
        self.upstream.close().await;
        self.downstream.close().await;
        self.registry.remove(&self.session_id).await;
        tracing::info!(session_id = %self.session_id, reason, "session closed");
        self.finished.cancel();
    }
}

pub(crate) fn attach(
    registry: Arc<SessionRegistry>,
    session_id: String,
    downstream: Arc<dyn Transport>,
    upstream: Arc<dyn Transport>,
) -> BridgeHandle {
    let client_inbound = downstream.take_inbound();
    let server_inbound = upstream.take_inbound();
    let diagnostics = upstream.take_diagnostics();

    let relay = Arc::new(Relay {
        registry,
        session_id,
        downstream,
        upstream,
        stop: CancellationToken::new(),
        torn_down: AtomicBool::new(false),
        finished: CancellationToken::new(),
    });

    let diagnostics_task = diagnostics.map(|rx| spawn_diagnostics(relay.clone(), rx));
    spawn_client_to_server(relay.clone(), client_inbound);
    spawn_server_to_client(relay.clone(), server_inbound, diagnostics_task);

    BridgeHandle { relay }
}

fn spawn_client_to_server(
    relay: Arc<Relay>,
    inbound: Option<mpsc::UnboundedReceiver<JsonRpcMessage>>,
) {
    tokio::spawn(async move {
        let Some(mut inbound) = inbound else {
            tracing::warn!(session_id = %relay.session_id, "client inbound already taken");
            relay.teardown("client inbound unavailable").await;
            return;
        };
        let closed = relay.downstream.close_signal();

        loop {
            let message = tokio::select! {
                biased;
                _ = relay.stop.cancelled() => return,
                message = inbound.recv() => message,
                _ = closed.cancelled() => {
                    while let Ok(message) = inbound.try_recv() {
                        relay.to_upstream(message).await;
                    }
                    break;
                }
            };
            match message {
                Some(message) => relay.to_upstream(message).await,
                None => break,
            }
        }

        relay.teardown("client disconnected").await;
    });
}

fn spawn_server_to_client(
    relay: Arc<Relay>,
    inbound: Option<mpsc::UnboundedReceiver<JsonRpcMessage>>,
    diagnostics_task: Option<JoinHandle<()>>,
) {
    tokio::spawn(async move {
        let Some(mut inbound) = inbound else {
            tracing::warn!(session_id = %relay.session_id, "server inbound already taken");
            relay.teardown("server inbound unavailable").await;
            return;
        };
        let closed = relay.upstream.close_signal();

        loop {
            let message = tokio::select! {
                biased;
                _ = relay.stop.cancelled() => return,
                message = inbound.recv() => message,
                _ = closed.cancelled() => {
                    while let Ok(message) = inbound.try_recv() {
                        relay.to_downstream(message).await;
                    }
                    break;
                }
            };
            match message {
                Some(message) => relay.to_downstream(message).await,
                None => break,
            }
        }

        // Whatever the process wrote to stderr before exiting reaches the
        // client ahead of the teardown.
        if let Some(task) = diagnostics_task {
            let _ = task.await;
        }
        relay.teardown("server disconnected").await;
    });
}

fn spawn_diagnostics(relay: Arc<Relay>, mut rx: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let closed = relay.upstream.close_signal();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = relay.stop.cancelled() => return,
                chunk = rx.recv() => chunk,
                _ = closed.cancelled() => {
                    while let Ok(chunk) = rx.try_recv() {
                        if !relay_diagnostic(&relay, chunk).await {
                            return;
                        }
                    }
                    return;
                }
            };
            match chunk {
                Some(chunk) => {
                    if !relay_diagnostic(&relay, chunk).await {
                        return;
                    }
                }
                None => return,
            }
        }
    })
}

async fn relay_diagnostic(relay: &Relay, chunk: String) -> bool {
    if chunk.contains(EXECUTABLE_MISSING_MARKER) {
        tracing::warn!(session_id = %relay.session_id, content = %chunk.trim_end(), "upstream command not found");
        relay
            .to_downstream(stderr_notification(EXECUTABLE_MISSING_NOTICE))
            .await;
        relay.teardown("command not found").await;
        return false;
    }

    tracing::debug!(session_id = %relay.session_id, content = %chunk.trim_end(), "upstream stderr");
    relay.to_downstream(stderr_notification(&chunk)).await;
    true
}
