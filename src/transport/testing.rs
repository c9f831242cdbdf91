use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    InboundChannel, JsonRpcMessage, Lifecycle, Transport, TransportKind, TransportState,
};
use crate::error::TransportError;

pub(crate) struct ChannelTransport {
    kind: TransportKind,
    lifecycle: Lifecycle,
    inbound: InboundChannel<JsonRpcMessage>,
    diagnostics: Option<InboundChannel<String>>,
    sent: mpsc::UnboundedSender<JsonRpcMessage>,
    fail_sends: bool,
}

pub(crate) struct ChannelHandle {
    pub(crate) inbound: mpsc::UnboundedSender<JsonRpcMessage>,
    pub(crate) sent: mpsc::UnboundedReceiver<JsonRpcMessage>,
    pub(crate) diagnostics: Option<mpsc::UnboundedSender<String>>,
    closed: CancellationToken,
}

impl ChannelHandle {
    pub(crate) fn hang_up(&self) {
        self.closed.cancel();
    }
}

impl ChannelTransport {
    pub(crate) fn started(kind: TransportKind) -> (Arc<Self>, ChannelHandle) {
        Self::build(kind, false, false)
    }

    pub(crate) fn with_diagnostics(kind: TransportKind) -> (Arc<Self>, ChannelHandle) {
        Self::build(kind, true, false)
    }

    pub(crate) fn failing_sends(kind: TransportKind) -> (Arc<Self>, ChannelHandle) {
        Self::build(kind, false, true)
    }

    fn build(kind: TransportKind, diagnostics: bool, fail_sends: bool) -> (Arc<Self>, ChannelHandle) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let inbound = InboundChannel::new();
        let diagnostics = diagnostics.then(InboundChannel::new);
        let lifecycle = Lifecycle::new();
        let _ = lifecycle.mark_started();

        let handle = ChannelHandle {
            inbound: inbound.sender().expect("fresh channel has a sender"),
            sent: sent_rx,
            diagnostics: diagnostics.as_ref().and_then(InboundChannel::sender),
            closed: lifecycle.close_signal(),
        };
        if let Some(channel) = diagnostics.as_ref() {
            channel.shut();
        }
        inbound.shut();

        let transport = Arc::new(Self {
            kind,
            lifecycle,
            inbound,
            diagnostics,
            sent: sent_tx,
            fail_sends,
        });
        (transport, handle)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.lifecycle.mark_started()
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        if self.lifecycle.is_closed() {
            return Ok(());
        }
        if self.fail_sends {
            return Err(TransportError::Handshake("peer rejected message".to_string()));
        }
        let _ = self.sent.send(message);
        Ok(())
    }

    async fn close(&self) {
        self.lifecycle.begin_close();
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<JsonRpcMessage>> {
        self.inbound.take_receiver()
    }

    fn close_signal(&self) -> CancellationToken {
        self.lifecycle.close_signal()
    }

    fn take_diagnostics(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.diagnostics.as_ref().and_then(InboundChannel::take_receiver)
    }
}

pub(crate) async fn serve_router(router: axum::Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}
