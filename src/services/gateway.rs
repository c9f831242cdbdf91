use std::sync::Arc;

use axum::{http::HeaderMap, response::Response};
use uuid::Uuid;

use super::{
    bridge,
    factory::{SessionParams, TransportFactory, TransportParams},
    registry::{SessionRegistry, SessionSummary},
};
use crate::{
    config::GatewayConfig,
    error::GatewayError,
    transport::{Downstream, DownstreamKind, InboundRequest, Transport, TransportState},
};

pub(crate) struct SessionHandle {
    pub(crate) session_id: String,
    pub(crate) downstream: Downstream,
}

pub(crate) struct Gateway {
    config: Arc<GatewayConfig>,
    registry: Arc<SessionRegistry>,
    factory: TransportFactory,
}

impl Gateway {
    pub(crate) fn new(config: Arc<GatewayConfig>) -> Result<Self, reqwest::Error> {
        let factory = TransportFactory::new(config.request_timeout)?;
        Ok(Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            factory,
        })
    }

    pub(crate) fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub(crate) async fn create_session(
        &self,
        params: &SessionParams,
        headers: &HeaderMap,
        kind: DownstreamKind,
    ) -> Result<SessionHandle, GatewayError> {
        let params = TransportParams::from_request(params, headers, &self.config.default_environment)?;
        let upstream_kind = params.kind();
        let upstream = self.factory.build(params).await.map_err(|error| {
            tracing::error!(transport = upstream_kind.as_str(), %error, "failed to connect upstream");
            error
        })?;

        self.open_session(Uuid::new_v4().to_string(), upstream, kind)
            .await
    }

    pub(crate) async fn open_session(
        &self,
        session_id: String,
        upstream: Arc<dyn Transport>,
        kind: DownstreamKind,
    ) -> Result<SessionHandle, GatewayError> {
        let downstream = Downstream::new(kind, session_id.clone());
        let client = downstream.transport();

        if let Err(error) = client.start().await {
            upstream.close().await;
            return Err(error.into());
        }

        if let Err(error) = self
            .registry
            .register(&session_id, downstream.clone(), upstream.clone())
            .await
        {
            tracing::warn!(%session_id, %error, "session registration rejected");
            upstream.close().await;
            client.close().await;
            return Err(error);
        }

        let upstream_kind = upstream.kind();
        let bridge = bridge::attach(self.registry.clone(), session_id.clone(), client, upstream);
        if bridge.is_finished() || !self.registry.activate(&session_id).await {
            let state = self.registry.state(&session_id).await;
            tracing::debug!(%session_id, ?state, "session closed before activation");
        }

        tracing::info!(
            %session_id,
            upstream = upstream_kind.as_str(),
            downstream = ?downstream.kind(),
            "session established"
        );
        Ok(SessionHandle {
            session_id,
            downstream,
        })
    }

    pub(crate) async fn deliver(
        &self,
        session_id: &str,
        request: InboundRequest,
    ) -> Result<Response, GatewayError> {
        let downstream = self.registry.lookup_downstream(session_id).await?;
        if matches!(request, InboundRequest::Post(_)) {
            let upstream = self.registry.lookup_upstream(session_id).await?;
            if upstream.state() == TransportState::Closed {
                return Err(GatewayError::SessionNotFound(session_id.to_string()));
            }
        }
        Ok(downstream.handle(request))
    }

    pub(crate) async fn terminate_session(&self, session_id: &str) -> Result<(), GatewayError> {
        let (downstream, upstream) = self.registry.begin_termination(session_id).await?;

        if let Err(error) = upstream.terminate().await {
            tracing::warn!(%session_id, %error, "upstream termination handshake failed");
        }
        downstream.transport().close().await;
        self.registry.remove(session_id).await;

        tracing::info!(%session_id, "session terminated");
        Ok(())
    }

    pub(crate) async fn list_active_sessions(&self) -> Vec<String> {
        self.registry.list().await
    }

    pub(crate) async fn session_summaries(&self) -> Vec<SessionSummary> {
        self.registry.summaries().await
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{
        http::{HeaderMap, StatusCode},
        response::Response,
    };
    use futures_util::StreamExt;
    use serde_json::json;
    use tokio::time::{sleep, timeout};

    use super::Gateway;
    use crate::{
        config::GatewayConfig,
        error::GatewayError,
        services::{factory::SessionParams, registry::SessionState},
        transport::{
            testing::ChannelTransport, DownstreamKind, InboundRequest, Transport, TransportKind,
            TransportState,
        },
    };

    fn gateway() -> Gateway {
        Gateway::new(Arc::new(GatewayConfig::default())).expect("gateway")
    }

    fn stdio(command: &str, args: &str) -> SessionParams {
        SessionParams {
            transport_type: Some("stdio".to_string()),
            command: Some(command.to_string()),
            args: Some(args.to_string()),
            ..SessionParams::default()
        }
    }

    async fn drain(response: Response) -> String {
        let body = response.into_body().into_data_stream();
        timeout(
            Duration::from_secs(10),
            body.map(|frame| String::from_utf8_lossy(&frame.expect("bytes")).to_string())
                .collect::<Vec<_>>(),
        )
        .await
        .expect("stream ends")
        .concat()
    }

    async fn wait_until_gone(gateway: &Gateway, session_id: &str) {
        timeout(Duration::from_secs(10), async {
            while gateway.registry.state(session_id).await != SessionState::Closed {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("session removed");
    }

    #[tokio::test]
    async fn live_process_session_stays_active_until_terminated() {
        let gateway = gateway();
        let session = gateway
            .create_session(&stdio("cat", ""), &HeaderMap::new(), DownstreamKind::Sse)
            .await
            .expect("create");

        sleep(Duration::from_millis(100)).await;
        assert_eq!(
            gateway.registry.state(&session.session_id).await,
            SessionState::Active
        );
        assert_eq!(
            gateway.list_active_sessions().await,
            vec![session.session_id.clone()]
        );

        gateway
            .terminate_session(&session.session_id)
            .await
            .expect("terminate");
        assert!(gateway.list_active_sessions().await.is_empty());
        assert_eq!(
            session.downstream.transport().state(),
            TransportState::Closed
        );
        assert!(matches!(
            gateway.terminate_session(&session.session_id).await,
            Err(GatewayError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn messages_round_trip_through_a_process() {
        let gateway = gateway();
        let session = gateway
            .create_session(&stdio("cat", ""), &HeaderMap::new(), DownstreamKind::Sse)
            .await
            .expect("create");

        let stream = gateway
            .deliver(&session.session_id, InboundRequest::OpenStream)
            .await
            .expect("stream");
        let accepted = gateway
            .deliver(
                &session.session_id,
                InboundRequest::Post(json!({"jsonrpc": "2.0", "method": "notifications/hello"})),
            )
            .await
            .expect("post");
        assert_eq!(accepted.status(), StatusCode::ACCEPTED);

        let mut body = stream.into_body().into_data_stream();
        let mut seen = String::new();
        timeout(Duration::from_secs(5), async {
            while !seen.contains("notifications/hello") {
                let frame = body.next().await.expect("frame").expect("bytes");
                seen.push_str(&String::from_utf8_lossy(&frame));
            }
        })
        .await
        .expect("echoed back");
        assert!(seen.contains(&format!("/message?sessionId={}", session.session_id)));

        gateway
            .terminate_session(&session.session_id)
            .await
            .expect("terminate");
    }

    #[tokio::test]
    async fn missing_executable_notifies_and_removes_the_session() {
        let gateway = gateway();
        let session = gateway
            .create_session(
                &stdio("nonexistent-binary-xyz", ""),
                &HeaderMap::new(),
                DownstreamKind::Sse,
            )
            .await
            .expect("soft failure still creates the session");

        let stream = session.downstream.handle(InboundRequest::OpenStream);
        let events = drain(stream).await;
        assert_eq!(events.matches("Command not found, transports removed").count(), 1);

        wait_until_gone(&gateway, &session.session_id).await;
        assert!(matches!(
            gateway
                .deliver(&session.session_id, InboundRequest::OpenStream)
                .await,
            Err(GatewayError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn exiting_process_closes_without_missing_executable_notice() {
        let gateway = gateway();
        let session = gateway
            .create_session(&stdio("echo", "hello"), &HeaderMap::new(), DownstreamKind::Sse)
            .await
            .expect("create");

        let events = drain(session.downstream.handle(InboundRequest::OpenStream)).await;
        assert!(!events.contains("Command not found"));
        wait_until_gone(&gateway, &session.session_id).await;
    }

    #[tokio::test]
    async fn establishment_failures_leave_no_entry() {
        let gateway = gateway();
        let params = SessionParams {
            transport_type: Some("carrier-pigeon".to_string()),
            ..SessionParams::default()
        };
        let error = gateway
            .create_session(&params, &HeaderMap::new(), DownstreamKind::Sse)
            .await
            .err()
            .expect("invalid kind");
        assert!(matches!(error, GatewayError::InvalidTransportKind(_)));
        assert_eq!(error.status_code(), 400);
        assert!(gateway.list_active_sessions().await.is_empty());

        assert!(matches!(
            gateway.deliver("missing", InboundRequest::OpenStream).await,
            Err(GatewayError::SessionNotFound(_))
        ));
        assert!(matches!(
            gateway.terminate_session("missing").await,
            Err(GatewayError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_session_id_is_rejected_and_cleaned_up() {
        let gateway = gateway();
        let (first, _first_handle) = ChannelTransport::started(TransportKind::Stdio);
        let (second, _second_handle) = ChannelTransport::started(TransportKind::Stdio);

        gateway
            .open_session("fixed".to_string(), first.clone(), DownstreamKind::Sse)
            .await
            .expect("first");
        let error = gateway
            .open_session("fixed".to_string(), second.clone(), DownstreamKind::Sse)
            .await
            .err()
            .expect("duplicate");

        assert!(matches!(error, GatewayError::DuplicateSession(_)));
        assert_eq!(error.status_code(), 409);
        assert_eq!(second.state(), TransportState::Closed);
        assert_eq!(first.state(), TransportState::Started);
        assert_eq!(gateway.registry.state("fixed").await, SessionState::Active);
    }

    #[tokio::test]
    async fn streamable_downstream_answers_on_the_post_stream() {
        let gateway = gateway();
        let (upstream, mut server) = ChannelTransport::started(TransportKind::StreamableHttp);
        let session = gateway
            .open_session("web-1".to_string(), upstream, DownstreamKind::StreamableHttp)
            .await
            .expect("open");

        let response = gateway
            .deliver(
                &session.session_id,
                InboundRequest::Post(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"})),
            )
            .await
            .expect("post");
        assert_eq!(response.status(), StatusCode::OK);

        let forwarded = server.sent.recv().await.expect("forwarded");
        assert_eq!(forwarded["method"], "tools/list");
        server
            .inbound
            .send(json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}}))
            .expect("reply");

        let events = drain(response).await;
        assert!(events.contains("\"tools\":[]"));
    }

    #[tokio::test]
    async fn terminate_returns_while_process_ignores_stdin() {
        let gateway = gateway();
        let session = gateway
            .create_session(&stdio("sleep", "30"), &HeaderMap::new(), DownstreamKind::Sse)
            .await
            .expect("create");
        let stream = session.downstream.handle(InboundRequest::OpenStream);

        let padding = "x".repeat(512 * 1024);
        let accepted = gateway
            .deliver(
                &session.session_id,
                InboundRequest::Post(json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/message",
                    "params": {"padding": padding}
                })),
            )
            .await
            .expect("post");
        assert_eq!(accepted.status(), StatusCode::ACCEPTED);
        sleep(Duration::from_millis(300)).await;

        timeout(
            Duration::from_secs(5),
            gateway.terminate_session(&session.session_id),
        )
        .await
        .expect("terminate within timeout")
        .expect("terminate");
        assert_eq!(
            gateway.registry.state(&session.session_id).await,
            SessionState::Closed
        );
        drop(stream);
    }

    #[tokio::test]
    async fn posts_to_a_closed_upstream_are_not_found() {
        let gateway = gateway();
        let (upstream, _handle) = ChannelTransport::started(TransportKind::Stdio);
        gateway
            .open_session("gone".to_string(), upstream.clone(), DownstreamKind::Sse)
            .await
            .expect("open");

        upstream.close().await;
        assert!(matches!(
            gateway
                .deliver("gone", InboundRequest::Post(json!({"jsonrpc": "2.0", "method": "ping"})))
                .await,
            Err(GatewayError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_terminations_have_one_winner() {
        let gateway = Arc::new(gateway());
        let (upstream, _handle) = ChannelTransport::started(TransportKind::Sse);
        gateway
            .open_session("race".to_string(), upstream, DownstreamKind::Sse)
            .await
            .expect("open");

        let attempts = (0..4)
            .map(|_| {
                let gateway = gateway.clone();
                tokio::spawn(async move { gateway.terminate_session("race").await })
            })
            .collect::<Vec<_>>();
        let mut won = 0;
        for attempt in attempts {
            if attempt.await.expect("task").is_ok() {
                won += 1;
            }
        }
        assert_eq!(won, 1);
        assert!(gateway.list_active_sessions().await.is_empty());
    }
}
