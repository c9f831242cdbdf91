use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::{
    error::GatewayError,
    transport::{Downstream, Transport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) enum SessionState {
    Initializing,
    Active,
    Terminating,
    Closed,
}

struct SessionEntry {
    downstream: Downstream,
    upstream: Arc<dyn Transport>,
    created_at: DateTime<Utc>,
    sequence: u64,
    state: SessionState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionSummary {
    pub(crate) session_id: String,
    pub(crate) transport_type: &'static str,
    pub(crate) upstream_session_id: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) state: SessionState,
}

pub(crate) struct SessionRegistry {
    next_sequence: AtomicU64,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_sequence: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn register(
        &self,
        session_id: &str,
        downstream: Downstream,
        upstream: Arc<dyn Transport>,
    ) -> Result<(), GatewayError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session_id) {
            return Err(GatewayError::DuplicateSession(session_id.to_string()));
        }
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                downstream,
                upstream,
                created_at: Utc::now(),
                sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
                state: SessionState::Initializing,
            },
        );
        Ok(())
    }

    pub(crate) async fn activate(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(entry) if entry.state == SessionState::Initializing => {
                entry.state = SessionState::Active;
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn lookup_downstream(&self, session_id: &str) -> Result<Downstream, GatewayError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .filter(|entry| entry.state != SessionState::Terminating)
            .map(|entry| entry.downstream.clone())
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))
    }

    pub(crate) async fn lookup_upstream(
        &self,
        session_id: &str,
    ) -> Result<Arc<dyn Transport>, GatewayError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .filter(|entry| entry.state != SessionState::Terminating)
            .map(|entry| entry.upstream.clone())
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))
    }

    // Claims a session for termination. Only one caller wins; everyone else
    // sees `SessionNotFound`.
    pub(crate) async fn begin_termination(
        &self,
        session_id: &str,
    ) -> Result<(Downstream, Arc<dyn Transport>), GatewayError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(entry) if entry.state != SessionState::Terminating => {
                entry.state = SessionState::Terminating;
                Ok((entry.downstream.clone(), entry.upstream.clone()))
            }
            _ => Err(GatewayError::SessionNotFound(session_id.to_string())),
        }
    }

    pub(crate) async fn remove(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    pub(crate) async fn state(&self, session_id: &str) -> SessionState {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.state)
            .unwrap_or(SessionState::Closed)
    }

    pub(crate) async fn list(&self) -> Vec<String> {
        self.summaries()
            .await
            .into_iter()
            .map(|summary| summary.session_id)
            .collect()
    }

    pub(crate) async fn summaries(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut entries = sessions.iter().collect::<Vec<_>>();
        entries.sort_by_key(|(_, entry)| entry.sequence);
        entries
            .into_iter()
            .map(|(session_id, entry)| SessionSummary {
                session_id: session_id.clone(),
                transport_type: entry.upstream.kind().as_str(),
                upstream_session_id: entry.upstream.session_id(),
                created_at: entry.created_at,
                state: entry.state,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{SessionRegistry, SessionState};
    use crate::{
        error::GatewayError,
        transport::{testing::ChannelTransport, Downstream, DownstreamKind, TransportKind},
    };

    async fn register(registry: &SessionRegistry, id: &str) -> Result<(), GatewayError> {
        let (upstream, _handle) = ChannelTransport::started(TransportKind::Stdio);
        registry
            .register(id, Downstream::new(DownstreamKind::Sse, id.to_string()), upstream)
            .await
    }

    #[tokio::test]
    async fn register_lookup_remove() {
        let registry = SessionRegistry::new();
        register(&registry, "a").await.expect("register");
        assert_eq!(registry.state("a").await, SessionState::Initializing);
        assert!(registry.activate("a").await);
        assert_eq!(registry.state("a").await, SessionState::Active);

        let downstream = registry.lookup_downstream("a").await.expect("downstream");
        assert_eq!(downstream.transport().session_id().as_deref(), Some("a"));
        assert!(registry.lookup_upstream("a").await.is_ok());

        assert!(registry.remove("a").await);
        assert!(!registry.remove("a").await);
        assert!(matches!(
            registry.lookup_upstream("a").await,
            Err(GatewayError::SessionNotFound(_))
        ));
        assert_eq!(registry.state("a").await, SessionState::Closed);
    }

    #[tokio::test]
    async fn duplicate_registration_leaves_first_entry_untouched() {
        let registry = SessionRegistry::new();
        register(&registry, "a").await.expect("first");
        registry.activate("a").await;

        let error = register(&registry, "a").await.expect_err("duplicate");
        assert!(matches!(error, GatewayError::DuplicateSession(_)));
        assert_eq!(registry.state("a").await, SessionState::Active);
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicate_registration_has_one_winner() {
        let registry = Arc::new(SessionRegistry::new());
        let attempts = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { register(&registry, "shared").await })
            })
            .collect::<Vec<_>>();

        let mut won = 0;
        let mut duplicates = 0;
        for attempt in attempts {
            match attempt.await.expect("task") {
                Ok(()) => won += 1,
                Err(GatewayError::DuplicateSession(_)) => duplicates += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(won, 1);
        assert_eq!(duplicates, 7);
        assert_eq!(registry.list().await, vec!["shared".to_string()]);
    }

    #[tokio::test]
    async fn termination_is_claimed_once() {
        let registry = SessionRegistry::new();
        register(&registry, "a").await.expect("register");

        assert!(registry.begin_termination("a").await.is_ok());
        assert_eq!(registry.state("a").await, SessionState::Terminating);
        assert!(matches!(
            registry.begin_termination("a").await,
            Err(GatewayError::SessionNotFound(_))
        ));
        assert!(registry.lookup_downstream("a").await.is_err());
    }

    #[tokio::test]
    async fn lists_sessions_in_registration_order() {
        let registry = SessionRegistry::new();
        for id in ["c", "a", "b"] {
            register(&registry, id).await.expect("register");
        }
        assert_eq!(registry.list().await, vec!["c", "a", "b"]);

        let summaries = registry.summaries().await;
        assert_eq!(summaries[0].transport_type, "stdio");
    }
}
