use std::{
    collections::HashMap,
    env,
    path::{PathBuf, MAIN_SEPARATOR},
    sync::Arc,
    time::Duration,
};

use axum::http::HeaderMap;
use reqwest::Url;
use serde::Deserialize;

use super::headers::{derive_headers, HeaderSet};
use crate::{
    config::parse_env_overrides,
    error::{GatewayError, TransportError},
    transport::{
        SseClientTransport, StdioClientTransport, StreamableHttpClientTransport, Transport,
        TransportKind,
    },
};

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionParams {
    pub(crate) transport_type: Option<String>,
    pub(crate) command: Option<String>,
    pub(crate) args: Option<String>,
    pub(crate) env: Option<String>,
    pub(crate) url: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) enum TransportParams {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    Sse {
        url: Url,
        headers: HeaderSet,
    },
    StreamableHttp {
        url: Url,
        headers: HeaderSet,
    },
}

impl TransportParams {
    pub(crate) fn from_request(
        params: &SessionParams,
        inbound: &HeaderMap,
        default_environment: &HashMap<String, String>,
    ) -> Result<Self, GatewayError> {
        let raw_kind = params.transport_type.as_deref().unwrap_or_default();
        let kind = TransportKind::parse(raw_kind)
            .ok_or_else(|| GatewayError::InvalidTransportKind(raw_kind.to_string()))?;

        match kind {
            TransportKind::Stdio => {
                let command = params
                    .command
                    .as_deref()
                    .map(str::trim)
                    .filter(|command| !command.is_empty())
                    .ok_or_else(|| GatewayError::InvalidParams("command is required".to_string()))?;

                let args = shlex::split(params.args.as_deref().unwrap_or_default())
                    .ok_or_else(|| GatewayError::InvalidParams("invalid args quoting".to_string()))?;

                let overrides = parse_env_overrides(params.env.as_deref().unwrap_or_default())
                    .map_err(GatewayError::InvalidParams)?;
                let mut env = default_environment.clone();
                env.extend(overrides);

                Ok(Self::Stdio {
                    command: resolve_executable(command, &env),
                    args,
                    env,
                })
            }
            TransportKind::Sse => Ok(Self::Sse {
                url: parse_url(params.url.as_deref())?,
                headers: derive_headers(inbound, kind),
            }),
            TransportKind::StreamableHttp => Ok(Self::StreamableHttp {
                url: parse_url(params.url.as_deref())?,
                headers: derive_headers(inbound, kind),
            }),
        }
    }

    pub(crate) fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio { .. } => TransportKind::Stdio,
            Self::Sse { .. } => TransportKind::Sse,
            Self::StreamableHttp { .. } => TransportKind::StreamableHttp,
        }
    }
}

pub(crate) struct TransportFactory {
    client: reqwest::Client,
}

impl TransportFactory {
    pub(crate) fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    pub(crate) async fn build(
        &self,
        params: TransportParams,
    ) -> Result<Arc<dyn Transport>, GatewayError> {
        let kind = params.kind();
        let transport: Arc<dyn Transport> = match params {
            TransportParams::Stdio { command, args, env } => {
                tracing::info!(%command, ?args, "creating stdio upstream");
                Arc::new(StdioClientTransport::new(command, args, env))
            }
            TransportParams::Sse { url, headers } => {
                tracing::info!(%url, headers = ?headers.keys().collect::<Vec<_>>(), "creating sse upstream");
                Arc::new(SseClientTransport::new(self.client.clone(), url, headers))
            }
            TransportParams::StreamableHttp { url, headers } => {
                tracing::info!(%url, headers = ?headers.keys().collect::<Vec<_>>(), "creating streamable-http upstream");
                Arc::new(StreamableHttpClientTransport::new(
                    self.client.clone(),
                    url,
                    headers,
                ))
            }
        };

        match transport.start().await {
            Ok(()) => Ok(transport),
            Err(TransportError::NotFound { status }) if kind == TransportKind::Sse => {
                Err(GatewayError::UpstreamNotFound { status })
            }
            Err(error) => Err(error.into()),
        }
    }
}

fn parse_url(raw: Option<&str>) -> Result<Url, GatewayError> {
    let raw = raw
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .ok_or_else(|| GatewayError::InvalidParams("url is required".to_string()))?;
    Url::parse(raw).map_err(|error| GatewayError::InvalidParams(format!("invalid url: {error}")))
}

fn resolve_executable(command: &str, env: &HashMap<String, String>) -> String {
    if command.contains('/') || command.contains(MAIN_SEPARATOR) {
        return command.to_string();
    }

    let search_path = env
        .get("PATH")
        .cloned()
        .or_else(|| env::var("PATH").ok());
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    match which::which_in(command, search_path, cwd) {
        Ok(path) => path.to_string_lossy().into_owned(),
        Err(_) => command.to_string(),
    }
}
