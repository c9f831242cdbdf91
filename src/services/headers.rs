use std::collections::BTreeMap;

use axum::http::HeaderMap;

use crate::transport::TransportKind;

pub(crate) type HeaderSet = BTreeMap<String, String>;

pub(crate) const CUSTOM_AUTH_HEADER: &str = "x-custom-auth-header";

const SSE_HEADERS_PASSTHROUGH: &[&str] = &["authorization"];
const STREAMABLE_HTTP_HEADERS_PASSTHROUGH: &[&str] =
    &["authorization", "mcp-session-id", "last-event-id"];

pub(crate) fn derive_headers(inbound: &HeaderMap, kind: TransportKind) -> HeaderSet {
    let (accept, passthrough) = match kind {
        TransportKind::Sse => ("text/event-stream", SSE_HEADERS_PASSTHROUGH),
        TransportKind::StreamableHttp => (
            "text/event-stream, application/json",
            STREAMABLE_HTTP_HEADERS_PASSTHROUGH,
        ),
        TransportKind::Stdio => return HeaderSet::new(),
    };

    let mut headers = HeaderSet::new();
    headers.insert("Accept".to_string(), accept.to_string());

    for name in passthrough {
        if let Some(value) = last_value(inbound, name) {
            headers.insert((*name).to_string(), value);
        }
    }

    if let Some(custom_name) = last_value(inbound, CUSTOM_AUTH_HEADER) {
        let custom_name = custom_name.trim();
        if !custom_name.is_empty() {
            if let Some(value) = last_value(inbound, &custom_name.to_ascii_lowercase()) {
                headers.insert(custom_name.to_string(), value);
            }
        }
    }

    headers
}

pub(crate) fn apply_headers(
    mut builder: reqwest::RequestBuilder,
    headers: &HeaderSet,
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
}

fn last_value(inbound: &HeaderMap, name: &str) -> Option<String> {
    inbound
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .last()
        .map(str::to_string)
}
