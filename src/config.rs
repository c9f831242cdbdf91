use std::{collections::HashMap, env, time::Duration};

const INHERITED_ENV_VARS: &[&str] = &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const MIN_REQUEST_TIMEOUT_MS: u64 = 100;
const MAX_REQUEST_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Clone)]
pub(crate) struct GatewayConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) default_environment: HashMap<String, String>,
    pub(crate) default_command: String,
    pub(crate) default_args: String,
    pub(crate) request_timeout: Duration,
}

impl GatewayConfig {
    pub(crate) fn from_env() -> Result<Self, String> {
        let host = env::var("GATEWAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = match env::var("PORT") {
            Ok(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| format!("PORT must be a valid port number, got \"{raw}\""))?,
            Err(_) => 6277,
        };

        let mut default_environment = inherited_environment();
        if let Ok(raw) = env::var("MCP_ENV_VARS") {
            default_environment.extend(parse_env_overrides(&raw)?);
        }

        let default_command = env::var("MCP_DEFAULT_COMMAND").unwrap_or_default();
        let default_args = env::var("MCP_DEFAULT_ARGS").unwrap_or_default();
        let request_timeout = parse_timeout_ms(env::var("MCP_SERVER_REQUEST_TIMEOUT_MS").ok());

        Ok(Self {
            host,
            port,
            default_environment,
            default_command,
            default_args,
            request_timeout,
        })
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6277,
            default_environment: HashMap::new(),
            default_command: String::new(),
            default_args: String::new(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

fn inherited_environment() -> HashMap<String, String> {
    INHERITED_ENV_VARS
        .iter()
        .filter_map(|name| {
            env::var(name)
                .ok()
                .filter(|value| !value.starts_with("()"))
                .map(|value| (name.to_string(), value))
        })
        .collect()
}

pub(crate) fn parse_env_overrides(raw: &str) -> Result<HashMap<String, String>, String> {
    if raw.trim().is_empty() {
        return Ok(HashMap::new());
    }
    serde_json::from_str::<HashMap<String, String>>(raw)
        .map_err(|error| format!("environment overrides must be a JSON object of strings: {error}"))
}

fn parse_timeout_ms(raw: Option<String>) -> Duration {
    let millis = raw
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS)
        .clamp(MIN_REQUEST_TIMEOUT_MS, MAX_REQUEST_TIMEOUT_MS);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{parse_env_overrides, parse_timeout_ms};

    #[test]
    fn env_overrides_accept_objects_of_strings() {
        let parsed = parse_env_overrides(r#"{"API_KEY":"abc","DEBUG":"1"}"#).expect("parse");
        assert_eq!(parsed.get("API_KEY").map(String::as_str), Some("abc"));
        assert_eq!(parsed.len(), 2);

        assert!(parse_env_overrides("").expect("empty").is_empty());
        assert!(parse_env_overrides("[1,2]").is_err());
        assert!(parse_env_overrides(r#"{"N":1}"#).is_err());
    }

    #[test]
    fn timeout_is_clamped() {
        assert_eq!(parse_timeout_ms(None), Duration::from_millis(10_000));
        assert_eq!(parse_timeout_ms(Some("5".to_string())), Duration::from_millis(100));
        assert_eq!(
            parse_timeout_ms(Some("999999".to_string())),
            Duration::from_millis(120_000)
        );
        assert_eq!(parse_timeout_ms(Some("junk".to_string())), Duration::from_millis(10_000));
    }
}
