//! Bridge configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding [`BridgeConfig::base_url`].
pub const ENV_BASE_URL: &str = "TERM_BRIDGE_BASE_URL";
/// Environment variable overriding [`BridgeConfig::request_timeout_secs`].
pub const ENV_REQUEST_TIMEOUT: &str = "TERM_BRIDGE_REQUEST_TIMEOUT_SECS";
/// Environment variable overriding [`BridgeConfig::connect_timeout_secs`].
pub const ENV_CONNECT_TIMEOUT: &str = "TERM_BRIDGE_CONNECT_TIMEOUT_SECS";

/// Connection settings for the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// HTTP base URL of the session server, e.g. `http://localhost:3000`.
    pub base_url: String,
    /// Timeout for each HTTP request.
    pub request_timeout_secs: u64,
    /// Timeout for establishing the realtime connection.
    pub connect_timeout_secs: u64,
    /// Buffer size of the status notification channel.
    pub status_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            status_capacity: 64,
        }
    }
}

impl BridgeConfig {
    /// Create a config for a base URL with default timeouts.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Defaults overlaid with `TERM_BRIDGE_*` environment variables.
    ///
    /// Unparseable numeric values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(ENV_BASE_URL) {
            self.base_url = url;
        }
        if let Some(secs) = parse_secs(ENV_REQUEST_TIMEOUT, lookup(ENV_REQUEST_TIMEOUT)) {
            self.request_timeout_secs = secs;
        }
        if let Some(secs) = parse_secs(ENV_CONNECT_TIMEOUT, lookup(ENV_CONNECT_TIMEOUT)) {
            self.connect_timeout_secs = secs;
        }
        self
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn parse_secs(key: &str, value: Option<String>) -> Option<u64> {
    let value = value?;
    match value.trim().parse() {
        Ok(secs) => Some(secs),
        Err(e) => {
            tracing::warn!(key, value, "Ignoring invalid timeout: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_overlay_reads_variables() {
        let env = HashMap::from([
            (ENV_BASE_URL, "https://bridge.example.com"),
            (ENV_REQUEST_TIMEOUT, "5"),
            (ENV_CONNECT_TIMEOUT, "oops"),
        ]);
        let config = BridgeConfig::default().overlay(|k| env.get(k).map(ToString::to_string));

        assert_eq!(config.base_url, "https://bridge.example.com");
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let config: BridgeConfig = serde_json::from_str(r#"{"base_url":"http://h:1"}"#).unwrap();
        assert_eq!(config.base_url, "http://h:1");
        assert_eq!(config.status_capacity, 64);
    }
}
