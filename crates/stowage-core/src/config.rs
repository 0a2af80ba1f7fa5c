//! Endpoint configuration.
//!
//! Provides [`StowageConfig`], the set of external endpoints the access layer
//! talks to. Values are loaded from environment variables.

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// Well-known name of the API key the object browser manages per project.
pub const DEFAULT_KEY_NAME: &str = "Web file browser API key";

/// Endpoint and identity configuration for Stowage.
///
/// # Examples
///
/// ```
/// use stowage_core::StowageConfig;
///
/// let config = StowageConfig::default();
/// assert_eq!(config.key_name, "Web file browser API key");
/// assert!(!config.public_grants);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct StowageConfig {
    /// Base URL of the console REST API (including `/api/v0`).
    #[builder(default = String::from("http://127.0.0.1:10000/api/v0"))]
    pub console_api_url: String,

    /// Base URL of the gateway credential service.
    #[builder(default = String::from("http://127.0.0.1:20000"))]
    pub gateway_auth_url: String,

    /// Satellite node URL embedded into generated access strings.
    #[builder(default = String::from("127.0.0.1:7777"))]
    pub satellite_node_url: String,

    /// Name of the API key created for browsing sessions.
    #[builder(default = String::from(DEFAULT_KEY_NAME))]
    pub key_name: String,

    /// Whether exchanged gateway credentials are registered as public.
    #[builder(default = false)]
    pub public_grants: bool,

    /// Log level filter string (e.g. `"info"`, `"debug"`).
    #[builder(default = String::from("info"))]
    pub log_level: String,
}

impl Default for StowageConfig {
    fn default() -> Self {
        Self {
            console_api_url: String::from("http://127.0.0.1:10000/api/v0"),
            gateway_auth_url: String::from("http://127.0.0.1:20000"),
            satellite_node_url: String::from("127.0.0.1:7777"),
            key_name: String::from(DEFAULT_KEY_NAME),
            public_grants: false,
            log_level: String::from("info"),
        }
    }
}

impl StowageConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `CONSOLE_API_URL` | `http://127.0.0.1:10000/api/v0` |
    /// | `GATEWAY_AUTH_URL` | `http://127.0.0.1:20000` |
    /// | `SATELLITE_NODE_URL` | `127.0.0.1:7777` |
    /// | `OBJECT_BROWSER_KEY_NAME` | `Web file browser API key` |
    /// | `PUBLIC_GRANTS` | `false` |
    /// | `LOG_LEVEL` | `info` |
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("CONSOLE_API_URL") {
            config.console_api_url = v;
        }
        if let Ok(v) = std::env::var("GATEWAY_AUTH_URL") {
            config.gateway_auth_url = v;
        }
        if let Ok(v) = std::env::var("SATELLITE_NODE_URL") {
            config.satellite_node_url = v;
        }
        if let Ok(v) = std::env::var("OBJECT_BROWSER_KEY_NAME") {
            config.key_name = v;
        }
        if let Ok(v) = std::env::var("PUBLIC_GRANTS") {
            config.public_grants = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            config.log_level = v;
        }

        config
    }
}

/// Parse a string as a boolean, accepting `"1"` and `"true"` (case-insensitive).
pub fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_create_default_config() {
        let config = StowageConfig::default();
        assert_eq!(config.console_api_url, "http://127.0.0.1:10000/api/v0");
        assert_eq!(config.gateway_auth_url, "http://127.0.0.1:20000");
        assert_eq!(config.satellite_node_url, "127.0.0.1:7777");
        assert_eq!(config.key_name, DEFAULT_KEY_NAME);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_should_load_from_env() {
        let config = StowageConfig::from_env();
        assert!(!config.key_name.is_empty());
    }

    #[test]
    fn test_should_build_with_typed_builder() {
        let config = StowageConfig::builder()
            .gateway_auth_url("https://auth.example.test".into())
            .public_grants(true)
            .build();

        assert_eq!(config.gateway_auth_url, "https://auth.example.test");
        assert!(config.public_grants);
        assert_eq!(config.key_name, DEFAULT_KEY_NAME);
    }

    #[test]
    fn test_should_serialize_to_camel_case_json() {
        let json = serde_json::to_string(&StowageConfig::default()).expect("test serialization");
        assert!(json.contains("gatewayAuthUrl"));
        assert!(json.contains("satelliteNodeUrl"));
    }

    #[test]
    fn test_should_parse_bool_values() {
        assert!(parse_bool("1"));
        assert!(parse_bool("TRUE"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool(""));
    }
}
