//! Environment-driven process configuration

use std::str::FromStr;
use std::time::Duration;

/// HTTP server settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    /// Origin allowed by the CORS layer (the browser frontend)
    pub cors_origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            cors_origin: "http://localhost:5173".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_or("PORT", defaults.port),
            cors_origin: std::env::var("CORS_ORIGIN").unwrap_or(defaults.cors_origin),
        }
    }
}

/// Parse `key` from the environment, falling back to `default` when it is
/// unset or does not parse.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Whole seconds from the environment as a `Duration`
pub fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_or(key, default_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_falls_back_when_unset() {
        assert_eq!(env_or("CHAT_RELAY_TEST_UNSET_VAR", 42u16), 42);
        assert_eq!(
            env_secs("CHAT_RELAY_TEST_UNSET_SECS", 7),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn test_defaults_match_frontend_dev_server() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3001);
        assert_eq!(config.cors_origin, "http://localhost:5173");
    }
}
