//! Gateway configuration
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::time::Duration;

/// Configuration for a gateway instance.
///
/// Every option has a default; `from_env` only overrides what is set.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Redis host used for key/value operations (`host:port`).
    pub redis_host: String,
    /// Redis host used for pub/sub. Defaults to `redis_host`.
    pub pubsub_host: String,
    /// Pub/sub channel used for inter-instance coordination.
    pub control_channel: String,
    /// Key prefix for all backend keys.
    pub namespace: String,
    /// Maximum wall-clock duration a `poll` request parks.
    pub timeout: Duration,
    /// After the first message is queued to a parked `poll`, how long to
    /// keep collecting further messages before answering.
    pub poll_time: Duration,
    /// Listen address for the HTTP server.
    pub host: String,
    pub port: u16,
    /// Maximum number of pooled Redis connections.
    pub redis_max_connections: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            redis_host: default_redis_host(),
            pubsub_host: default_redis_host(),
            control_channel: default_control_channel(),
            namespace: default_namespace(),
            timeout: Duration::from_secs(default_timeout_secs()),
            poll_time: Duration::from_secs(default_poll_time_secs()),
            host: default_host(),
            port: default_port(),
            redis_max_connections: default_redis_max_connections(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables.
    ///
    /// Reads a `.env` file if one is present. Unset or unparsable variables
    /// fall back to their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let redis_host = env::var("RELAY_REDIS_HOST").unwrap_or_else(|_| default_redis_host());

        Self {
            pubsub_host: env::var("RELAY_PUBSUB_HOST").unwrap_or_else(|_| redis_host.clone()),
            redis_host,
            control_channel: env::var("RELAY_CONTROL_CHANNEL")
                .unwrap_or_else(|_| default_control_channel()),
            namespace: env::var("RELAY_NAMESPACE").unwrap_or_else(|_| default_namespace()),
            timeout: Duration::from_secs(
                env::var("RELAY_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(default_timeout_secs),
            ),
            poll_time: Duration::from_secs(
                env::var("RELAY_POLL_TIME_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(default_poll_time_secs),
            ),
            host: env::var("RELAY_HOST").unwrap_or_else(|_| default_host()),
            port: env::var("RELAY_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_port),
            redis_max_connections: env::var("RELAY_REDIS_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_redis_max_connections),
        }
    }

    /// Connection URL for the key/value host.
    #[must_use]
    pub fn redis_url(&self) -> String {
        format!("redis://{}", self.redis_host)
    }

    /// Connection URL for the pub/sub host.
    #[must_use]
    pub fn pubsub_url(&self) -> String {
        format!("redis://{}", self.pubsub_host)
    }

    /// Listen address for the HTTP server.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Session expiry in seconds: the poll timeout plus one second of slack.
    #[must_use]
    pub fn session_ttl(&self) -> u64 {
        self.timeout.as_secs() + 1
    }
}

// Default value functions
fn default_redis_host() -> String {
    "localhost:6379".to_string()
}

fn default_control_channel() -> String {
    "broadcaster".to_string()
}

fn default_namespace() -> String {
    "bc:".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_poll_time_secs() -> u64 {
    2
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_redis_max_connections() -> usize {
    16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.redis_host, "localhost:6379");
        assert_eq!(config.pubsub_host, "localhost:6379");
        assert_eq!(config.control_channel, "broadcaster");
        assert_eq!(config.namespace, "bc:");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.poll_time, Duration::from_secs(2));
        assert_eq!(config.redis_max_connections, 16);
    }

    #[test]
    fn test_urls() {
        let config = GatewayConfig {
            redis_host: "redis-kv:6379".to_string(),
            pubsub_host: "redis-ps:6380".to_string(),
            ..GatewayConfig::default()
        };
        assert_eq!(config.redis_url(), "redis://redis-kv:6379");
        assert_eq!(config.pubsub_url(), "redis://redis-ps:6380");
    }

    #[test]
    fn test_session_ttl_has_slack() {
        let config = GatewayConfig {
            timeout: Duration::from_secs(30),
            ..GatewayConfig::default()
        };
        assert_eq!(config.session_ttl(), 31);
    }

    #[test]
    fn test_address() {
        let config = GatewayConfig::default();
        assert_eq!(config.address(), "127.0.0.1:8080");
    }
}
