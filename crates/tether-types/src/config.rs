//! Endpoint configuration.

use crate::object::EndpointId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default address an endpoint listens on.
pub const DEFAULT_LISTEN: &str = "tcp://127.0.0.1:9559";

/// Default upper bound on one frame body (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Configuration for one endpoint.
///
/// Every field has a default, so an empty TOML table is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Human-readable name sent during the handshake.
    pub name: String,
    /// Unique id of this endpoint.
    pub endpoint_id: EndpointId,
    /// Address to listen on when serving.
    pub listen: String,
    /// Pre-shared key; when set, peers must prove knowledge of it.
    pub shared_secret: Option<String>,
    /// Local timeout applied to every outgoing call. `None` waits forever.
    pub call_timeout_ms: Option<u64>,
    /// Largest frame body accepted or sent.
    pub max_frame_size: u32,
    /// Time allowed for the handshake to complete.
    pub handshake_timeout_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: "tether-endpoint".to_string(),
            endpoint_id: EndpointId::new(),
            listen: DEFAULT_LISTEN.to_string(),
            shared_secret: None,
            call_timeout_ms: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout_ms: 5000,
        }
    }
}

impl EndpointConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config: EndpointConfig = toml::from_str("").unwrap();
        assert_eq!(config.name, "tether-endpoint");
        assert_eq!(config.listen, DEFAULT_LISTEN);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert!(config.shared_secret.is_none());
        assert!(config.call_timeout().is_none());
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config: EndpointConfig = toml::from_str(
            r#"
            name = "robot"
            shared_secret = "s3cret"
            call_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "robot");
        assert_eq!(config.shared_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.call_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.listen, DEFAULT_LISTEN);
    }

    #[test]
    fn test_fresh_ids_differ() {
        assert_ne!(
            EndpointConfig::default().endpoint_id,
            EndpointConfig::default().endpoint_id
        );
    }
}
