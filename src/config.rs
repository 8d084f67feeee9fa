//! Tunnel configuration.

use std::time::Duration;

use crate::transport::DEFAULT_MAX_FRAME_SIZE;

/// Configuration for a [`Tunnel`](crate::Tunnel) and the server in front of it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// How long a forwarded request may wait for its response to complete.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Number of protocol violations a provider channel tolerates before it is
    /// closed.
    pub malformed_threshold: usize,

    /// Send a keepalive ping after the channel has been idle this long.
    #[serde(with = "humantime_serde")]
    pub keepalive: Option<Duration>,

    /// Largest message accepted on a provider transport.
    pub max_frame_size: usize,

    /// Largest request body chunk sent in a single frame.
    pub max_chunk_size: usize,

    /// Path prefix under which renters address sessions.
    pub session_prefix: String,

    /// Path prefix under which providers connect.
    pub provider_prefix: String,

    /// Protocol name expected in the provider's `Upgrade` header.
    pub upgrade_protocol: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            malformed_threshold: 16,
            keepalive: Some(Duration::from_secs(30)),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_chunk_size: 64 * 1024,
            session_prefix: "/session".into(),
            provider_prefix: "/provider".into(),
            upgrade_protocol: "backhaul".into(),
        }
    }
}

impl TunnelConfig {
    /// Request body chunk size, never larger than a frame can carry.
    pub(crate) fn chunk_size(&self) -> usize {
        // Leave room for the 9 byte chunk prefix.
        self.max_chunk_size
            .min(self.max_frame_size.saturating_sub(9))
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let config: TunnelConfig = serde_json::from_str(
            r#"{"request_timeout": "5s", "keepalive": null, "malformed_threshold": 2}"#,
        )
        .unwrap();

        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.keepalive, None);
        assert_eq!(config.malformed_threshold, 2);
        assert_eq!(config.session_prefix, "/session");
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn durations_serialize_human_readable() {
        let value = serde_json::to_value(TunnelConfig::default()).unwrap();
        assert_eq!(value["request_timeout"], "30s");
        assert_eq!(value["keepalive"], "30s");
    }

    #[test]
    fn chunks_fit_in_frames() {
        let config = TunnelConfig {
            max_frame_size: 100,
            ..Default::default()
        };
        assert_eq!(config.chunk_size(), 91);
        assert_eq!(TunnelConfig::default().chunk_size(), 64 * 1024);
    }
}
