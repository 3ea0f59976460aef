//! Configuration for the multiplexing engine and both roles.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::proto::DEFAULT_MTU;
use crate::sequencer::DEFAULT_CAPACITY;

/// Which side of the tunnel this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts application connections and dials the backend links
    Frontend,
    /// Accepts links from frontends and connects to the real service
    Backend,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Frontend => f.write_str("frontend"),
            Role::Backend => f.write_str("backend"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "frontend" => Ok(Role::Frontend),
            "backend" => Ok(Role::Backend),
            other => Err(format!("unknown role '{other}' (expected frontend or backend)")),
        }
    }
}

/// Tunables shared by both roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum payload bytes per packet
    pub mtu: usize,

    /// Read stops draining the packet queue once this many bytes are buffered
    pub read_buffer_threshold: usize,

    /// Ping period per link
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,

    /// Delay before a failed link is dialed again
    #[serde(with = "humantime_serde")]
    pub redial_delay: Duration,

    /// Backend: a UDP peer silent for this long is dropped
    #[serde(with = "humantime_serde")]
    pub link_timeout: Duration,

    /// How long an out-of-order packet may wait for the gap before it.
    ///
    /// When it expires the connection is torn down.
    #[serde(with = "humantime_serde")]
    pub stall_timeout: Duration,

    /// Maximum number of connections the sequencer tracks at once
    pub sequencer_capacity: usize,

    /// Furthest a packet may run ahead of its connection's last delivered
    /// sequence number; beyond it the connection is torn down
    pub reorder_window: u32,

    /// Out-of-order packets held at once across all connections. When full,
    /// link read loops wait for a slot.
    pub max_parked_packets: usize,

    /// Frontend: how long to wait for a live link when opening a connection
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,

    /// Backend: timeout for connecting to the real service
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            read_buffer_threshold: 32 * 1024,
            keepalive_interval: Duration::from_secs(1),
            redial_delay: Duration::from_secs(1),
            link_timeout: Duration::from_secs(5),
            stall_timeout: Duration::from_secs(30),
            sequencer_capacity: DEFAULT_CAPACITY,
            reorder_window: 16 * 1024,
            max_parked_packets: 4096,
            dial_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration for the frontend role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontendConfig {
    /// Local TCP ports applications connect to
    pub listen: String,
    /// Backend link ports (`tcp://host:a-b,udp://host:c`)
    pub upstream: String,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            listen: "tcp://127.0.0.1:1080".to_string(),
            upstream: "tcp://127.0.0.1:41000-41003".to_string(),
            engine: EngineConfig::default(),
        }
    }
}

/// Configuration for the backend role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Link ports frontends dial
    pub listen: String,
    /// The real service accelerated connections are forwarded to
    pub upstream: String,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            listen: "tcp://0.0.0.0:41000-41003".to_string(),
            upstream: "tcp://127.0.0.1:8080".to_string(),
            engine: EngineConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.mtu, DEFAULT_MTU);
        assert_eq!(config.keepalive_interval, Duration::from_secs(1));
        assert_eq!(config.redial_delay, Duration::from_secs(1));
        assert_eq!(config.sequencer_capacity, 65535);
        assert_eq!(config.reorder_window, 16384);
        assert_eq!(config.max_parked_packets, 4096);
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("FRONTEND".parse::<Role>().unwrap(), Role::Frontend);
        assert_eq!("backend".parse::<Role>().unwrap(), Role::Backend);
        assert!("middle".parse::<Role>().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let raw = r#"
            listen = "tcp://127.0.0.1:9000"
            upstream = "udp://10.0.0.2:41000-41001"

            [engine]
            mtu = 1200
            stall_timeout = "5s"
        "#;
        let cfg: FrontendConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.engine.mtu, 1200);
        assert_eq!(cfg.engine.stall_timeout, Duration::from_secs(5));
        assert_eq!(cfg.engine.keepalive_interval, Duration::from_secs(1));
    }
}
