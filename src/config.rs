use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::Error;

/// Upper bound of a single UDP datagram read from the network.
pub const RECEIVE_MTU: usize = 1460;

const DEFAULT_SOCKET_BUFFER_SIZE: usize = 100 * 1024 * 1024;

/// Configuration for [`crate::worker::Worker`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub router: RouterConfig,
    pub listen: ListenConfig,
    /// Milliseconds after which a buffer nobody published is dropped.
    pub unbound_buffer_ttl: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            listen: ListenConfig::default(),
            unbound_buffer_ttl: 30_000,
        }
    }
}

impl WorkerConfig {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config = serde_json::from_str(json)?;
        Ok(config)
    }
}

/// Configuration for [`crate::router::Router`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Maximum bitrate of a published track in bps.
    pub max_bandwidth: u64,
    /// How long packets are kept for retransmission, in milliseconds.
    pub max_buffer_time: u32,
    pub simulcast: SimulcastConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_bandwidth: 1_500_000,
            max_buffer_time: 1000,
            simulcast: SimulcastConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulcastConfig {
    /// Start new subscribers on the highest active layer instead of the lowest.
    pub best_quality_first: bool,
}

/// UDP port range the worker listens on. One socket is bound per port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub ip: IpAddr,
    pub port_start: u16,
    pub port_end: u16,
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_start: 5000,
            port_end: 5000,
            recv_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            send_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
        }
    }
}

/// Simulcast RTP stream id advertised by the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum RID {
    #[strum(serialize = "q")]
    QUARTER,
    #[strum(serialize = "h")]
    HALF,
    #[strum(serialize = "f")]
    FULL,
}

impl From<RID> for usize {
    fn from(rid: RID) -> usize {
        match rid {
            RID::QUARTER => 0,
            RID::HALF => 1,
            RID::FULL => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn rid_maps_to_layer_slot() {
        assert_eq!(usize::from(RID::from_str("q").unwrap()), 0);
        assert_eq!(usize::from(RID::from_str("h").unwrap()), 1);
        assert_eq!(usize::from(RID::from_str("f").unwrap()), 2);
        assert!(RID::from_str("x").is_err());
        assert_eq!(RID::FULL.to_string(), "f");
    }

    #[test]
    fn worker_config_from_partial_json() {
        let config = WorkerConfig::from_json(
            r#"{"listen": {"port_start": 6000, "port_end": 6010}, "router": {"simulcast": {"best_quality_first": true}}}"#,
        )
        .unwrap();
        assert_eq!(config.listen.port_start, 6000);
        assert_eq!(config.listen.port_end, 6010);
        assert_eq!(config.listen.recv_buffer_size, 100 * 1024 * 1024);
        assert!(config.router.simulcast.best_quality_first);
        assert_eq!(config.router.max_buffer_time, 1000);
    }
}
