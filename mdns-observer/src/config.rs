use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use serde::Deserialize;
use shared::protocol::{
    DEFAULT_MAX_PACKET_SIZE, DEFAULT_REMOVE_TIMEOUT_SECS, MDNS_GROUP_V4, MDNS_PORT,
};

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Multicast group and port to bind, join and send to
    #[serde(default = "default_group")]
    pub group: SocketAddrV4,
    /// Interface address used to join the group; unspecified lets the OS pick
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,
    /// Encoded messages larger than this are rejected, not sent
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    #[serde(default = "default_multicast_loop")]
    pub multicast_loop: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObserverConfig {
    /// Grace period between expiry and removal
    #[serde(default = "default_remove_timeout")]
    pub remove_timeout_secs: u64,
}

fn default_group() -> SocketAddrV4 {
    SocketAddrV4::new(MDNS_GROUP_V4, MDNS_PORT)
}

fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}

fn default_multicast_loop() -> bool {
    true
}

fn default_remove_timeout() -> u64 {
    DEFAULT_REMOVE_TIMEOUT_SECS
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            interface: default_interface(),
            max_packet_size: default_max_packet_size(),
            multicast_loop: default_multicast_loop(),
        }
    }
}

impl TransportConfig {
    pub fn group_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.group)
    }
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            remove_timeout_secs: default_remove_timeout(),
        }
    }
}

impl ObserverConfig {
    pub fn remove_timeout(&self) -> Duration {
        Duration::from_secs(self.remove_timeout_secs)
    }
}
