//! UDP binding configuration

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use ca_core::protocol::WIFI_SERVICE_NAME;
use ca_core::{CaResult, ServiceId};
use serde::{Deserialize, Serialize};

/// Port the unicast socket listens on
pub const DEFAULT_UNICAST_PORT: u16 = 5383;

/// Group joined by the multicast receive socket
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 187);

/// Port the multicast receive socket listens on
pub const DEFAULT_MULTICAST_PORT: u16 = 5683;

/// Largest datagram sent or received
pub const DEFAULT_MAX_DATAGRAM: usize = 512;

/// Configuration for the UDP capability binding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiConfig {
    /// Local address both sockets bind to
    pub bind_address: Ipv4Addr,
    pub unicast_port: u16,
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    /// Whether to open the multicast receive socket at all
    pub join_multicast: bool,
    pub multicast_ttl: u32,
    /// Deliver our own multicast datagrams back to this host
    pub multicast_loopback: bool,
    pub max_datagram: usize,
    /// Service reported by every service search
    pub service: ServiceId,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            bind_address: Ipv4Addr::UNSPECIFIED,
            unicast_port: DEFAULT_UNICAST_PORT,
            multicast_group: DEFAULT_MULTICAST_GROUP,
            multicast_port: DEFAULT_MULTICAST_PORT,
            join_multicast: true,
            multicast_ttl: 1,
            multicast_loopback: true,
            max_datagram: DEFAULT_MAX_DATAGRAM,
            service: ServiceId::new(WIFI_SERVICE_NAME),
        }
    }
}

impl WifiConfig {
    /// Parse a configuration from TOML; missing keys take their defaults
    pub fn from_toml_str(source: &str) -> CaResult<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Bind to loopback on ephemeral ports with multicast off
    pub fn loopback() -> Self {
        Self {
            bind_address: Ipv4Addr::LOCALHOST,
            unicast_port: 0,
            join_multicast: false,
            ..Self::default()
        }
    }

    pub fn with_bind_address(mut self, address: Ipv4Addr) -> Self {
        self.bind_address = address;
        self
    }

    pub fn with_unicast_port(mut self, port: u16) -> Self {
        self.unicast_port = port;
        self
    }

    pub fn with_multicast(mut self, group: Ipv4Addr, port: u16) -> Self {
        self.multicast_group = group;
        self.multicast_port = port;
        self.join_multicast = true;
        self
    }

    pub fn with_max_datagram(mut self, size: usize) -> Self {
        self.max_datagram = size;
        self
    }

    pub fn unicast_bind_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.bind_address, self.unicast_port))
    }

    pub fn multicast_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.multicast_group, self.multicast_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_wire_constants() {
        let config = WifiConfig::default();
        assert_eq!(config.unicast_port, 5383);
        assert_eq!(config.multicast_addr().to_string(), "224.0.1.187:5683");
        assert_eq!(config.max_datagram, 512);
    }

    #[test]
    fn test_partial_toml() {
        let config = WifiConfig::from_toml_str(
            r#"
            bind_address = "127.0.0.1"
            unicast_port = 6000
            join_multicast = false
            "#,
        )
        .unwrap();
        assert_eq!(config.unicast_bind_addr().to_string(), "127.0.0.1:6000");
        assert!(!config.join_multicast);
        assert_eq!(config.multicast_port, 5683);
    }
}
