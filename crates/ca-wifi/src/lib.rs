//! WiFi / Ethernet Capability Binding
//!
//! Connectionless UDP transport for the connectivity abstraction layer. A
//! unicast socket carries peer traffic and a multicast socket joined to the
//! well-known group receives broadcasts from every device on the link.

pub mod binding;
pub mod config;

pub use binding::UdpBinding;
pub use config::WifiConfig;
