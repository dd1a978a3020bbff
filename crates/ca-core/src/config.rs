//! Adapter configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::CaResult;
use crate::types::{ServiceId, TransportKind};

// ----------------------------------------------------------------------------
// Overflow Policy
// ----------------------------------------------------------------------------

/// What to do when a peer's pending queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest buffered message to make room
    DropOldest,
    /// Keep the buffered messages and discard the new one
    RejectNewest,
}

// ----------------------------------------------------------------------------
// Adapter Configuration
// ----------------------------------------------------------------------------

/// Configuration for one adapter manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Transport this adapter drives; must match the binding
    pub transport: TransportKind,
    /// Messaging service looked for on remote devices
    pub service: ServiceId,
    /// Maximum messages waiting for the send worker
    pub send_queue_capacity: usize,
    /// Maximum peers tracked at once
    pub max_peers: usize,
    /// Maximum messages buffered per peer while its connection is pending
    pub max_pending_per_peer: usize,
    /// Behaviour when a pending queue is full
    pub pending_overflow: OverflowPolicy,
    /// Time a peer may spend between discovery and connection before it is failed
    pub connect_timeout_ms: u64,
    /// How often stalled peers are swept
    pub sweep_interval_ms: u64,
    /// How long `terminate` waits for the send worker to finish its last drain
    pub shutdown_grace_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self::for_transport(TransportKind::Edr)
    }
}

impl AdapterConfig {
    /// Default configuration for a transport, targeting its well-known service
    pub fn for_transport(transport: TransportKind) -> Self {
        Self {
            transport,
            service: transport.default_service(),
            send_queue_capacity: 1024,
            max_peers: 64,
            max_pending_per_peer: 32,
            pending_overflow: OverflowPolicy::DropOldest,
            connect_timeout_ms: 30_000,
            sweep_interval_ms: 5_000,
            shutdown_grace_ms: 2_000,
        }
    }

    /// Parse a configuration from TOML; missing keys take their defaults
    pub fn from_toml_str(source: &str) -> CaResult<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Set the target service
    pub fn with_service(mut self, service: impl Into<ServiceId>) -> Self {
        self.service = service.into();
        self
    }

    /// Set send queue capacity
    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    /// Set peer table capacity
    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    /// Set per-peer pending capacity and overflow behaviour
    pub fn with_pending_limit(mut self, max_pending: usize, policy: OverflowPolicy) -> Self {
        self.max_pending_per_peer = max_pending;
        self.pending_overflow = policy;
        self
    }

    /// Set connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set stall sweep interval
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        // A zero interval would make tokio's interval panic
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
