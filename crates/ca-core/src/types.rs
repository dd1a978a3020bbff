//! Core types shared by every connectivity adapter
//!
//! These are the values that cross the boundary between the upper messaging
//! layer, the adapter machinery and the platform capability binding. Payloads
//! are carried as [`Bytes`] so a broadcast can buffer the same message for many
//! peers without copying it.

use core::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::protocol;

// ----------------------------------------------------------------------------
// Addressing
// ----------------------------------------------------------------------------

/// Transport-level identifier of a remote device
///
/// A BD address for Bluetooth (`"AA:BB:CC:DD:EE:FF"`), a peripheral address
/// for BLE, or `ip[:port]` for UDP. Unique within one adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of a messaging service exposed by a remote device
///
/// Usually a 128-bit UUID rendered as text. Comparison ignores ASCII case,
/// since platforms disagree on how they print UUIDs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(service: impl Into<String>) -> Self {
        Self(service.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Check whether `services` advertises this service
    pub fn is_offered_by<'a, I>(&self, services: I) -> bool
    where
        I: IntoIterator<Item = &'a ServiceId>,
    {
        services.into_iter().any(|candidate| candidate == self)
    }
}

impl PartialEq for ServiceId {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for ServiceId {}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<uuid::Uuid> for ServiceId {
    fn from(value: uuid::Uuid) -> Self {
        Self(value.hyphenated().to_string())
    }
}

/// Socket or channel handle assigned by the binding once a peer is connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionHandle(pub u32);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where an outbound message should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// A single remote device
    Unicast(Address),
    /// Every peer currently known to the adapter
    Broadcast,
}

impl Destination {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Destination::Broadcast)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Unicast(address) => write!(f, "{}", address),
            Destination::Broadcast => f.write_str("<broadcast>"),
        }
    }
}

impl From<Address> for Destination {
    fn from(address: Address) -> Self {
        Destination::Unicast(address)
    }
}

// ----------------------------------------------------------------------------
// Transport and Adapter State
// ----------------------------------------------------------------------------

/// Radio family an adapter drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Bluetooth BR/EDR (RFCOMM)
    Edr,
    /// Bluetooth Low Energy (GATT)
    Le,
    /// WiFi / Ethernet over UDP
    Wifi,
}

impl TransportKind {
    /// Messaging service this transport looks for on remote devices
    pub fn default_service(&self) -> ServiceId {
        match self {
            TransportKind::Edr => ServiceId::from(protocol::EDR_SERVICE_UUID),
            TransportKind::Le => ServiceId::from(protocol::LE_SERVICE_UUID),
            TransportKind::Wifi => ServiceId::new(protocol::WIFI_SERVICE_NAME),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Edr => "edr",
            TransportKind::Le => "le",
            TransportKind::Wifi => "wifi",
        };
        f.write_str(name)
    }
}

/// Power state of the local radio as reported by the binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Enabled,
    Disabled,
}

/// Outcome of a successful `initialize`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterStatus {
    /// Radio is on; the adapter can be started
    Ready,
    /// Initialized, but the radio is currently off
    AdapterDisabled,
}

/// Network interface status reported to the upper layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Up,
    Down,
}

impl From<AdapterState> for NetworkStatus {
    fn from(state: AdapterState) -> Self {
        match state {
            AdapterState::Enabled => NetworkStatus::Up,
            AdapterState::Disabled => NetworkStatus::Down,
        }
    }
}

/// Description of the local network endpoint of an adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConnectivity {
    pub transport: TransportKind,
    pub address: Address,
}

impl LocalConnectivity {
    pub fn new(transport: TransportKind, address: impl Into<Address>) -> Self {
        Self {
            transport,
            address: address.into(),
        }
    }
}

/// Adapter up/down notification delivered to the status callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkStatusEvent {
    pub info: LocalConnectivity,
    pub status: NetworkStatus,
}

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

/// Outbound unit of work carried by the send queue
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub destination: Destination,
    pub service: ServiceId,
    pub payload: Bytes,
}

impl QueueMessage {
    pub fn new(destination: Destination, service: ServiceId, payload: impl Into<Bytes>) -> Self {
        Self {
            destination,
            service,
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Payload delivered to the upper layer's receive callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub source: Address,
    pub service: ServiceId,
    pub payload: Bytes,
}

impl InboundPacket {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
