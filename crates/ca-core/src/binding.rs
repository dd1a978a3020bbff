//! Capability binding interface
//!
//! A capability binding wraps one platform radio driver. The adapter machinery
//! only ever talks to the radio through [`CapabilityBinding`], and the binding
//! only ever talks back through an [`EventSink`]: every operation that the
//! platform completes asynchronously (service search, connect, socket state,
//! data arrival) reports its outcome later as a [`BindingEvent`].
//!
//! `EventSink::emit` is a plain non-blocking channel send, so a binding may
//! call it from whatever thread its platform callbacks run on.

use async_trait::async_trait;
use bytes::Bytes;
use smallvec::SmallVec;
use tokio::sync::mpsc;

use crate::errors::{BindingError, BindingResult};
use crate::types::{
    Address, AdapterState, ConnectionHandle, LocalConnectivity, ServiceId, TransportKind,
};

/// Services reported for a device by discovery or service search
pub type ServiceList = SmallVec<[ServiceId; 4]>;

// ----------------------------------------------------------------------------
// Binding Events
// ----------------------------------------------------------------------------

/// Identifies who an inbound payload came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataOrigin {
    /// Connection-oriented transports tag data with the socket handle
    Handle(ConnectionHandle),
    /// Connectionless transports tag data with the sender address
    Address(Address),
}

/// Everything a platform binding can report back to an adapter
#[derive(Debug, Clone)]
pub enum BindingEvent {
    /// Local radio switched on or off
    AdapterStateChanged(AdapterState),
    /// Device seen during discovery, with the services it advertises
    DiscoveryFound {
        address: Address,
        services: ServiceList,
    },
    /// Service search on a device completed
    ServiceSearched {
        address: Address,
        services: ServiceList,
    },
    /// Service search on a device could not complete
    ServiceSearchFailed { address: Address, reason: String },
    /// Socket to a device is open, either because we connected or it did
    SocketConnected {
        address: Address,
        handle: ConnectionHandle,
    },
    /// Outbound connect attempt failed, or an open socket errored
    ConnectFailed { address: Address, reason: String },
    /// Socket to a device closed
    SocketDisconnected { address: Address },
    /// Payload arrived from a device
    DataReceived { origin: DataOrigin, payload: Bytes },
}

impl BindingEvent {
    /// Short name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            BindingEvent::AdapterStateChanged(_) => "adapter-state-changed",
            BindingEvent::DiscoveryFound { .. } => "discovery-found",
            BindingEvent::ServiceSearched { .. } => "service-searched",
            BindingEvent::ServiceSearchFailed { .. } => "service-search-failed",
            BindingEvent::SocketConnected { .. } => "socket-connected",
            BindingEvent::ConnectFailed { .. } => "connect-failed",
            BindingEvent::SocketDisconnected { .. } => "socket-disconnected",
            BindingEvent::DataReceived { .. } => "data-received",
        }
    }
}

// ----------------------------------------------------------------------------
// Event Sink
// ----------------------------------------------------------------------------

/// Receiving side of an [`EventSink`], owned by the adapter's event pump
pub type EventStream = mpsc::UnboundedReceiver<BindingEvent>;

/// Handle a binding uses to report platform callbacks
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<BindingEvent>,
}

impl EventSink {
    /// Create a connected sink/stream pair
    pub fn channel() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report an event; returns `false` once the adapter stopped listening
    pub fn emit(&self, event: BindingEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                tracing::debug!("Dropping {} event, adapter no longer listening", event.kind());
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ----------------------------------------------------------------------------
// Capability Binding Trait
// ----------------------------------------------------------------------------

/// Platform radio driver consumed by an adapter
///
/// Operations must return promptly. Anything the platform finishes later is
/// reported through the sink passed to [`register_events`](Self::register_events).
#[async_trait]
pub trait CapabilityBinding: Send + Sync {
    /// Radio family this binding drives
    fn transport(&self) -> TransportKind;

    /// Bring up the platform stack
    async fn enable(&self) -> BindingResult<()>;

    /// Release the platform stack
    async fn disable(&self);

    /// Current power state of the radio
    async fn adapter_state(&self) -> BindingResult<AdapterState>;

    /// Address of the local radio
    async fn local_connectivity(&self) -> BindingResult<LocalConnectivity>;

    /// Start reporting platform callbacks to `sink`
    async fn register_events(&self, sink: EventSink) -> BindingResult<()>;

    /// Stop reporting platform callbacks
    async fn unregister_events(&self);

    async fn is_discovering(&self) -> BindingResult<bool>;

    async fn start_discovery(&self) -> BindingResult<()>;

    async fn stop_discovery(&self) -> BindingResult<()>;

    /// Ask the device at `address` which services it offers
    ///
    /// Completes with `ServiceSearched` or `ServiceSearchFailed`.
    async fn start_service_search(&self, address: &Address) -> BindingResult<()>;

    /// Open a connection to `service` on the device at `address`
    ///
    /// Completes with `SocketConnected` or `ConnectFailed`.
    async fn connect(&self, address: &Address, service: &ServiceId) -> BindingResult<()>;

    /// Write `data` on an open connection, returning the bytes handed to the radio
    async fn write(&self, handle: ConnectionHandle, data: &[u8]) -> BindingResult<usize>;

    /// Whether [`write_multicast`](Self::write_multicast) reaches every peer at once
    fn supports_multicast(&self) -> bool {
        false
    }

    /// Send `data` to every listening device in one operation
    async fn write_multicast(&self, _data: &[u8]) -> BindingResult<usize> {
        Err(BindingError::Unsupported("multicast"))
    }
}
