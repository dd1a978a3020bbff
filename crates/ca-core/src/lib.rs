//! Connectivity Abstraction Core
//!
//! Shared vocabulary for the connectivity abstraction layer: addressing and
//! message types, the error taxonomy, adapter configuration, and the
//! [`CapabilityBinding`] interface through which adapters drive a platform
//! radio. Enable the `testing` feature for an in-memory [`MockBinding`].

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod binding;
pub mod config;
pub mod errors;
pub mod protocol;
pub mod types;

#[cfg(feature = "testing")]
pub mod mock;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use binding::{
    BindingEvent, CapabilityBinding, DataOrigin, EventSink, EventStream, ServiceList,
};
pub use config::{AdapterConfig, OverflowPolicy};
pub use errors::{BindingError, BindingResult, CaError, CaResult};
pub use types::{
    Address, AdapterState, AdapterStatus, ConnectionHandle, Destination, InboundPacket,
    LocalConnectivity, NetworkStatus, NetworkStatusEvent, QueueMessage, ServiceId,
    TransportKind,
};

#[cfg(feature = "testing")]
pub use mock::{BindingCall, MockBinding};
