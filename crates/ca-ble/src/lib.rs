//! BLE Capability Binding
//!
//! Drives the host's first Bluetooth Low Energy adapter through btleplug and
//! exposes it to the connectivity adapter as a [`CapabilityBinding`]. The
//! binding plays the GATT client role: it scans for the messaging service,
//! binds the request/response characteristics on connect and writes in
//! chunks sized for the link.
//!
//! [`CapabilityBinding`]: ca_core::CapabilityBinding

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod binding;
pub mod config;
pub mod gatt;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use binding::BtleplugBinding;
pub use config::{BleConfig, DEFAULT_WRITE_CHUNK};
pub use gatt::{GattEntry, GattServiceTable};
