//! BLE binding configuration

use std::time::Duration;

use ca_core::protocol::{
    LE_REQUEST_CHARACTERISTIC_UUID, LE_RESPONSE_CHARACTERISTIC_UUID, LE_SERVICE_UUID,
};
use ca_core::CaResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Largest write-without-response payload sent in one GATT operation
pub const DEFAULT_WRITE_CHUNK: usize = 244;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the BLE capability binding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// GATT service scanned for and connected to
    pub service_uuid: Uuid,
    /// Characteristic requests are written to
    pub tx_characteristic: Uuid,
    /// Characteristic responses are notified on
    pub rx_characteristic: Uuid,
    /// Outbound payloads are split into writes of at most this many bytes
    pub write_chunk_size: usize,
    /// Maximum time to wait for a peripheral connection
    pub connection_timeout: Duration,
    /// Only report peripherals advertising `service_uuid`
    pub filter_scan: bool,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            service_uuid: LE_SERVICE_UUID,
            tx_characteristic: LE_REQUEST_CHARACTERISTIC_UUID,
            rx_characteristic: LE_RESPONSE_CHARACTERISTIC_UUID,
            write_chunk_size: DEFAULT_WRITE_CHUNK,
            connection_timeout: Duration::from_secs(5),
            filter_scan: true,
        }
    }
}

impl BleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML; missing keys take their defaults
    pub fn from_toml_str(source: &str) -> CaResult<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Set the GATT service and its two characteristics
    pub fn with_service(mut self, service: Uuid, tx: Uuid, rx: Uuid) -> Self {
        self.service_uuid = service;
        self.tx_characteristic = tx;
        self.rx_characteristic = rx;
        self
    }

    /// Set write chunk size; zero is raised to one byte
    pub fn with_write_chunk_size(mut self, size: usize) -> Self {
        self.write_chunk_size = size.max(1);
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_scan_filter(mut self, enabled: bool) -> Self {
        self.filter_scan = enabled;
        self
    }

    /// Split a payload into the writes it will take on the wire
    pub fn chunks<'a>(&self, data: &'a [u8]) -> impl Iterator<Item = &'a [u8]> {
        data.chunks(self.write_chunk_size.max(1))
    }
}
