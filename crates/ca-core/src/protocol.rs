//! Well-known service identifiers for each transport

use uuid::Uuid;

// ----------------------------------------------------------------------------
// Bluetooth Service UUIDs
// ----------------------------------------------------------------------------

/// RFCOMM service record advertised by devices running the messaging stack
pub const EDR_SERVICE_UUID: Uuid = Uuid::from_u128(0x12341234_1C25_481F_9DFB_59193D238280);

/// GATT service hosting the request/response characteristics
pub const LE_SERVICE_UUID: Uuid = Uuid::from_u128(0x713D0000_503E_4C75_BA94_3148F18D941E);

/// GATT characteristic the server notifies responses on (client reads)
pub const LE_RESPONSE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x713D0002_503E_4C75_BA94_3148F18D941E);

/// GATT characteristic clients write requests to
pub const LE_REQUEST_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x713D0003_503E_4C75_BA94_3148F18D941E);

// ----------------------------------------------------------------------------
// IP
// ----------------------------------------------------------------------------

/// Service name used by the connectionless UDP transport
pub const WIFI_SERVICE_NAME: &str = "oic.udp";
