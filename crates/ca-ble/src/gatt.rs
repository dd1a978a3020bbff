//! GATT service table
//!
//! Remembers, for every peripheral we hold an open GATT session with, which
//! service we bound to and which characteristics carry each direction. Writes
//! look the TX characteristic up here; notifications are only accepted from
//! the recorded RX characteristic.

use ca_core::{Address, ConnectionHandle};
use hashbrown::HashMap;
use uuid::Uuid;

/// Characteristics bound on one peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattEntry {
    pub handle: ConnectionHandle,
    pub service: Uuid,
    /// Characteristic the peripheral notifies us on
    pub read: Uuid,
    /// Characteristic we write to
    pub write: Uuid,
}

/// Per-device GATT bindings plus the registered-service counter
#[derive(Debug, Default)]
pub struct GattServiceTable {
    entries: HashMap<Address, GattEntry>,
    registered: usize,
}

impl GattServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a bound service, replacing any previous binding for the device
    pub fn insert(&mut self, address: Address, entry: GattEntry) -> Option<GattEntry> {
        let previous = self.entries.insert(address, entry);
        if previous.is_none() {
            self.increment();
        }
        previous
    }

    pub fn remove(&mut self, address: &Address) -> Option<GattEntry> {
        let removed = self.entries.remove(address);
        if removed.is_some() {
            self.decrement();
        }
        removed
    }

    pub fn get(&self, address: &Address) -> Option<&GattEntry> {
        self.entries.get(address)
    }

    pub fn find_by_handle(&self, handle: ConnectionHandle) -> Option<(&Address, &GattEntry)> {
        self.entries.iter().find(|(_, entry)| entry.handle == handle)
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every binding and reset the counter
    pub fn clear(&mut self) -> Vec<(Address, GattEntry)> {
        self.reset();
        self.entries.drain().collect()
    }

    // ------------------------------------------------------------------------
    // Registered-service counter
    // ------------------------------------------------------------------------

    pub fn increment(&mut self) -> usize {
        self.registered += 1;
        self.registered
    }

    /// Never goes below zero
    pub fn decrement(&mut self) -> usize {
        self.registered = self.registered.saturating_sub(1);
        self.registered
    }

    pub fn reset(&mut self) {
        self.registered = 0;
    }

    pub fn registered_services(&self) -> usize {
        self.registered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ca_core::protocol::{
        LE_REQUEST_CHARACTERISTIC_UUID, LE_RESPONSE_CHARACTERISTIC_UUID, LE_SERVICE_UUID,
    };

    fn entry(handle: u32) -> GattEntry {
        GattEntry {
            handle: ConnectionHandle(handle),
            service: LE_SERVICE_UUID,
            read: LE_RESPONSE_CHARACTERISTIC_UUID,
            write: LE_REQUEST_CHARACTERISTIC_UUID,
        }
    }

    #[test]
    fn test_insert_lookup_remove() {
        let mut table = GattServiceTable::new();
        table.insert("AA".into(), entry(1));
        table.insert("BB".into(), entry(2));

        assert_eq!(table.len(), 2);
        assert_eq!(table.registered_services(), 2);
        assert_eq!(table.get(&"AA".into()).unwrap().handle, ConnectionHandle(1));

        let (address, _) = table.find_by_handle(ConnectionHandle(2)).unwrap();
        assert_eq!(address, &Address::new("BB"));

        assert!(table.remove(&"AA".into()).is_some());
        assert!(table.remove(&"AA".into()).is_none());
        assert_eq!(table.registered_services(), 1);
    }

    #[test]
    fn test_rebinding_does_not_double_count() {
        let mut table = GattServiceTable::new();
        table.insert("AA".into(), entry(1));
        let previous = table.insert("AA".into(), entry(5));

        assert_eq!(previous.map(|e| e.handle), Some(ConnectionHandle(1)));
        assert_eq!(table.registered_services(), 1);
        assert_eq!(table.get(&"AA".into()).unwrap().handle, ConnectionHandle(5));
    }

    #[test]
    fn test_counter_saturates_and_resets() {
        let mut table = GattServiceTable::new();
        assert_eq!(table.decrement(), 0);
        assert_eq!(table.increment(), 1);
        assert_eq!(table.increment(), 2);

        table.insert("AA".into(), entry(1));
        let drained = table.clear();
        assert_eq!(drained.len(), 1);
        assert!(table.is_empty());
        assert_eq!(table.registered_services(), 0);
    }
}
