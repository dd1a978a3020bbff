//! In-memory capability binding for tests
//!
//! `MockBinding` never touches a radio. It records every call made on it and
//! lets a test inject the platform callbacks an adapter would normally get,
//! so the connection state machine can be driven step by step.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;

use crate::binding::{BindingEvent, CapabilityBinding, EventSink};
use crate::errors::{BindingError, BindingResult};
use crate::types::{
    Address, AdapterState, ConnectionHandle, LocalConnectivity, ServiceId, TransportKind,
};

/// A call made on the mock, in the order it was made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingCall {
    Enable,
    Disable,
    RegisterEvents,
    UnregisterEvents,
    StartDiscovery,
    StopDiscovery,
    ServiceSearch(Address),
    Connect(Address, ServiceId),
    Write(ConnectionHandle, Bytes),
    Multicast(Bytes),
}

#[derive(Debug)]
struct MockState {
    adapter_state: AdapterState,
    discovering: bool,
    local_address: Address,
    sink: Option<EventSink>,
    calls: Vec<BindingCall>,
    fail_enable: bool,
    fail_service_search: bool,
    fail_connect: bool,
    fail_all_writes: bool,
    failing_payloads: Vec<Bytes>,
    multicast: bool,
}

/// Scriptable capability binding that records calls and injects events
#[derive(Debug)]
pub struct MockBinding {
    transport: TransportKind,
    state: Mutex<MockState>,
}

impl MockBinding {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            state: Mutex::new(MockState {
                adapter_state: AdapterState::Enabled,
                discovering: false,
                local_address: Address::new("00:11:22:33:44:55"),
                sink: None,
                calls: Vec::new(),
                fail_enable: false,
                fail_service_search: false,
                fail_connect: false,
                fail_all_writes: false,
                failing_payloads: Vec::new(),
                multicast: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------------

    /// Set the radio power state reported by `adapter_state`
    pub fn set_adapter_state(&self, state: AdapterState) {
        self.state().adapter_state = state;
    }

    pub fn set_local_address(&self, address: impl Into<Address>) {
        self.state().local_address = address.into();
    }

    /// Make `enable` fail as if the platform stack were missing
    pub fn fail_enable(&self, fail: bool) {
        self.state().fail_enable = fail;
    }

    /// Make `start_service_search` fail immediately
    pub fn fail_service_search(&self, fail: bool) {
        self.state().fail_service_search = fail;
    }

    /// Make `connect` fail immediately
    pub fn fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    /// Make every write fail
    pub fn fail_all_writes(&self, fail: bool) {
        self.state().fail_all_writes = fail;
    }

    /// Make writes of exactly `payload` fail
    pub fn fail_writes_of(&self, payload: impl Into<Bytes>) {
        self.state().failing_payloads.push(payload.into());
    }

    /// Advertise and accept multicast writes
    pub fn enable_multicast(&self, enabled: bool) {
        self.state().multicast = enabled;
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn calls(&self) -> Vec<BindingCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Every successful or attempted unicast write, in order
    pub fn writes(&self) -> Vec<(ConnectionHandle, Bytes)> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                BindingCall::Write(handle, data) => Some((*handle, data.clone())),
                _ => None,
            })
            .collect()
    }

    /// Payloads written to one connection, in order
    pub fn writes_to(&self, handle: ConnectionHandle) -> Vec<Bytes> {
        self.writes()
            .into_iter()
            .filter(|(written, _)| *written == handle)
            .map(|(_, data)| data)
            .collect()
    }

    pub fn connects(&self) -> Vec<Address> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                BindingCall::Connect(address, _) => Some(address.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn searches(&self) -> Vec<Address> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                BindingCall::ServiceSearch(address) => Some(address.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn multicasts(&self) -> Vec<Bytes> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                BindingCall::Multicast(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_registered(&self) -> bool {
        self.state().sink.is_some()
    }

    /// Deliver a platform callback to the registered sink
    ///
    /// Returns `false` when nothing is registered or the adapter stopped
    /// listening.
    pub fn emit(&self, event: BindingEvent) -> bool {
        let sink = self.state().sink.clone();
        match sink {
            Some(sink) => sink.emit(event),
            None => false,
        }
    }
}

#[async_trait]
impl CapabilityBinding for MockBinding {
    fn transport(&self) -> TransportKind {
        self.transport
    }

    async fn enable(&self) -> BindingResult<()> {
        let mut state = self.state();
        state.calls.push(BindingCall::Enable);
        if state.fail_enable {
            return Err(BindingError::Unavailable("mock stack missing".to_string()));
        }
        Ok(())
    }

    async fn disable(&self) {
        self.state().calls.push(BindingCall::Disable);
    }

    async fn adapter_state(&self) -> BindingResult<AdapterState> {
        Ok(self.state().adapter_state)
    }

    async fn local_connectivity(&self) -> BindingResult<LocalConnectivity> {
        let address = self.state().local_address.clone();
        Ok(LocalConnectivity::new(self.transport, address))
    }

    async fn register_events(&self, sink: EventSink) -> BindingResult<()> {
        let mut state = self.state();
        state.calls.push(BindingCall::RegisterEvents);
        state.sink = Some(sink);
        Ok(())
    }

    async fn unregister_events(&self) {
        let mut state = self.state();
        state.calls.push(BindingCall::UnregisterEvents);
        state.sink = None;
    }

    async fn is_discovering(&self) -> BindingResult<bool> {
        Ok(self.state().discovering)
    }

    async fn start_discovery(&self) -> BindingResult<()> {
        let mut state = self.state();
        state.calls.push(BindingCall::StartDiscovery);
        state.discovering = true;
        Ok(())
    }

    async fn stop_discovery(&self) -> BindingResult<()> {
        let mut state = self.state();
        state.calls.push(BindingCall::StopDiscovery);
        state.discovering = false;
        Ok(())
    }

    async fn start_service_search(&self, address: &Address) -> BindingResult<()> {
        let mut state = self.state();
        state.calls.push(BindingCall::ServiceSearch(address.clone()));
        if state.fail_service_search {
            return Err(BindingError::operation("service search", "mock failure"));
        }
        Ok(())
    }

    async fn connect(&self, address: &Address, service: &ServiceId) -> BindingResult<()> {
        let mut state = self.state();
        state
            .calls
            .push(BindingCall::Connect(address.clone(), service.clone()));
        if state.fail_connect {
            return Err(BindingError::operation("connect", "mock failure"));
        }
        Ok(())
    }

    async fn write(&self, handle: ConnectionHandle, data: &[u8]) -> BindingResult<usize> {
        let mut state = self.state();
        let payload = Bytes::copy_from_slice(data);
        let fails = state.fail_all_writes || state.failing_payloads.contains(&payload);
        state.calls.push(BindingCall::Write(handle, payload));
        if fails {
            return Err(BindingError::operation("write", "mock failure"));
        }
        Ok(data.len())
    }

    fn supports_multicast(&self) -> bool {
        self.state().multicast
    }

    async fn write_multicast(&self, data: &[u8]) -> BindingResult<usize> {
        let mut state = self.state();
        if !state.multicast {
            return Err(BindingError::Unsupported("multicast"));
        }
        state
            .calls
            .push(BindingCall::Multicast(Bytes::copy_from_slice(data)));
        if state.fail_all_writes {
            return Err(BindingError::operation("multicast write", "mock failure"));
        }
        Ok(data.len())
    }
}
