//! BLE capability binding over btleplug
//!
//! The host acts as a GATT central. Discovery is a filtered scan; a service
//! search connects to the peripheral and enumerates its GATT services; a
//! connect binds the TX/RX characteristics, subscribes to notifications and
//! hands out a connection handle. Every platform completion is reported
//! through the registered [`EventSink`] from a spawned task, so the binding
//! calls themselves return as soon as the work is issued.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use ca_core::{
    Address, AdapterState, BindingError, BindingEvent, BindingResult, CapabilityBinding,
    ConnectionHandle, DataOrigin, EventSink, LocalConnectivity, ServiceId, ServiceList,
    TransportKind,
};
use futures::stream::StreamExt;
use hashbrown::HashMap;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BleConfig;
use crate::gatt::{GattEntry, GattServiceTable};

/// Bytes of each write echoed to the debug log
const LOG_PREVIEW: usize = 16;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

/// State reachable from the central event task and per-peripheral tasks
struct Shared {
    config: BleConfig,
    sink: RwLock<Option<EventSink>>,
    peripherals: Mutex<HashMap<Address, Peripheral>>,
    gatt: Mutex<GattServiceTable>,
    receivers: Mutex<HashMap<ConnectionHandle, JoinHandle<()>>>,
    next_handle: AtomicU32,
}

impl Shared {
    fn emit(&self, event: BindingEvent) {
        let sink = self
            .sink
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match sink {
            Some(sink) => {
                sink.emit(event);
            }
            None => debug!("No event sink registered, dropping {}", event.kind()),
        }
    }

    fn remember(&self, address: Address, peripheral: Peripheral) {
        lock(&self.peripherals).insert(address, peripheral);
    }

    fn peripheral(&self, address: &Address) -> Option<Peripheral> {
        lock(&self.peripherals).get(address).cloned()
    }

    /// Forget the GATT binding for a device and stop its notification task
    fn release(&self, address: &Address) -> Option<GattEntry> {
        let entry = lock(&self.gatt).remove(address)?;
        if let Some(task) = lock(&self.receivers).remove(&entry.handle) {
            task.abort();
        }
        Some(entry)
    }

    async fn ensure_connected(&self, peripheral: &Peripheral) -> BindingResult<()> {
        if peripheral.is_connected().await.unwrap_or(false) {
            return Ok(());
        }
        match timeout(self.config.connection_timeout, peripheral.connect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BindingError::operation("connect", e)),
            Err(_) => Err(BindingError::operation(
                "connect",
                format!("timed out after {:?}", self.config.connection_timeout),
            )),
        }
    }

    /// Connect if needed and enumerate the peripheral's GATT services
    async fn discover(&self, peripheral: &Peripheral) -> BindingResult<ServiceList> {
        self.ensure_connected(peripheral).await?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| BindingError::operation("service discovery", e))?;

        Ok(peripheral
            .services()
            .iter()
            .map(|service| ServiceId::from(service.uuid))
            .collect())
    }

    /// Bind TX/RX on `service`, subscribe to RX and start forwarding notifications
    async fn bind_gatt(
        self: &Arc<Self>,
        address: &Address,
        peripheral: &Peripheral,
        service: Uuid,
    ) -> BindingResult<ConnectionHandle> {
        self.ensure_connected(peripheral).await?;
        if peripheral.characteristics().is_empty() {
            peripheral
                .discover_services()
                .await
                .map_err(|e| BindingError::operation("service discovery", e))?;
        }

        let characteristics = peripheral.characteristics();
        let find = |uuid: Uuid| {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid && c.service_uuid == service)
                .cloned()
        };
        let rx = find(self.config.rx_characteristic)
            .ok_or_else(|| BindingError::operation("connect", "RX characteristic not found"))?;
        let tx = find(self.config.tx_characteristic)
            .ok_or_else(|| BindingError::operation("connect", "TX characteristic not found"))?;

        peripheral
            .subscribe(&rx)
            .await
            .map_err(|e| BindingError::operation("subscribe", e))?;
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| BindingError::operation("subscribe", e))?;

        let handle = ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let entry = GattEntry {
            handle,
            service,
            read: rx.uuid,
            write: tx.uuid,
        };
        if let Some(previous) = lock(&self.gatt).insert(address.clone(), entry) {
            if let Some(task) = lock(&self.receivers).remove(&previous.handle) {
                task.abort();
            }
        }

        let shared = Arc::clone(self);
        let source = address.clone();
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != entry.read {
                    continue;
                }
                debug!(
                    "Notification of {} byte(s) from {}",
                    notification.value.len(),
                    source
                );
                shared.emit(BindingEvent::DataReceived {
                    origin: DataOrigin::Handle(handle),
                    payload: Bytes::from(notification.value),
                });
            }
            debug!("Notification stream for {} ended", source);
        });
        lock(&self.receivers).insert(handle, task);

        Ok(handle)
    }

    async fn on_discovered(
        &self,
        adapter: &Adapter,
        id: &PeripheralId,
        advertised: Option<Vec<Uuid>>,
    ) {
        let peripheral = match adapter.peripheral(id).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                debug!("Discovered peripheral vanished: {}", e);
                return;
            }
        };
        let address = Address::new(peripheral.address().to_string());

        let services = match advertised {
            Some(services) => services,
            None => match peripheral.properties().await {
                Ok(Some(properties)) => properties.services,
                Ok(None) => Vec::new(),
                Err(e) => {
                    debug!("No properties for {}: {}", address, e);
                    Vec::new()
                }
            },
        };
        self.remember(address.clone(), peripheral);

        if self.config.filter_scan && !services.contains(&self.config.service_uuid) {
            return;
        }

        debug!("Discovered {} advertising {} service(s)", address, services.len());
        self.emit(BindingEvent::DiscoveryFound {
            address,
            services: services.into_iter().map(ServiceId::from).collect(),
        });
    }

    async fn on_disconnected(&self, adapter: &Adapter, id: &PeripheralId) {
        let Ok(peripheral) = adapter.peripheral(id).await else {
            return;
        };
        let address = Address::new(peripheral.address().to_string());
        if let Some(entry) = self.release(&address) {
            info!("Peripheral {} disconnected ({})", address, entry.handle);
        }
        self.emit(BindingEvent::SocketDisconnected { address });
    }
}

async fn run_central_events(adapter: Adapter, shared: Arc<Shared>) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            error!("Failed to subscribe to BLE central events: {}", e);
            return;
        }
    };

    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) => shared.on_discovered(&adapter, &id, None).await,
            CentralEvent::ServicesAdvertisement { id, services } => {
                shared.on_discovered(&adapter, &id, Some(services)).await
            }
            CentralEvent::DeviceDisconnected(id) => shared.on_disconnected(&adapter, &id).await,
            _ => {}
        }
    }
    debug!("BLE central event stream ended");
}

// ----------------------------------------------------------------------------
// BLE Binding
// ----------------------------------------------------------------------------

/// Capability binding driving the first local BLE adapter as a GATT central
pub struct BtleplugBinding {
    shared: Arc<Shared>,
    adapter: Mutex<Option<Adapter>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    discovering: AtomicBool,
}

impl BtleplugBinding {
    pub fn new(config: BleConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                sink: RwLock::new(None),
                peripherals: Mutex::new(HashMap::new()),
                gatt: Mutex::new(GattServiceTable::new()),
                receivers: Mutex::new(HashMap::new()),
                next_handle: AtomicU32::new(1),
            }),
            adapter: Mutex::new(None),
            event_task: Mutex::new(None),
            discovering: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BleConfig {
        &self.shared.config
    }

    /// Number of peripherals with a bound GATT service
    pub fn registered_services(&self) -> usize {
        lock(&self.shared.gatt).registered_services()
    }

    fn adapter(&self) -> BindingResult<Adapter> {
        lock(&self.adapter).clone().ok_or(BindingError::NotEnabled)
    }

    /// Peripheral for an address, asking the adapter if discovery never reported it
    async fn find_peripheral(&self, address: &Address) -> BindingResult<Peripheral> {
        let adapter = self.adapter()?;
        if let Some(peripheral) = self.shared.peripheral(address) {
            return Ok(peripheral);
        }

        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|e| BindingError::operation("peripheral lookup", e))?;
        let peripheral = peripherals
            .into_iter()
            .find(|p| p.address().to_string().eq_ignore_ascii_case(address.as_str()))
            .ok_or_else(|| BindingError::UnknownAddress(address.clone()))?;

        self.shared.remember(address.clone(), peripheral.clone());
        Ok(peripheral)
    }

    /// GATT service to bind for a requested service id
    fn service_uuid(&self, service: &ServiceId) -> Uuid {
        Uuid::parse_str(service.as_str()).unwrap_or(self.shared.config.service_uuid)
    }
}

#[async_trait]
impl CapabilityBinding for BtleplugBinding {
    fn transport(&self) -> TransportKind {
        TransportKind::Le
    }

    async fn enable(&self) -> BindingResult<()> {
        if lock(&self.adapter).is_some() {
            return Ok(());
        }

        let manager = Manager::new()
            .await
            .map_err(|e| BindingError::Unavailable(format!("Failed to create BLE manager: {}", e)))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| BindingError::Unavailable(format!("Failed to get BLE adapters: {}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| BindingError::Unavailable("No BLE adapters available".to_string()))?;

        let task = tokio::spawn(run_central_events(
            adapter.clone(),
            Arc::clone(&self.shared),
        ));
        *lock(&self.event_task) = Some(task);
        *lock(&self.adapter) = Some(adapter);

        info!("BLE adapter initialized");
        Ok(())
    }

    async fn disable(&self) {
        let Some(adapter) = lock(&self.adapter).take() else {
            return;
        };
        if self.discovering.swap(false, Ordering::AcqRel) {
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop BLE scan: {}", e);
            }
        }
        if let Some(task) = lock(&self.event_task).take() {
            task.abort();
        }

        let bound = lock(&self.shared.gatt).clear();
        for (_, task) in lock(&self.shared.receivers).drain() {
            task.abort();
        }
        for (address, _) in bound {
            if let Some(peripheral) = self.shared.peripheral(&address) {
                if let Err(e) = peripheral.disconnect().await {
                    warn!("Failed to disconnect from {}: {}", address, e);
                }
            }
        }
        lock(&self.shared.peripherals).clear();
        info!("BLE adapter released");
    }

    async fn adapter_state(&self) -> BindingResult<AdapterState> {
        Ok(if lock(&self.adapter).is_some() {
            AdapterState::Enabled
        } else {
            AdapterState::Disabled
        })
    }

    async fn local_connectivity(&self) -> BindingResult<LocalConnectivity> {
        let info = self
            .adapter()?
            .adapter_info()
            .await
            .map_err(|e| BindingError::operation("adapter info", e))?;
        Ok(LocalConnectivity::new(TransportKind::Le, info))
    }

    async fn register_events(&self, sink: EventSink) -> BindingResult<()> {
        *self
            .shared
            .sink
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sink);
        Ok(())
    }

    async fn unregister_events(&self) {
        *self
            .shared
            .sink
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    async fn is_discovering(&self) -> BindingResult<bool> {
        Ok(self.discovering.load(Ordering::Acquire))
    }

    async fn start_discovery(&self) -> BindingResult<()> {
        let adapter = self.adapter()?;
        let services = if self.shared.config.filter_scan {
            vec![self.shared.config.service_uuid]
        } else {
            Vec::new()
        };

        adapter
            .start_scan(ScanFilter { services })
            .await
            .map_err(|e| BindingError::operation("start scan", e))?;
        self.discovering.store(true, Ordering::Release);

        info!("Started BLE scanning for {}", self.shared.config.service_uuid);
        Ok(())
    }

    async fn stop_discovery(&self) -> BindingResult<()> {
        let adapter = self.adapter()?;
        adapter
            .stop_scan()
            .await
            .map_err(|e| BindingError::operation("stop scan", e))?;
        self.discovering.store(false, Ordering::Release);
        Ok(())
    }

    async fn start_service_search(&self, address: &Address) -> BindingResult<()> {
        let peripheral = self.find_peripheral(address).await?;
        let shared = Arc::clone(&self.shared);
        let address = address.clone();

        tokio::spawn(async move {
            let event = match shared.discover(&peripheral).await {
                Ok(services) => {
                    debug!("{} offers {} GATT service(s)", address, services.len());
                    BindingEvent::ServiceSearched { address, services }
                }
                Err(e) => {
                    warn!("Service search on {} failed: {}", address, e);
                    BindingEvent::ServiceSearchFailed {
                        address,
                        reason: e.to_string(),
                    }
                }
            };
            shared.emit(event);
        });
        Ok(())
    }

    async fn connect(&self, address: &Address, service: &ServiceId) -> BindingResult<()> {
        let peripheral = self.find_peripheral(address).await?;
        let service = self.service_uuid(service);
        let shared = Arc::clone(&self.shared);
        let address = address.clone();

        tokio::spawn(async move {
            let event = match shared.bind_gatt(&address, &peripheral, service).await {
                Ok(handle) => {
                    info!("Bound GATT service {} on {} as {}", service, address, handle);
                    BindingEvent::SocketConnected { address, handle }
                }
                Err(e) => {
                    warn!("Connect to {} failed: {}", address, e);
                    BindingEvent::ConnectFailed {
                        address,
                        reason: e.to_string(),
                    }
                }
            };
            shared.emit(event);
        });
        Ok(())
    }

    async fn write(&self, handle: ConnectionHandle, data: &[u8]) -> BindingResult<usize> {
        let (address, entry) = lock(&self.shared.gatt)
            .find_by_handle(handle)
            .map(|(address, entry)| (address.clone(), *entry))
            .ok_or(BindingError::UnknownHandle(handle))?;
        let peripheral = self
            .shared
            .peripheral(&address)
            .ok_or_else(|| BindingError::UnknownAddress(address.clone()))?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == entry.write && c.service_uuid == entry.service)
            .ok_or_else(|| BindingError::operation("write", "TX characteristic not found"))?;

        for chunk in self.shared.config.chunks(data) {
            peripheral
                .write(&characteristic, chunk, WriteType::WithoutResponse)
                .await
                .map_err(|e| BindingError::operation("write", e))?;
        }

        debug!(
            "Sent {} byte(s) to {}: {}",
            data.len(),
            address,
            hex::encode(&data[..data.len().min(LOG_PREVIEW)])
        );
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ca_core::protocol::LE_SERVICE_UUID;

    #[tokio::test]
    async fn test_disabled_until_enabled() {
        let binding = BtleplugBinding::new(BleConfig::default());
        assert_eq!(binding.transport(), TransportKind::Le);
        assert_eq!(
            binding.adapter_state().await.unwrap(),
            AdapterState::Disabled
        );
        assert!(!binding.is_discovering().await.unwrap());
        assert!(!binding.supports_multicast());
    }

    #[tokio::test]
    async fn test_radio_operations_require_enable() {
        let binding = BtleplugBinding::new(BleConfig::default());
        assert!(matches!(
            binding.start_discovery().await,
            Err(BindingError::NotEnabled)
        ));
        assert!(matches!(
            binding.start_service_search(&"AA:BB:CC:DD:EE:FF".into()).await,
            Err(BindingError::NotEnabled)
        ));
        assert!(matches!(
            binding.local_connectivity().await,
            Err(BindingError::NotEnabled)
        ));
    }

    #[tokio::test]
    async fn test_write_to_unbound_handle() {
        let binding = BtleplugBinding::new(BleConfig::default());
        assert!(matches!(
            binding.write(ConnectionHandle(9), b"data").await,
            Err(BindingError::UnknownHandle(ConnectionHandle(9)))
        ));
        assert!(matches!(
            binding.write_multicast(b"data").await,
            Err(BindingError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_disable_without_enable_is_noop() {
        let binding = BtleplugBinding::new(BleConfig::default());
        binding.disable().await;
        assert_eq!(binding.registered_services(), 0);
    }

    #[test]
    fn test_service_uuid_falls_back_to_configured() {
        let binding = BtleplugBinding::new(BleConfig::default());
        let other = Uuid::from_u128(0x1234);
        assert_eq!(binding.service_uuid(&ServiceId::from(other)), other);
        assert_eq!(binding.service_uuid(&ServiceId::new("oic.udp")), LE_SERVICE_UUID);
    }
}
