//! UDP capability binding
//!
//! UDP has no discovery and no connections, so the connection-oriented parts of
//! the binding interface complete immediately: a service search reports the
//! configured service straight away and a connect just allocates a handle for
//! the remote socket address. Broadcast is one datagram to the multicast group.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use ca_core::{
    Address, AdapterState, BindingError, BindingEvent, BindingResult, CapabilityBinding,
    ConnectionHandle, DataOrigin, EventSink, LocalConnectivity, ServiceId, ServiceList,
    TransportKind,
};
use hashbrown::HashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WifiConfig;

type SinkSlot = Arc<RwLock<Option<EventSink>>>;

/// Sockets and receive tasks alive between `enable` and `disable`
struct Running {
    unicast: Arc<UdpSocket>,
    local_ip: Ipv4Addr,
    tasks: Vec<JoinHandle<()>>,
}

/// Capability binding over plain UDP sockets
pub struct UdpBinding {
    config: WifiConfig,
    running: Mutex<Option<Running>>,
    sink: SinkSlot,
    connections: Mutex<HashMap<ConnectionHandle, SocketAddr>>,
    next_handle: AtomicU32,
    discovering: AtomicBool,
}

impl UdpBinding {
    pub fn new(config: WifiConfig) -> Self {
        Self {
            config,
            running: Mutex::new(None),
            sink: Arc::new(RwLock::new(None)),
            connections: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            discovering: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WifiConfig {
        &self.config
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionHandle, SocketAddr>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn unicast_socket(&self) -> BindingResult<Arc<UdpSocket>> {
        self.running()
            .as_ref()
            .map(|running| Arc::clone(&running.unicast))
            .ok_or(BindingError::NotEnabled)
    }

    /// Address the unicast socket is actually bound to
    pub fn local_unicast_addr(&self) -> Option<SocketAddr> {
        self.unicast_socket()
            .ok()
            .and_then(|socket| socket.local_addr().ok())
    }

    fn emit(&self, event: BindingEvent) {
        emit(&self.sink, event);
    }

    /// Accept `ip:port`, or a bare IP on the configured unicast port
    fn resolve(&self, address: &Address) -> BindingResult<SocketAddr> {
        let text = address.as_str();
        if let Ok(socket_addr) = text.parse::<SocketAddr>() {
            return Ok(socket_addr);
        }
        if let Ok(ip) = text.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.config.unicast_port));
        }
        Err(BindingError::UnknownAddress(address.clone()))
    }

    fn check_size(&self, data: &[u8]) -> BindingResult<()> {
        if data.len() > self.config.max_datagram {
            return Err(BindingError::operation(
                "write",
                format!(
                    "{} bytes exceeds datagram limit of {}",
                    data.len(),
                    self.config.max_datagram
                ),
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Socket Setup
// ----------------------------------------------------------------------------

fn bind_unicast(config: &WifiConfig) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&config.unicast_bind_addr().into())?;
    socket.set_nonblocking(true)?;
    socket.set_multicast_ttl_v4(config.multicast_ttl)?;
    socket.set_multicast_loop_v4(config.multicast_loopback)?;

    UdpSocket::from_std(socket.into())
}

fn bind_multicast(config: &WifiConfig) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.multicast_port);
    socket.bind(&bind_addr.into())?;
    socket.set_nonblocking(true)?;

    let socket = UdpSocket::from_std(socket.into())?;
    socket.join_multicast_v4(config.multicast_group, Ipv4Addr::UNSPECIFIED)?;
    Ok(socket)
}

/// First IPv4 address of an up, non-loopback interface
fn local_ipv4() -> Option<Ipv4Addr> {
    netdev::get_interfaces()
        .into_iter()
        .filter(|iface| iface.is_up() && !iface.is_loopback())
        .flat_map(|iface| iface.ipv4.into_iter().map(|net| net.addr()))
        .find(|addr| !addr.is_loopback() && !addr.is_link_local())
}

fn emit(sink: &SinkSlot, event: BindingEvent) {
    let sink = sink
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

async fn receive_loop(
    socket: Arc<UdpSocket>,
    sink: SinkSlot,
    max_datagram: usize,
    skip_from: Option<Ipv4Addr>,
) {
    let mut buf = vec![0u8; max_datagram];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!("UDP receive error: {}", e);
                continue;
            }
        };

        if skip_from.is_some_and(|local| from.ip() == IpAddr::V4(local)) {
            debug!("Skipping our own multicast datagram");
            continue;
        }

        debug!("Received {} byte(s) from {}", len, from);
        emit(
            &sink,
            BindingEvent::DataReceived {
                origin: DataOrigin::Address(Address::new(from.to_string())),
                payload: Bytes::copy_from_slice(&buf[..len]),
            },
        );
    }
}

// ----------------------------------------------------------------------------
// Capability Binding
// ----------------------------------------------------------------------------

#[async_trait]
impl CapabilityBinding for UdpBinding {
    fn transport(&self) -> TransportKind {
        TransportKind::Wifi
    }

    async fn enable(&self) -> BindingResult<()> {
        if self.running().is_some() {
            return Ok(());
        }

        let unicast = Arc::new(bind_unicast(&self.config)?);
        let local_ip = local_ipv4().unwrap_or(Ipv4Addr::LOCALHOST);
        let mut tasks = vec![tokio::spawn(receive_loop(
            Arc::clone(&unicast),
            Arc::clone(&self.sink),
            self.config.max_datagram,
            None,
        ))];

        if self.config.join_multicast {
            match bind_multicast(&self.config) {
                Ok(multicast) => tasks.push(tokio::spawn(receive_loop(
                    Arc::new(multicast),
                    Arc::clone(&self.sink),
                    self.config.max_datagram,
                    Some(local_ip),
                ))),
                Err(e) => warn!(
                    "Multicast receive unavailable on {}: {}",
                    self.config.multicast_addr(),
                    e
                ),
            }
        }

        info!(
            "UDP binding listening on {}",
            unicast.local_addr().map_err(BindingError::Io)?
        );
        *self.running() = Some(Running {
            unicast,
            local_ip,
            tasks,
        });
        Ok(())
    }

    async fn disable(&self) {
        if let Some(running) = self.running().take() {
            for task in running.tasks {
                task.abort();
            }
            info!("UDP binding closed");
        }
        self.connections().clear();
        self.discovering.store(false, Ordering::Release);
    }

    async fn adapter_state(&self) -> BindingResult<AdapterState> {
        Ok(if self.running().is_some() {
            AdapterState::Enabled
        } else {
            AdapterState::Disabled
        })
    }

    async fn local_connectivity(&self) -> BindingResult<LocalConnectivity> {
        let local_ip = self
            .running()
            .as_ref()
            .map(|running| running.local_ip)
            .ok_or(BindingError::NotEnabled)?;
        Ok(LocalConnectivity::new(
            TransportKind::Wifi,
            local_ip.to_string(),
        ))
    }

    async fn register_events(&self, sink: EventSink) -> BindingResult<()> {
        *self
            .sink
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sink);
        Ok(())
    }

    async fn unregister_events(&self) {
        *self
            .sink
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    async fn is_discovering(&self) -> BindingResult<bool> {
        Ok(self.discovering.load(Ordering::Acquire))
    }

    async fn start_discovery(&self) -> BindingResult<()> {
        // Peers announce themselves by sending; nothing to scan for
        self.discovering.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop_discovery(&self) -> BindingResult<()> {
        self.discovering.store(false, Ordering::Release);
        Ok(())
    }

    async fn start_service_search(&self, address: &Address) -> BindingResult<()> {
        self.resolve(address)?;
        let services: ServiceList = std::iter::once(self.config.service.clone()).collect();
        self.emit(BindingEvent::ServiceSearched {
            address: address.clone(),
            services,
        });
        Ok(())
    }

    async fn connect(&self, address: &Address, _service: &ServiceId) -> BindingResult<()> {
        let remote = self.resolve(address)?;
        let handle = {
            let mut connections = self.connections();
            let existing = connections
                .iter()
                .find(|(_, mapped)| **mapped == remote)
                .map(|(handle, _)| *handle);
            match existing {
                Some(handle) => handle,
                None => {
                    let handle =
                        ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
                    connections.insert(handle, remote);
                    handle
                }
            }
        };

        debug!("Mapped {} to {} on {}", address, remote, handle);
        self.emit(BindingEvent::SocketConnected {
            address: address.clone(),
            handle,
        });
        Ok(())
    }

    async fn write(&self, handle: ConnectionHandle, data: &[u8]) -> BindingResult<usize> {
        self.check_size(data)?;
        let remote = self
            .connections()
            .get(&handle)
            .copied()
            .ok_or(BindingError::UnknownHandle(handle))?;
        let socket = self.unicast_socket()?;

        Ok(socket.send_to(data, remote).await?)
    }

    fn supports_multicast(&self) -> bool {
        true
    }

    async fn write_multicast(&self, data: &[u8]) -> BindingResult<usize> {
        self.check_size(data)?;
        let socket = self.unicast_socket()?;
        Ok(socket.send_to(data, self.config.multicast_addr()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_accepts_bare_ip_and_socket_addr() {
        let binding = UdpBinding::new(WifiConfig::default());
        assert_eq!(
            binding.resolve(&"10.0.0.2".into()).unwrap().to_string(),
            "10.0.0.2:5383"
        );
        assert_eq!(
            binding.resolve(&"10.0.0.2:9000".into()).unwrap().to_string(),
            "10.0.0.2:9000"
        );
        assert!(matches!(
            binding.resolve(&"AA:BB:CC".into()),
            Err(BindingError::UnknownAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_operations_before_enable() {
        let binding = UdpBinding::new(WifiConfig::loopback());
        assert_eq!(
            binding.adapter_state().await.unwrap(),
            AdapterState::Disabled
        );
        assert!(matches!(
            binding.write_multicast(b"x").await,
            Err(BindingError::NotEnabled)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_reuses_handle() {
        let binding = UdpBinding::new(WifiConfig::loopback());
        binding.enable().await.unwrap();
        let (sink, mut events) = EventSink::channel();
        binding.register_events(sink).await.unwrap();

        for _ in 0..100 {
            binding
                .connect(&"127.0.0.1:9".into(), &ServiceId::new("oic.udp"))
                .await
                .unwrap();
        }
        binding
            .connect(&"127.0.0.1:10".into(), &ServiceId::new("oic.udp"))
            .await
            .unwrap();

        assert_eq!(binding.connections().len(), 2);
        let mut handles = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let BindingEvent::SocketConnected { handle, .. } = event {
                handles.push(handle);
            }
        }
        assert_eq!(handles.len(), 101);
        assert!(handles[..100].iter().all(|handle| *handle == handles[0]));
        assert_ne!(handles[100], handles[0]);
        binding.disable().await;
    }

    #[tokio::test]
    async fn test_oversized_datagram_rejected() {
        let binding = UdpBinding::new(WifiConfig::loopback().with_max_datagram(4));
        binding.enable().await.unwrap();
        let err = binding.write_multicast(b"too long").await.unwrap_err();
        assert!(matches!(err, BindingError::OperationFailed { .. }));
        binding.disable().await;
    }
}
