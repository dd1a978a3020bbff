//! Connection controller
//!
//! Drives every peer through discovery → service search → connect → data flow
//! → teardown. Outbound messages arrive from the send worker through
//! [`ConnectionController::dispatch`]; platform callbacks arrive from the event
//! pump through [`ConnectionController::handle_event`]. Both take the registry
//! lock for the whole transition, so callbacks racing on different threads are
//! applied one at a time.
//!
//! Failures here are never reported to the caller of `send`: the affected peer
//! is removed, its buffered data is dropped and a warning is logged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ca_core::{
    Address, AdapterConfig, BindingEvent, CaError, CaResult, CapabilityBinding, ConnectionHandle,
    DataOrigin, Destination, InboundPacket, QueueMessage, ServiceId, ServiceList,
};
use tracing::{debug, info, warn};

use crate::peer::{DiscoveryState, PendingOutcome};
use crate::registry::{PeerRegistry, PeerTable};

/// Event-driven per-peer state machine for one adapter
pub struct ConnectionController {
    binding: Arc<dyn CapabilityBinding>,
    registry: Arc<PeerRegistry>,
    service: ServiceId,
    connect_timeout: Duration,
}

impl ConnectionController {
    pub fn new(
        binding: Arc<dyn CapabilityBinding>,
        registry: Arc<PeerRegistry>,
        config: &AdapterConfig,
    ) -> Self {
        Self {
            binding,
            registry,
            service: config.service.clone(),
            connect_timeout: config.connect_timeout(),
        }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Deliver or buffer one message taken off the send queue
    pub async fn dispatch(&self, message: QueueMessage) -> CaResult<()> {
        match message.destination {
            Destination::Unicast(address) => {
                self.send_unicast(&address, &message.service, message.payload)
                    .await
            }
            Destination::Broadcast => self.send_broadcast(message.payload).await,
        }
    }

    async fn send_unicast(
        &self,
        address: &Address,
        service: &ServiceId,
        payload: Bytes,
    ) -> CaResult<()> {
        let mut table = self.registry.lock().await;

        let state = table.find(address).map(|peer| peer.state());
        match state {
            None | Some(DiscoveryState::Failed) => {
                if state.is_some() {
                    table.remove(address);
                }
                if let Err(e) = table.get_or_create(address, service).map(|_| ()) {
                    warn!("Dropping message for {}: {}", address, e);
                    table.record_dropped(1);
                    return Err(e);
                }
                debug!("Unknown peer {}, starting service search", address);
                Self::buffer(&mut table, address, payload);
                self.issue_service_search(&mut table, address).await
            }
            Some(DiscoveryState::Connected) => self.write_to(&mut table, address, payload).await,
            Some(DiscoveryState::ServiceSearched) => {
                Self::buffer(&mut table, address, payload);
                if self.issue_connect_or_remove(&mut table, address).await {
                    Ok(())
                } else {
                    Err(CaError::connection_failed(address, "connect could not be issued"))
                }
            }
            Some(DiscoveryState::Discovered) => {
                Self::buffer(&mut table, address, payload);
                self.issue_service_search(&mut table, address).await
            }
            Some(DiscoveryState::ServiceSearchPending) | Some(DiscoveryState::Connecting) => {
                debug!("Connection to {} in progress, buffering", address);
                Self::buffer(&mut table, address, payload);
                Ok(())
            }
        }
    }

    async fn send_broadcast(&self, payload: Bytes) -> CaResult<()> {
        if self.binding.supports_multicast() {
            let result = self.binding.write_multicast(&payload).await;
            let mut table = self.registry.lock().await;
            return match result {
                Ok(_) => {
                    table.record_written(1);
                    Ok(())
                }
                Err(e) => {
                    warn!("Multicast write failed, dropping broadcast: {}", e);
                    table.record_dropped(1);
                    Err(e.into())
                }
            };
        }

        let mut table = self.registry.lock().await;
        if table.is_empty() {
            debug!("Broadcast with no known peers");
            return Ok(());
        }

        let mut failed = Vec::new();
        for address in table.addresses() {
            let Some(peer) = table.find(&address) else {
                continue;
            };

            match (peer.state(), peer.handle()) {
                (DiscoveryState::Connected, Some(handle)) => {
                    match self.binding.write(handle, &payload).await {
                        Ok(_) => table.record_written(1),
                        Err(e) => {
                            warn!("Broadcast write to {} failed: {}", address, e);
                            table.record_dropped(1);
                            failed.push(address);
                        }
                    }
                }
                (DiscoveryState::ServiceSearched, _) => {
                    let queued = Self::buffer(&mut table, &address, payload.clone());
                    if !self.issue_connect(&mut table, &address).await {
                        // Keep the peer; only this broadcast is withdrawn
                        if let Some(peer) = table.find_mut(&address) {
                            if queued {
                                peer.pop_newest();
                            }
                            peer.set_state(DiscoveryState::ServiceSearched);
                        }
                        if queued {
                            table.record_dropped(1);
                        }
                    }
                }
                (DiscoveryState::Connecting, _) => {
                    Self::buffer(&mut table, &address, payload.clone());
                }
                _ => debug!("Skipping {} in broadcast, services not known", address),
            }
        }

        for address in failed {
            self.fail_peer(&mut table, &address, "broadcast write failed");
        }
        Ok(())
    }

    async fn write_to(
        &self,
        table: &mut PeerTable,
        address: &Address,
        payload: Bytes,
    ) -> CaResult<()> {
        let Some(handle) = table.find(address).and_then(|peer| peer.handle()) else {
            return Err(CaError::connection_failed(address, "no open connection"));
        };

        match self.binding.write(handle, &payload).await {
            Ok(written) => {
                debug!("Wrote {} byte(s) to {} on {}", written, address, handle);
                table.record_written(1);
                Ok(())
            }
            Err(e) => {
                table.record_dropped(1);
                self.fail_peer(table, address, &e.to_string());
                Err(CaError::connection_failed(address, e))
            }
        }
    }

    /// Buffer for a pending peer; returns whether the message was kept
    fn buffer(table: &mut PeerTable, address: &Address, payload: Bytes) -> bool {
        match table.buffer_pending(address, payload) {
            Some(PendingOutcome::Queued) => true,
            Some(PendingOutcome::DroppedOldest) => {
                warn!("Pending queue for {} full, dropped oldest message", address);
                true
            }
            Some(PendingOutcome::Rejected) => {
                warn!("Pending queue for {} full, rejected new message", address);
                false
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Platform Requests
    // ------------------------------------------------------------------------

    async fn issue_service_search(&self, table: &mut PeerTable, address: &Address) -> CaResult<()> {
        if let Some(peer) = table.find_mut(address) {
            peer.set_state(DiscoveryState::ServiceSearchPending);
        }

        if let Err(e) = self.binding.start_service_search(address).await {
            self.fail_peer(table, address, &e.to_string());
            return Err(CaError::connection_failed(address, e));
        }
        Ok(())
    }

    /// Issue a connect; on immediate failure the peer is left for the caller
    async fn issue_connect(&self, table: &mut PeerTable, address: &Address) -> bool {
        let Some(peer) = table.find_mut(address) else {
            return false;
        };
        let service = peer.service().clone();
        peer.set_state(DiscoveryState::Connecting);

        match self.binding.connect(address, &service).await {
            Ok(()) => {
                debug!("Connecting to {}", address);
                true
            }
            Err(e) => {
                warn!("Connect to {} could not be issued: {}", address, e);
                false
            }
        }
    }

    /// Issue a connect, removing the peer when it cannot be issued
    async fn issue_connect_or_remove(&self, table: &mut PeerTable, address: &Address) -> bool {
        if self.issue_connect(table, address).await {
            return true;
        }
        self.fail_peer(table, address, "connect could not be issued");
        false
    }

    /// Mark the peer failed and drop it with its buffered data
    fn fail_peer(&self, table: &mut PeerTable, address: &Address, reason: &str) {
        if let Some(peer) = table.find_mut(address) {
            peer.set_state(DiscoveryState::Failed);
        }
        if let Some(peer) = table.remove(address) {
            if peer.has_pending() {
                warn!(
                    "Removed peer {} ({}), dropped {} pending message(s)",
                    address,
                    reason,
                    peer.pending_len()
                );
            } else {
                warn!("Removed peer {} ({})", address, reason);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Platform Events
    // ------------------------------------------------------------------------

    /// Apply one platform callback; returns inbound data for the receive callback
    pub async fn handle_event(&self, event: BindingEvent) -> Option<InboundPacket> {
        match event {
            BindingEvent::AdapterStateChanged(_) => None,
            BindingEvent::DiscoveryFound { address, services } => {
                self.on_discovery_found(&address, &services).await;
                None
            }
            BindingEvent::ServiceSearched { address, services } => {
                self.on_service_searched(&address, &services).await;
                None
            }
            BindingEvent::ServiceSearchFailed { address, reason } => {
                let mut table = self.registry.lock().await;
                self.fail_peer(&mut table, &address, &reason);
                None
            }
            BindingEvent::SocketConnected { address, handle } => {
                self.on_socket_connected(&address, handle).await;
                None
            }
            BindingEvent::ConnectFailed { address, reason } => {
                let mut table = self.registry.lock().await;
                self.fail_peer(&mut table, &address, &reason);
                None
            }
            BindingEvent::SocketDisconnected { address } => {
                let mut table = self.registry.lock().await;
                if let Some(peer) = table.remove(&address) {
                    info!("Peer {} disconnected", address);
                    if peer.has_pending() {
                        warn!(
                            "Dropped {} pending message(s) for {}",
                            peer.pending_len(),
                            address
                        );
                    }
                }
                None
            }
            BindingEvent::DataReceived { origin, payload } => {
                self.on_data_received(origin, payload).await
            }
        }
    }

    async fn on_discovery_found(&self, address: &Address, services: &ServiceList) {
        if !self.service.is_offered_by(services) {
            debug!("Ignoring {}, target service not advertised", address);
            return;
        }

        let mut table = self.registry.lock().await;
        let peer = match table.get_or_create(address, &self.service) {
            Ok(peer) => peer,
            Err(e) => {
                warn!("Not tracking discovered device {}: {}", address, e);
                return;
            }
        };

        if peer.state() < DiscoveryState::ServiceSearched {
            debug!("Discovered {} offering target service", address);
            peer.set_state(DiscoveryState::ServiceSearched);
            if peer.has_pending() && !self.issue_connect_or_remove(&mut table, address).await {
                debug!("Connect to discovered {} not issued, peer dropped", address);
            }
        }
    }

    async fn on_service_searched(&self, address: &Address, services: &ServiceList) {
        let mut table = self.registry.lock().await;
        let Some(peer) = table.find_mut(address) else {
            debug!("Service search result for untracked {}", address);
            return;
        };

        if peer.state() >= DiscoveryState::ServiceSearched {
            debug!("Service search for {} already handled", address);
            return;
        }

        if !peer.service().is_offered_by(services) {
            self.fail_peer(&mut table, address, "target service not offered");
            return;
        }

        peer.set_state(DiscoveryState::ServiceSearched);
        if peer.has_pending() && !self.issue_connect_or_remove(&mut table, address).await {
            debug!("Connect to searched {} not issued, peer dropped", address);
        }
    }

    async fn on_socket_connected(&self, address: &Address, handle: ConnectionHandle) {
        let mut table = self.registry.lock().await;

        let pending = match table.find_mut(address) {
            Some(peer) if peer.state() == DiscoveryState::Connected => {
                if peer.handle() != Some(handle) {
                    debug!("Peer {} reconnected on {}", address, handle);
                    peer.mark_connected(handle);
                }
                return;
            }
            Some(peer) => {
                peer.mark_connected(handle);
                peer.take_pending()
            }
            None => {
                if let Err(e) = table.insert_connected(address, &self.service, handle) {
                    warn!("Not tracking inbound connection from {}: {}", address, e);
                    return;
                }
                info!("Inbound connection from {} on {}", address, handle);
                return;
            }
        };

        info!("Connected to {} on {}", address, handle);
        if pending.is_empty() {
            return;
        }

        debug!("Flushing {} pending message(s) to {}", pending.len(), address);
        let total = pending.len();
        for (sent, data) in pending.into_iter().enumerate() {
            if let Err(e) = self.binding.write(handle, &data).await {
                let dropped = total - sent;
                table.record_dropped(dropped);
                warn!(
                    "Flush to {} failed after {} message(s), dropping {}: {}",
                    address, sent, dropped, e
                );
                self.fail_peer(&mut table, address, "pending flush failed");
                return;
            }
            table.record_written(1);
        }
    }

    async fn on_data_received(&self, origin: DataOrigin, payload: Bytes) -> Option<InboundPacket> {
        let table = self.registry.lock().await;
        let (source, service) = match origin {
            DataOrigin::Handle(handle) => match table.find_by_handle(handle) {
                Some(peer) => (peer.address().clone(), peer.service().clone()),
                None => {
                    warn!("Dropping {} byte(s) from unknown connection {}", payload.len(), handle);
                    return None;
                }
            },
            DataOrigin::Address(address) => {
                let service = table
                    .find(&address)
                    .map(|peer| peer.service().clone())
                    .unwrap_or_else(|| self.service.clone());
                (address, service)
            }
        };

        debug!("Received {} byte(s) from {}", payload.len(), source);
        Some(InboundPacket {
            source,
            service,
            payload,
        })
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Fail and remove every peer stuck waiting on the platform; returns the count
    pub async fn sweep_stalled(&self, now: Instant) -> usize {
        let mut table = self.registry.lock().await;
        let stalled: Vec<Address> = table
            .iter()
            .filter(|peer| peer.is_stalled(now, self.connect_timeout))
            .map(|peer| peer.address().clone())
            .collect();

        for address in &stalled {
            self.fail_peer(&mut table, address, "connection attempt timed out");
        }
        stalled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ca_core::{BindingCall, MockBinding, OverflowPolicy, TransportKind};

    const SVC: &str = "svc";

    fn services(ids: &[&str]) -> ServiceList {
        ids.iter().map(|id| ServiceId::new(*id)).collect()
    }

    fn setup(config: AdapterConfig) -> (Arc<MockBinding>, ConnectionController) {
        let mock = Arc::new(MockBinding::new(TransportKind::Edr));
        let registry = Arc::new(PeerRegistry::new(
            config.max_peers,
            config.max_pending_per_peer,
            config.pending_overflow,
        ));
        let controller = ConnectionController::new(mock.clone(), registry, &config);
        (mock, controller)
    }

    fn config() -> AdapterConfig {
        AdapterConfig::default().with_service(SVC)
    }

    fn unicast(address: &str, payload: &'static str) -> QueueMessage {
        QueueMessage::new(
            Destination::Unicast(address.into()),
            ServiceId::new(SVC),
            payload,
        )
    }

    async fn state_of(controller: &ConnectionController, address: &str) -> Option<DiscoveryState> {
        let table = controller.registry().lock().await;
        table.find(&address.into()).map(|peer| peer.state())
    }

    #[tokio::test]
    async fn test_unknown_peer_starts_search_and_buffers() {
        let (mock, controller) = setup(config());
        controller.dispatch(unicast("AA", "hello")).await.unwrap();

        assert_eq!(mock.searches(), vec![Address::new("AA")]);
        assert_eq!(
            state_of(&controller, "AA").await,
            Some(DiscoveryState::ServiceSearchPending)
        );
        let table = controller.registry().lock().await;
        assert_eq!(table.find(&"AA".into()).unwrap().pending_len(), 1);
    }

    #[tokio::test]
    async fn test_failed_search_request_removes_peer() {
        let (mock, controller) = setup(config());
        mock.fail_service_search(true);

        let err = controller.dispatch(unicast("AA", "hello")).await.unwrap_err();
        assert!(matches!(err, CaError::ConnectionFailed { .. }));
        assert_eq!(state_of(&controller, "AA").await, None);
    }

    #[tokio::test]
    async fn test_discovery_ignores_other_services() {
        let (_mock, controller) = setup(config());
        controller
            .handle_event(BindingEvent::DiscoveryFound {
                address: "AA".into(),
                services: services(&["other"]),
            })
            .await;
        assert_eq!(state_of(&controller, "AA").await, None);

        controller
            .handle_event(BindingEvent::DiscoveryFound {
                address: "AA".into(),
                services: services(&["other", "SVC"]),
            })
            .await;
        assert_eq!(
            state_of(&controller, "AA").await,
            Some(DiscoveryState::ServiceSearched)
        );
    }

    #[tokio::test]
    async fn test_discovery_connects_peer_with_pending_data() {
        let (mock, controller) = setup(config());
        controller.dispatch(unicast("AA", "hello")).await.unwrap();
        controller
            .handle_event(BindingEvent::DiscoveryFound {
                address: "AA".into(),
                services: services(&[SVC]),
            })
            .await;

        assert_eq!(mock.connects(), vec![Address::new("AA")]);
        assert_eq!(
            state_of(&controller, "AA").await,
            Some(DiscoveryState::Connecting)
        );
    }

    #[tokio::test]
    async fn test_search_without_target_removes_peer() {
        let (_mock, controller) = setup(config());
        controller.dispatch(unicast("AA", "hello")).await.unwrap();
        controller
            .handle_event(BindingEvent::ServiceSearched {
                address: "AA".into(),
                services: services(&["other"]),
            })
            .await;

        assert_eq!(state_of(&controller, "AA").await, None);
        let stats = controller.registry().stats().await;
        assert_eq!(stats.messages_dropped, 1);
    }

    #[tokio::test]
    async fn test_search_failed_and_connect_failed_remove_peer() {
        let (_mock, controller) = setup(config());
        controller.dispatch(unicast("AA", "a")).await.unwrap();
        controller.dispatch(unicast("BB", "b")).await.unwrap();

        controller
            .handle_event(BindingEvent::ServiceSearchFailed {
                address: "AA".into(),
                reason: "timeout".into(),
            })
            .await;
        controller
            .handle_event(BindingEvent::ConnectFailed {
                address: "BB".into(),
                reason: "refused".into(),
            })
            .await;

        assert!(controller.registry().lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_inbound_connection_creates_connected_peer() {
        let (_mock, controller) = setup(config());
        controller
            .handle_event(BindingEvent::SocketConnected {
                address: "AA".into(),
                handle: ConnectionHandle(9),
            })
            .await;

        assert_eq!(
            state_of(&controller, "AA").await,
            Some(DiscoveryState::Connected)
        );

        let packet = controller
            .handle_event(BindingEvent::DataReceived {
                origin: DataOrigin::Handle(ConnectionHandle(9)),
                payload: Bytes::from("ping"),
            })
            .await
            .unwrap();
        assert_eq!(packet.source, Address::new("AA"));
        assert_eq!(packet.service, ServiceId::new(SVC));
        assert_eq!(packet.payload, Bytes::from("ping"));
    }

    #[tokio::test]
    async fn test_data_from_unknown_handle_is_dropped() {
        let (_mock, controller) = setup(config());
        let packet = controller
            .handle_event(BindingEvent::DataReceived {
                origin: DataOrigin::Handle(ConnectionHandle(1)),
                payload: Bytes::from("ping"),
            })
            .await;
        assert!(packet.is_none());
    }

    #[tokio::test]
    async fn test_connectionless_data_uses_sender_address() {
        let (_mock, controller) = setup(config());
        let packet = controller
            .handle_event(BindingEvent::DataReceived {
                origin: DataOrigin::Address("10.0.0.2:5383".into()),
                payload: Bytes::from("ping"),
            })
            .await
            .unwrap();
        assert_eq!(packet.source, Address::new("10.0.0.2:5383"));
        assert_eq!(packet.service, ServiceId::new(SVC));
    }

    #[tokio::test]
    async fn test_write_failure_on_connected_peer_removes_it() {
        let (mock, controller) = setup(config());
        controller
            .handle_event(BindingEvent::SocketConnected {
                address: "AA".into(),
                handle: ConnectionHandle(2),
            })
            .await;
        mock.fail_all_writes(true);

        let err = controller.dispatch(unicast("AA", "x")).await.unwrap_err();
        assert!(matches!(err, CaError::ConnectionFailed { .. }));
        assert_eq!(state_of(&controller, "AA").await, None);
    }

    #[tokio::test]
    async fn test_broadcast_connect_failure_withdraws_message() {
        let (mock, controller) = setup(config());
        controller
            .handle_event(BindingEvent::DiscoveryFound {
                address: "AA".into(),
                services: services(&[SVC]),
            })
            .await;
        mock.fail_connect(true);

        controller
            .dispatch(QueueMessage::new(
                Destination::Broadcast,
                ServiceId::new(SVC),
                "all",
            ))
            .await
            .unwrap();

        let table = controller.registry().lock().await;
        let peer = table.find(&"AA".into()).unwrap();
        assert_eq!(peer.state(), DiscoveryState::ServiceSearched);
        assert_eq!(peer.pending_len(), 0);
        assert_eq!(mock.connects().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_skips_unsearched_peers() {
        let (mock, controller) = setup(config());
        controller.dispatch(unicast("AA", "first")).await.unwrap();
        mock.clear_calls();

        controller
            .dispatch(QueueMessage::new(
                Destination::Broadcast,
                ServiceId::new(SVC),
                "all",
            ))
            .await
            .unwrap();

        assert!(mock.calls().is_empty());
        let table = controller.registry().lock().await;
        assert_eq!(table.find(&"AA".into()).unwrap().pending_len(), 1);
    }

    #[tokio::test]
    async fn test_multicast_binding_gets_single_write() {
        let (mock, controller) = setup(config());
        mock.enable_multicast(true);
        controller
            .handle_event(BindingEvent::SocketConnected {
                address: "AA".into(),
                handle: ConnectionHandle(1),
            })
            .await;

        controller
            .dispatch(QueueMessage::new(
                Destination::Broadcast,
                ServiceId::new(SVC),
                "all",
            ))
            .await
            .unwrap();

        assert_eq!(mock.multicasts(), vec![Bytes::from("all")]);
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn test_reject_newest_keeps_earliest_messages() {
        let (_mock, controller) = setup(config().with_pending_limit(1, OverflowPolicy::RejectNewest));
        controller.dispatch(unicast("AA", "first")).await.unwrap();
        controller.dispatch(unicast("AA", "second")).await.unwrap();

        let table = controller.registry().lock().await;
        let peer = table.find(&"AA".into()).unwrap();
        assert_eq!(peer.pending().cloned().collect::<Vec<_>>(), vec![Bytes::from("first")]);
        assert_eq!(table.stats().messages_dropped, 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_stalled_peers_only() {
        let (_mock, controller) = setup(config().with_connect_timeout(Duration::from_secs(5)));
        controller.dispatch(unicast("AA", "hello")).await.unwrap();
        controller
            .handle_event(BindingEvent::SocketConnected {
                address: "BB".into(),
                handle: ConnectionHandle(1),
            })
            .await;

        assert_eq!(controller.sweep_stalled(Instant::now()).await, 0);

        let later = Instant::now() + Duration::from_secs(10);
        assert_eq!(controller.sweep_stalled(later).await, 1);
        assert_eq!(state_of(&controller, "AA").await, None);
        assert_eq!(
            state_of(&controller, "BB").await,
            Some(DiscoveryState::Connected)
        );
    }

    #[tokio::test]
    async fn test_peer_capacity_drops_message() {
        let (mock, controller) = setup(config().with_max_peers(1));
        controller.dispatch(unicast("AA", "a")).await.unwrap();

        let err = controller.dispatch(unicast("BB", "b")).await.unwrap_err();
        assert!(matches!(err, CaError::AllocationFailed { .. }));
        assert_eq!(
            mock.calls(),
            vec![BindingCall::ServiceSearch("AA".into())]
        );
    }

    #[tokio::test]
    async fn test_failed_broadcast_write_counts_drop() {
        let (mock, controller) = setup(config());
        controller
            .handle_event(BindingEvent::SocketConnected {
                address: "AA".into(),
                handle: ConnectionHandle(1),
            })
            .await;
        mock.fail_all_writes(true);

        controller
            .dispatch(QueueMessage::new(
                Destination::Broadcast,
                ServiceId::new(SVC),
                "all",
            ))
            .await
            .unwrap();

        assert_eq!(state_of(&controller, "AA").await, None);
        let stats = controller.registry().stats().await;
        assert_eq!(stats.peers_removed, 1);
        assert_eq!(stats.messages_written, 0);
        assert_eq!(stats.messages_dropped, 1);
    }

    #[tokio::test]
    async fn test_discovered_peer_connects_without_search() {
        let (mock, controller) = setup(config());
        controller
            .handle_event(BindingEvent::DiscoveryFound {
                address: "AA".into(),
                services: services(&[SVC]),
            })
            .await;
        controller.dispatch(unicast("AA", "hello")).await.unwrap();

        assert!(mock.searches().is_empty());
        assert_eq!(mock.connects(), vec![Address::new("AA")]);
        assert_eq!(
            state_of(&controller, "AA").await,
            Some(DiscoveryState::Connecting)
        );

        controller
            .handle_event(BindingEvent::SocketConnected {
                address: "AA".into(),
                handle: ConnectionHandle(2),
            })
            .await;
        assert_eq!(mock.writes_to(ConnectionHandle(2)), vec![Bytes::from("hello")]);
    }

    #[tokio::test]
    async fn test_inbound_connection_beyond_capacity_not_tracked() {
        let (_mock, controller) = setup(config().with_max_peers(1));
        for (address, handle) in [("AA", 1), ("BB", 2)] {
            controller
                .handle_event(BindingEvent::SocketConnected {
                    address: address.into(),
                    handle: ConnectionHandle(handle),
                })
                .await;
        }

        assert_eq!(
            state_of(&controller, "AA").await,
            Some(DiscoveryState::Connected)
        );
        assert_eq!(state_of(&controller, "BB").await, None);
        assert!(controller
            .handle_event(BindingEvent::DataReceived {
                origin: DataOrigin::Handle(ConnectionHandle(2)),
                payload: Bytes::from("x"),
            })
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_unissued_connect_removes_peer() {
        let (mock, controller) = setup(config());
        mock.fail_connect(true);
        controller
            .handle_event(BindingEvent::DiscoveryFound {
                address: "AA".into(),
                services: services(&[SVC]),
            })
            .await;

        let err = controller.dispatch(unicast("AA", "a")).await.unwrap_err();
        assert!(matches!(err, CaError::ConnectionFailed { .. }));
        assert_eq!(state_of(&controller, "AA").await, None);

        // Buffered before discovery, connect attempted on the discovery event
        controller.dispatch(unicast("BB", "b")).await.unwrap();
        controller
            .handle_event(BindingEvent::DiscoveryFound {
                address: "BB".into(),
                services: services(&[SVC]),
            })
            .await;
        assert_eq!(state_of(&controller, "BB").await, None);
        assert_eq!(mock.connects().len(), 2);
        assert_eq!(controller.registry().stats().await.messages_dropped, 2);
    }
}
