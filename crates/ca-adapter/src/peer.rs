//! Per-peer connection record

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ca_core::{Address, ConnectionHandle, OverflowPolicy, ServiceId};

// ----------------------------------------------------------------------------
// Discovery State
// ----------------------------------------------------------------------------

/// Where a peer is in the discovery → connect pipeline
///
/// Variants are ordered by progress so "already past this stage" is a plain
/// comparison. `Failed` is terminal; failed peers are removed promptly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiscoveryState {
    /// Known address, services not yet known
    Discovered,
    /// Service search issued, waiting for the result
    ServiceSearchPending,
    /// Target service confirmed, no connection yet
    ServiceSearched,
    /// Connect issued, waiting for the socket
    Connecting,
    /// Socket open, writes go straight to the binding
    Connected,
    /// Gave up on this peer
    Failed,
}

impl DiscoveryState {
    /// Whether the peer's services have been confirmed
    pub fn services_known(&self) -> bool {
        matches!(
            self,
            DiscoveryState::ServiceSearched | DiscoveryState::Connecting | DiscoveryState::Connected
        )
    }

    /// Whether the peer is waiting on a platform result
    pub fn is_awaiting_platform(&self) -> bool {
        matches!(
            self,
            DiscoveryState::ServiceSearchPending | DiscoveryState::Connecting
        )
    }
}

/// Result of buffering a message for a peer that is not connected yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOutcome {
    Queued,
    /// Queued after evicting the oldest buffered message
    DroppedOldest,
    /// Queue full, the new message was discarded
    Rejected,
}

// ----------------------------------------------------------------------------
// Peer
// ----------------------------------------------------------------------------

/// Connection state of one remote device
#[derive(Debug)]
pub struct Peer {
    address: Address,
    service: ServiceId,
    handle: Option<ConnectionHandle>,
    state: DiscoveryState,
    pending: VecDeque<Bytes>,
    state_since: Instant,
}

impl Peer {
    /// New peer at `Discovered` with nothing buffered
    pub fn new(address: Address, service: ServiceId) -> Self {
        Self {
            address,
            service,
            handle: None,
            state: DiscoveryState::Discovered,
            pending: VecDeque::new(),
            state_since: Instant::now(),
        }
    }

    /// Peer whose socket was opened by the remote side
    pub fn connected(address: Address, service: ServiceId, handle: ConnectionHandle) -> Self {
        let mut peer = Self::new(address, service);
        peer.mark_connected(handle);
        peer
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.handle
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn state_since(&self) -> Instant {
        self.state_since
    }

    /// Move to a non-connected state; clears any handle
    pub fn set_state(&mut self, state: DiscoveryState) {
        if state != DiscoveryState::Connected {
            self.handle = None;
        }
        if state != self.state {
            self.state = state;
            self.state_since = Instant::now();
        }
    }

    pub fn mark_connected(&mut self, handle: ConnectionHandle) {
        self.handle = Some(handle);
        if self.state != DiscoveryState::Connected {
            self.state = DiscoveryState::Connected;
            self.state_since = Instant::now();
        }
    }

    // ------------------------------------------------------------------------
    // Pending Data
    // ------------------------------------------------------------------------

    /// Buffer `data` until the connection opens
    pub fn push_pending(
        &mut self,
        data: Bytes,
        limit: usize,
        policy: OverflowPolicy,
    ) -> PendingOutcome {
        debug_assert!(self.handle.is_none(), "connected peers are written directly");

        if self.pending.len() < limit {
            self.pending.push_back(data);
            return PendingOutcome::Queued;
        }

        match policy {
            OverflowPolicy::DropOldest if limit > 0 => {
                self.pending.pop_front();
                self.pending.push_back(data);
                PendingOutcome::DroppedOldest
            }
            _ => PendingOutcome::Rejected,
        }
    }

    /// Withdraw the most recently buffered message
    pub fn pop_newest(&mut self) -> Option<Bytes> {
        self.pending.pop_back()
    }

    /// Take the whole pending queue in FIFO order
    pub fn take_pending(&mut self) -> VecDeque<Bytes> {
        std::mem::take(&mut self.pending)
    }

    pub fn pending(&self) -> impl Iterator<Item = &Bytes> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Whether the peer has waited on the platform for at least `timeout`
    pub fn is_stalled(&self, now: Instant, timeout: Duration) -> bool {
        self.state == DiscoveryState::Failed
            || (self.state.is_awaiting_platform()
                && now.saturating_duration_since(self.state_since) >= timeout)
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            address: self.address.clone(),
            service: self.service.clone(),
            state: self.state,
            handle: self.handle,
            pending: self.pending.len(),
        }
    }
}

/// Point-in-time view of a peer for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: Address,
    pub service: ServiceId,
    pub state: DiscoveryState,
    pub handle: Option<ConnectionHandle>,
    pub pending: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer::new("AA:BB".into(), ServiceId::new("svc"))
    }

    #[test]
    fn test_states_are_ordered_by_progress() {
        assert!(DiscoveryState::Discovered < DiscoveryState::ServiceSearched);
        assert!(DiscoveryState::ServiceSearched < DiscoveryState::Connected);
        assert!(!DiscoveryState::Failed.services_known());
        assert!(DiscoveryState::Connecting.services_known());
    }

    #[test]
    fn test_handle_only_while_connected() {
        let mut peer = peer();
        assert_eq!(peer.handle(), None);

        peer.mark_connected(ConnectionHandle(7));
        assert_eq!(peer.state(), DiscoveryState::Connected);
        assert_eq!(peer.handle(), Some(ConnectionHandle(7)));

        peer.set_state(DiscoveryState::Failed);
        assert_eq!(peer.handle(), None);
    }

    #[test]
    fn test_drop_oldest_overflow() {
        let mut peer = peer();
        for data in ["a", "b"] {
            assert_eq!(
                peer.push_pending(Bytes::from(data), 2, OverflowPolicy::DropOldest),
                PendingOutcome::Queued
            );
        }
        assert_eq!(
            peer.push_pending(Bytes::from("c"), 2, OverflowPolicy::DropOldest),
            PendingOutcome::DroppedOldest
        );
        let pending: Vec<_> = peer.take_pending().into_iter().collect();
        assert_eq!(pending, vec![Bytes::from("b"), Bytes::from("c")]);
        assert!(!peer.has_pending());
    }

    #[test]
    fn test_reject_newest_overflow() {
        let mut peer = peer();
        peer.push_pending(Bytes::from("a"), 1, OverflowPolicy::RejectNewest);
        assert_eq!(
            peer.push_pending(Bytes::from("b"), 1, OverflowPolicy::RejectNewest),
            PendingOutcome::Rejected
        );
        assert_eq!(peer.pending().next(), Some(&Bytes::from("a")));
    }

    #[test]
    fn test_only_waiting_peers_stall() {
        let mut peer = peer();
        let later = Instant::now() + Duration::from_secs(60);
        assert!(!peer.is_stalled(later, Duration::from_secs(1)));

        peer.set_state(DiscoveryState::Connecting);
        assert!(!peer.is_stalled(Instant::now(), Duration::from_secs(30)));
        assert!(peer.is_stalled(later, Duration::from_secs(30)));

        peer.mark_connected(ConnectionHandle(1));
        assert!(!peer.is_stalled(later, Duration::from_secs(1)));
    }
}
