//! Peer registry
//!
//! One table of [`Peer`] records per adapter, keyed by address. The event pump,
//! the send worker and API callers all go through the same async mutex, so a
//! broadcast pass sees a consistent table from start to finish.

use bytes::Bytes;
use ca_core::{Address, CaError, CaResult, ConnectionHandle, OverflowPolicy, ServiceId};
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use tokio::sync::{Mutex, MutexGuard};

use crate::peer::{DiscoveryState, PendingOutcome, Peer, PeerInfo};

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Counters kept by an adapter's peer table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterStats {
    pub peers_created: u64,
    pub peers_removed: u64,
    pub messages_written: u64,
    /// Messages discarded by overflow, peer failure or shutdown
    pub messages_dropped: u64,
}

/// Count of peers in each discovery state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateDistribution {
    pub discovered: usize,
    pub service_search_pending: usize,
    pub service_searched: usize,
    pub connecting: usize,
    pub connected: usize,
    pub failed: usize,
}

// ----------------------------------------------------------------------------
// Peer Table
// ----------------------------------------------------------------------------

/// Peer records plus their limits; only reachable through [`PeerRegistry::lock`]
#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<Address, Peer>,
    max_peers: usize,
    pending_limit: usize,
    overflow: OverflowPolicy,
    stats: AdapterStats,
}

impl PeerTable {
    pub fn find(&self, address: &Address) -> Option<&Peer> {
        self.peers.get(address)
    }

    pub fn find_mut(&mut self, address: &Address) -> Option<&mut Peer> {
        self.peers.get_mut(address)
    }

    pub fn find_by_handle(&self, handle: ConnectionHandle) -> Option<&Peer> {
        self.peers
            .values()
            .find(|peer| peer.handle() == Some(handle))
    }

    /// Return the peer at `address`, creating it at `Discovered` if absent
    pub fn get_or_create(&mut self, address: &Address, service: &ServiceId) -> CaResult<&mut Peer> {
        let len = self.peers.len();
        match self.peers.entry(address.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                if len >= self.max_peers {
                    return Err(CaError::AllocationFailed {
                        reason: format!("peer table full ({} peers)", self.max_peers),
                    });
                }
                self.stats.peers_created += 1;
                Ok(entry.insert(Peer::new(address.clone(), service.clone())))
            }
        }
    }

    /// Track a peer whose socket the remote side opened
    pub fn insert_connected(
        &mut self,
        address: &Address,
        service: &ServiceId,
        handle: ConnectionHandle,
    ) -> CaResult<&mut Peer> {
        let peer = self.get_or_create(address, service)?;
        peer.mark_connected(handle);
        Ok(peer)
    }

    /// Buffer `data` on the peer at `address` under the table's overflow policy
    ///
    /// Returns `None` when the peer is unknown.
    pub fn buffer_pending(&mut self, address: &Address, data: Bytes) -> Option<PendingOutcome> {
        let peer = self.peers.get_mut(address)?;
        let outcome = peer.push_pending(data, self.pending_limit, self.overflow);
        if outcome != PendingOutcome::Queued {
            self.stats.messages_dropped += 1;
        }
        Some(outcome)
    }

    /// Drop the peer and everything buffered for it
    pub fn remove(&mut self, address: &Address) -> Option<Peer> {
        let peer = self.peers.remove(address)?;
        self.stats.peers_removed += 1;
        self.stats.messages_dropped += peer.pending_len() as u64;
        Some(peer)
    }

    /// Drop every peer, returning how many buffered messages were discarded
    pub fn clear(&mut self) -> usize {
        let dropped: usize = self.peers.values().map(Peer::pending_len).sum();
        self.stats.peers_removed += self.peers.len() as u64;
        self.stats.messages_dropped += dropped as u64;
        self.peers.clear();
        dropped
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.peers.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn record_written(&mut self, count: usize) {
        self.stats.messages_written += count as u64;
    }

    pub fn record_dropped(&mut self, count: usize) {
        self.stats.messages_dropped += count as u64;
    }

    pub fn stats(&self) -> AdapterStats {
        self.stats
    }

    pub fn state_counts(&self) -> StateDistribution {
        let mut distribution = StateDistribution::default();
        for peer in self.peers.values() {
            match peer.state() {
                DiscoveryState::Discovered => distribution.discovered += 1,
                DiscoveryState::ServiceSearchPending => distribution.service_search_pending += 1,
                DiscoveryState::ServiceSearched => distribution.service_searched += 1,
                DiscoveryState::Connecting => distribution.connecting += 1,
                DiscoveryState::Connected => distribution.connected += 1,
                DiscoveryState::Failed => distribution.failed += 1,
            }
        }
        distribution
    }
}

// ----------------------------------------------------------------------------
// Peer Registry
// ----------------------------------------------------------------------------

/// Shared, lock-guarded peer table of one adapter
#[derive(Debug)]
pub struct PeerRegistry {
    table: Mutex<PeerTable>,
}

impl PeerRegistry {
    pub fn new(max_peers: usize, pending_limit: usize, overflow: OverflowPolicy) -> Self {
        Self {
            table: Mutex::new(PeerTable {
                peers: HashMap::new(),
                max_peers,
                pending_limit,
                overflow,
                stats: AdapterStats::default(),
            }),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, PeerTable> {
        self.table.lock().await
    }

    pub async fn snapshot(&self) -> Vec<PeerInfo> {
        let table = self.lock().await;
        let mut peers: Vec<_> = table.iter().map(Peer::info).collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        peers
    }

    pub async fn stats(&self) -> AdapterStats {
        self.lock().await.stats()
    }
}
