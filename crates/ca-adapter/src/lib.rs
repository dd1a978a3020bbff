//! Connectivity Adapter
//!
//! The per-transport machinery that turns a discovery-gated, callback-driven
//! radio into an asynchronous send/receive API: a batched [`SendQueue`], a
//! lock-guarded [`PeerRegistry`], the [`ConnectionController`] state machine,
//! and the [`AdapterManager`] façade tying them to a capability binding.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod controller;
pub mod manager;
pub mod notify;
pub mod peer;
pub mod queue;
pub mod registry;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use controller::ConnectionController;
pub use manager::{AdapterContext, AdapterManager};
pub use notify::{CallbackSlot, ReceiveCallback, StatusCallback, StatusNotifier};
pub use peer::{DiscoveryState, PendingOutcome, Peer, PeerInfo};
pub use queue::{QueueHandler, SendQueue, WorkerHandle};
pub use registry::{AdapterStats, PeerRegistry, PeerTable, StateDistribution};
