//! Upper-layer callbacks and network status notification
//!
//! Status changes are never delivered inline: each one is wrapped with the
//! cached local connectivity and handed to a task on the shared runtime, and the
//! callback is looked up only when that task runs.

use std::sync::{Arc, Mutex, RwLock};

use ca_core::{InboundPacket, LocalConnectivity, NetworkStatus, NetworkStatusEvent, TransportKind};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

/// Receives payloads arriving from peers
pub type ReceiveCallback = dyn Fn(InboundPacket) + Send + Sync;

/// Receives adapter up/down notifications
pub type StatusCallback = dyn Fn(NetworkStatusEvent) + Send + Sync;

// ----------------------------------------------------------------------------
// Callback Slot
// ----------------------------------------------------------------------------

/// Single registered callback; the last one set wins
pub struct CallbackSlot<F: ?Sized> {
    callback: RwLock<Option<Arc<F>>>,
}

impl<F: ?Sized> Default for CallbackSlot<F> {
    fn default() -> Self {
        Self {
            callback: RwLock::new(None),
        }
    }
}

impl<F: ?Sized> CallbackSlot<F> {
    pub fn set(&self, callback: Option<Arc<F>>) {
        *self
            .callback
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = callback;
    }

    pub fn get(&self) -> Option<Arc<F>> {
        self.callback
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        self.set(None);
    }

    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }
}

// ----------------------------------------------------------------------------
// Status Notifier
// ----------------------------------------------------------------------------

/// Publishes network status changes on the shared runtime
pub struct StatusNotifier {
    runtime: Handle,
    transport: TransportKind,
    callback: Arc<CallbackSlot<StatusCallback>>,
    local: Mutex<Option<LocalConnectivity>>,
}

impl StatusNotifier {
    pub fn new(
        runtime: Handle,
        transport: TransportKind,
        callback: Arc<CallbackSlot<StatusCallback>>,
    ) -> Self {
        Self {
            runtime,
            transport,
            callback,
            local: Mutex::new(None),
        }
    }

    /// Cache the local endpoint attached to later notifications
    pub fn set_local(&self, info: LocalConnectivity) {
        *self.local.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(info);
    }

    pub fn clear_local(&self) {
        *self.local.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    pub fn local(&self) -> Option<LocalConnectivity> {
        self.local
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Spawn delivery of `status` with a copy of the cached local endpoint
    pub fn notify(&self, status: NetworkStatus) -> JoinHandle<()> {
        let info = self
            .local()
            .unwrap_or_else(|| LocalConnectivity::new(self.transport, ""));
        let event = NetworkStatusEvent { info, status };
        let callback = Arc::clone(&self.callback);

        self.runtime.spawn(async move {
            match callback.get() {
                Some(callback) => callback(event),
                None => debug!("No status callback for {:?}", event.status),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_last_callback_wins() {
        let slot: CallbackSlot<dyn Fn(u32) -> u32 + Send + Sync> = CallbackSlot::default();
        assert!(!slot.is_set());

        slot.set(Some(Arc::new(|x: u32| x + 1)));
        slot.set(Some(Arc::new(|x: u32| x * 10)));
        assert_eq!(slot.get().unwrap()(2), 20);

        slot.clear();
        assert!(slot.get().is_none());
    }

    #[tokio::test]
    async fn test_notification_carries_local_snapshot() {
        let slot: Arc<CallbackSlot<StatusCallback>> = Arc::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        slot.set(Some(Arc::new(move |event: NetworkStatusEvent| {
            let _ = tx.send(event);
        })));

        let notifier = StatusNotifier::new(Handle::current(), TransportKind::Le, slot);
        notifier.set_local(LocalConnectivity::new(TransportKind::Le, "11:22"));
        notifier.notify(NetworkStatus::Up).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.status, NetworkStatus::Up);
        assert_eq!(event.info.address.as_str(), "11:22");
    }

    #[tokio::test]
    async fn test_notify_without_callback_is_noop() {
        let slot: Arc<CallbackSlot<StatusCallback>> = Arc::default();
        let notifier = StatusNotifier::new(Handle::current(), TransportKind::Edr, slot);

        notifier.notify(NetworkStatus::Down).await.unwrap();
        assert!(notifier.local().is_none());
    }
}
