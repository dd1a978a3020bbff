//! Adapter manager
//!
//! Public face of one transport adapter. Owns the send queue, the peer
//! registry and the connection controller, and runs three kinds of background
//! task on the runtime supplied at initialization:
//!
//! - the send worker, draining the queue into the controller
//! - the event pump, applying binding events and delivering inbound data
//! - the stall sweeper, failing peers whose connection attempt timed out
//!
//! Network status notifications are spawned as separate tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use ca_core::{
    AdapterConfig, AdapterState, AdapterStatus, BindingEvent, CaError, CaResult,
    CapabilityBinding, Destination, EventSink, EventStream, InboundPacket, LocalConnectivity,
    NetworkStatus, NetworkStatusEvent, QueueMessage, ServiceId, TransportKind,
};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::controller::ConnectionController;
use crate::notify::{CallbackSlot, ReceiveCallback, StatusCallback, StatusNotifier};
use crate::peer::PeerInfo;
use crate::queue::{QueueHandler, SendQueue, WorkerHandle};
use crate::registry::{AdapterStats, PeerRegistry};

// ----------------------------------------------------------------------------
// Adapter Context
// ----------------------------------------------------------------------------

/// Shared resources handed to an adapter at initialization
#[derive(Debug, Clone)]
pub struct AdapterContext {
    /// Runtime that hosts every task the adapter spawns
    pub runtime: Handle,
}

impl AdapterContext {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Context bound to the runtime of the calling task
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

// ----------------------------------------------------------------------------
// Session State
// ----------------------------------------------------------------------------

/// Everything allocated between `initialize` and `terminate`
struct Session {
    runtime: Handle,
    queue: SendQueue<QueueMessage>,
    controller: Arc<ConnectionController>,
    notifier: Arc<StatusNotifier>,
    started: Arc<AtomicBool>,
    worker: Option<WorkerHandle>,
    pump: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

/// Queue handler feeding the connection controller
struct SendHandler {
    controller: Arc<ConnectionController>,
}

#[async_trait]
impl QueueHandler<QueueMessage> for SendHandler {
    async fn process(&self, message: QueueMessage) {
        let destination = message.destination.clone();
        if let Err(e) = self.controller.dispatch(message).await {
            debug!("Message to {} not delivered: {}", destination, e);
        }
    }
}

// ----------------------------------------------------------------------------
// Adapter Manager
// ----------------------------------------------------------------------------

/// Send/receive façade over one capability binding
pub struct AdapterManager {
    binding: Arc<dyn CapabilityBinding>,
    config: AdapterConfig,
    receive_callback: Arc<CallbackSlot<ReceiveCallback>>,
    status_callback: Arc<CallbackSlot<StatusCallback>>,
    session: Mutex<Option<Session>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl AdapterManager {
    pub fn new(binding: Arc<dyn CapabilityBinding>, config: AdapterConfig) -> Self {
        Self {
            binding,
            config,
            receive_callback: Arc::default(),
            status_callback: Arc::default(),
            session: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn transport(&self) -> TransportKind {
        self.binding.transport()
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_initialized(&self) -> bool {
        self.session().is_some()
    }

    pub fn is_started(&self) -> bool {
        self.session()
            .as_ref()
            .is_some_and(|session| session.started.load(Ordering::Acquire))
    }

    // ------------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------------

    /// Register the handler for inbound data, replacing any previous one
    pub fn set_receive_callback<F>(&self, callback: F)
    where
        F: Fn(InboundPacket) + Send + Sync + 'static,
    {
        self.receive_callback.set(Some(Arc::new(callback)));
    }

    /// Register the handler for network status changes, replacing any previous one
    pub fn set_network_status_callback<F>(&self, callback: F)
    where
        F: Fn(NetworkStatusEvent) + Send + Sync + 'static,
    {
        self.status_callback.set(Some(Arc::new(callback)));
    }

    pub fn clear_callbacks(&self) {
        self.receive_callback.clear();
        self.status_callback.clear();
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Bring up the binding and allocate the adapter's queue, registry and tasks
    pub async fn initialize(&self, context: AdapterContext) -> CaResult<AdapterStatus> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_initialized() {
            return Err(CaError::AlreadyInitialized);
        }

        let transport = self.transport();
        if self.config.transport != transport {
            return Err(CaError::validation(format!(
                "configuration is for {} but the binding drives {}",
                self.config.transport, transport
            )));
        }
        info!("Initializing {} adapter", transport);

        if let Err(e) = self.binding.enable().await {
            error!("Failed to enable {} binding: {}", transport, e);
            return Err(e.into());
        }

        let state = match self.binding.adapter_state().await {
            Ok(state) => state,
            Err(e) => {
                error!("Failed to read {} adapter state: {}", transport, e);
                self.binding.disable().await;
                return Err(e.into());
            }
        };

        let (sink, stream) = EventSink::channel();
        if let Err(e) = self.binding.register_events(sink).await {
            error!("Failed to register {} event sink: {}", transport, e);
            self.binding.disable().await;
            return Err(e.into());
        }

        let runtime = context.runtime;
        let registry = Arc::new(PeerRegistry::new(
            self.config.max_peers,
            self.config.max_pending_per_peer,
            self.config.pending_overflow,
        ));
        let controller = Arc::new(ConnectionController::new(
            Arc::clone(&self.binding),
            registry,
            &self.config,
        ));
        let notifier = Arc::new(StatusNotifier::new(
            runtime.clone(),
            transport,
            Arc::clone(&self.status_callback),
        ));
        let started = Arc::new(AtomicBool::new(false));

        let pump = runtime.spawn(run_event_pump(
            stream,
            Arc::clone(&self.binding),
            Arc::clone(&controller),
            Arc::clone(&notifier),
            Arc::clone(&started),
            Arc::clone(&self.receive_callback),
        ));
        let sweeper = runtime.spawn(run_stall_sweeper(
            Arc::clone(&controller),
            self.config.sweep_interval(),
        ));

        *self.session() = Some(Session {
            runtime,
            queue: SendQueue::new(self.config.send_queue_capacity),
            controller,
            notifier: Arc::clone(&notifier),
            started,
            worker: None,
            pump,
            sweeper,
        });

        match state {
            AdapterState::Enabled => {
                refresh_local_connectivity(self.binding.as_ref(), &notifier).await;
                notifier.notify(NetworkStatus::Up);
                info!("{} adapter initialized", transport);
                Ok(AdapterStatus::Ready)
            }
            AdapterState::Disabled => {
                warn!("{} adapter initialized but radio is disabled", transport);
                Ok(AdapterStatus::AdapterDisabled)
            }
        }
    }

    /// Begin discovery and start the send worker; repeated calls are no-ops
    pub async fn start(&self) -> CaResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.is_initialized() {
            return Err(CaError::NotInitialized);
        }
        if self.is_started() {
            debug!("{} adapter already started", self.transport());
            return Ok(());
        }

        if self.binding.adapter_state().await? == AdapterState::Disabled {
            warn!("Cannot start {} adapter, radio is disabled", self.transport());
            return Err(CaError::AdapterNotEnabled);
        }

        if !self.binding.is_discovering().await? {
            self.binding.start_discovery().await.map_err(|e| {
                error!("Failed to start {} discovery: {}", self.transport(), e);
                CaError::from(e)
            })?;
        }

        // A previous stop leaves the old worker finishing its final drain
        let previous = self.session().as_mut().and_then(|session| session.worker.take());
        if let Some(previous) = previous {
            previous.join_within(self.config.shutdown_grace()).await;
        }

        let mut session = self.session();
        let session = session.as_mut().ok_or(CaError::NotInitialized)?;
        session.queue.reopen();
        let worker = session.queue.spawn_worker(
            &session.runtime,
            SendHandler {
                controller: Arc::clone(&session.controller),
            },
        );
        session.worker = Some(worker);
        session.started.store(true, Ordering::Release);

        info!("{} adapter started", self.transport());
        Ok(())
    }

    /// Halt discovery, let the send worker drain and stop, and stop routing peer events
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_locked().await;
    }

    async fn stop_locked(&self) {
        let queue = match self.session().as_ref() {
            Some(session) => {
                session.started.store(false, Ordering::Release);
                session.queue.clone()
            }
            None => return,
        };

        if let Err(e) = self.binding.stop_discovery().await {
            warn!("Failed to stop {} discovery: {}", self.transport(), e);
        }
        queue.stop();
        info!("{} adapter stopped", self.transport());
    }

    /// Release everything `initialize` allocated and disable the binding
    pub async fn terminate(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.clear_callbacks();
        self.stop_locked().await;

        let Some(mut session) = self.session().take() else {
            return;
        };

        if let Some(worker) = session.worker.take() {
            worker.join_within(self.config.shutdown_grace()).await;
        }

        let unsent = session.queue.clear();
        let registry = Arc::clone(session.controller.registry());
        let stats = {
            let mut table = registry.lock().await;
            table.record_dropped(unsent);
            let dropped = table.clear();
            if unsent + dropped > 0 {
                warn!(
                    "Terminating {} adapter dropped {} unsent and {} pending message(s)",
                    self.transport(),
                    unsent,
                    dropped
                );
            }
            table.stats()
        };

        session.pump.abort();
        session.sweeper.abort();
        session.notifier.clear_local();

        self.binding.unregister_events().await;
        self.binding.disable().await;

        info!("{} adapter terminated ({:?})", self.transport(), stats);
    }

    // ------------------------------------------------------------------------
    // Data Path
    // ------------------------------------------------------------------------

    /// Queue `payload` for `destination`; returns the number of bytes accepted
    ///
    /// Delivery is best effort: failures after this returns are logged, not reported.
    pub fn send(
        &self,
        destination: Destination,
        service: impl Into<ServiceId>,
        payload: impl Into<Bytes>,
    ) -> CaResult<usize> {
        let service = service.into();
        let payload = payload.into();

        if service.is_empty() {
            return Err(CaError::validation("service identifier is empty"));
        }
        if payload.is_empty() {
            return Err(CaError::validation("payload is empty"));
        }
        if let Destination::Unicast(address) = &destination {
            if address.is_empty() {
                return Err(CaError::validation("destination address is empty"));
            }
        }

        let queue = self
            .session()
            .as_ref()
            .map(|session| session.queue.clone())
            .ok_or(CaError::NotInitialized)?;

        let accepted = payload.len();
        debug!("Queueing {} byte(s) for {}", accepted, destination);
        queue.enqueue(QueueMessage::new(destination, service, payload))?;
        Ok(accepted)
    }

    // ------------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------------

    fn registry(&self) -> CaResult<Arc<PeerRegistry>> {
        self.session()
            .as_ref()
            .map(|session| Arc::clone(session.controller.registry()))
            .ok_or(CaError::NotInitialized)
    }

    pub async fn stats(&self) -> CaResult<AdapterStats> {
        Ok(self.registry()?.stats().await)
    }

    /// Snapshot of every tracked peer, sorted by address
    pub async fn peers(&self) -> CaResult<Vec<PeerInfo>> {
        Ok(self.registry()?.snapshot().await)
    }

    /// Last local endpoint reported by the binding
    pub fn local_connectivity(&self) -> Option<LocalConnectivity> {
        self.session()
            .as_ref()
            .and_then(|session| session.notifier.local())
    }
}

// ----------------------------------------------------------------------------
// Background Tasks
// ----------------------------------------------------------------------------

async fn refresh_local_connectivity(binding: &dyn CapabilityBinding, notifier: &StatusNotifier) {
    match binding.local_connectivity().await {
        Ok(info) => {
            debug!("Local {} address is {}", info.transport, info.address);
            notifier.set_local(info);
        }
        Err(e) => warn!("Failed to read local {} address: {}", binding.transport(), e),
    }
}

async fn run_event_pump(
    mut events: EventStream,
    binding: Arc<dyn CapabilityBinding>,
    controller: Arc<ConnectionController>,
    notifier: Arc<StatusNotifier>,
    started: Arc<AtomicBool>,
    receive_callback: Arc<CallbackSlot<ReceiveCallback>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            BindingEvent::AdapterStateChanged(state) => {
                info!("{} radio is now {:?}", binding.transport(), state);
                if state == AdapterState::Enabled {
                    refresh_local_connectivity(binding.as_ref(), &notifier).await;
                }
                notifier.notify(state.into());
            }
            event if !started.load(Ordering::Acquire) => {
                debug!("Ignoring {} event, adapter not started", event.kind());
            }
            event => {
                let Some(packet) = controller.handle_event(event).await else {
                    continue;
                };
                match receive_callback.get() {
                    Some(callback) => callback(packet),
                    None => debug!(
                        "No receive callback, dropping {} byte(s) from {}",
                        packet.len(),
                        packet.source
                    ),
                }
            }
        }
    }
    debug!("Event pump exited");
}

async fn run_stall_sweeper(controller: Arc<ConnectionController>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let failed = controller.sweep_stalled(Instant::now()).await;
        if failed > 0 {
            debug!("Stall sweep removed {} peer(s)", failed);
        }
    }
}
