// Session Actor - One connection's lifecycle, queue and registry on a single task
//
// Every mutation of a session happens inside its task, driven by one channel
// of events: caller requests, adapter outcomes and timer expiries. Timers are
// spawned sleeps that post back into the channel. Adapter events are tagged
// with the connect attempt that produced them; once an attempt is retired its
// events are ignored.

use crate::session::backoff::{FixedInterval, ReconnectPolicy};
use crate::session::queue::{Enqueued, QueueEntry};
use crate::session::{
    CallbackRegistry, Command, CommandKey, Dispatcher, GattError, GattEvent, OperationKind,
    OperationQueue, Payload, SessionState, Subscriber,
};
use crate::transport::{
    find_attribute, AdapterError, AdapterEvent, AdapterEventSink, AdapterStatus, CacheClear,
    Device, DeviceAddress, GattAdapter, ServiceProfile, SubscriptionMode, TargetId,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

// ============================================================================
// SETTINGS AND IDENTITY
// ============================================================================

/// Per-session timing and retry parameters
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    /// Settling delay between link establishment and capability discovery
    pub discovery_delay: Duration,
    /// Retries after the first failed attempt
    pub reconnect_count: u32,
    /// Ask the stack for a background (auto) connect on the first attempt
    pub auto_connect: bool,
    pub policy: Arc<dyn ReconnectPolicy>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(5),
            discovery_delay: Duration::from_millis(500),
            reconnect_count: 0,
            auto_connect: false,
            policy: Arc::new(FixedInterval::default()),
        }
    }
}

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Distinguishes successive sessions for the same device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Told about the lifecycle points the connection supervisor tracks
pub trait SessionObserver: Send + Sync {
    /// Capabilities discovered, session ready for operations
    fn connected(&self, device: &DeviceAddress, session: SessionId);

    /// Session reached a terminal state and its task is stopping
    fn closed(&self, device: &DeviceAddress, session: SessionId);
}

enum SessionEvent {
    Request(Command),
    Disconnect,
    Adapter { attempt: u64, event: AdapterEvent },
    LinkTimeout { attempt: u64 },
    DiscoveryDue { attempt: u64 },
    RetryDue { attempt: u64 },
    OperationTimeout { key: CommandKey, generation: u64 },
}

// ============================================================================
// HANDLE
// ============================================================================

/// Cheap, cloneable front of a running session
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    device: Device,
    tx: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Receiver<SessionState>,
    services: watch::Receiver<Vec<ServiceProfile>>,
}

impl SessionHandle {
    /// Start a session task and its first connect attempt.
    /// `owner` receives the connection lifecycle events.
    pub fn spawn(
        device: Device,
        adapter: Arc<dyn GattAdapter>,
        settings: SessionSettings,
        dispatcher: Dispatcher,
        observer: Arc<dyn SessionObserver>,
        owner: Subscriber,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (services_tx, services_rx) = watch::channel(Vec::new());
        let id = SessionId::next();

        let session = Session {
            id,
            address: device.address().clone(),
            device: device.clone(),
            adapter,
            settings,
            dispatcher,
            observer,
            events: tx.downgrade(),
            state: SessionState::Idle,
            state_tx,
            services_tx,
            services: Vec::new(),
            owner,
            attempt: 0,
            retries: 0,
            started_reported: false,
            link_timer: None,
            phase_timer: None,
            queue: OperationQueue::new(),
            registry: CallbackRegistry::new(),
            live: HashSet::new(),
            finished: false,
        };
        tokio::spawn(session.run(rx));

        Self {
            id,
            device,
            tx,
            state: state_rx,
            services: services_rx,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn address(&self) -> &DeviceAddress {
        self.device.address()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Capability profile reported by the last successful discovery
    pub fn services(&self) -> Vec<ServiceProfile> {
        self.services.borrow().clone()
    }

    /// Hand a command to the session. Fails once the session task has stopped.
    pub fn submit(&self, command: Command) -> Result<(), GattError> {
        self.tx
            .send(SessionEvent::Request(command))
            .map_err(|_| GattError::DeviceNotConnected)
    }

    /// Request a caller-initiated disconnect. Idempotent.
    pub fn disconnect(&self) {
        let _ = self.tx.send(SessionEvent::Disconnect);
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the published state satisfies `predicate`.
    /// Returns the last state if the session stops first.
    pub async fn wait_for<F>(&self, mut predicate: F) -> SessionState
    where
        F: FnMut(SessionState) -> bool,
    {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|s| predicate(*s)).await.map(|s| *s);
        match reached {
            Ok(state) => state,
            Err(_) => *rx.borrow(),
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("device", self.device.address())
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// SESSION TASK
// ============================================================================

struct Session {
    id: SessionId,
    device: Device,
    address: DeviceAddress,
    adapter: Arc<dyn GattAdapter>,
    settings: SessionSettings,
    dispatcher: Dispatcher,
    observer: Arc<dyn SessionObserver>,
    events: mpsc::WeakUnboundedSender<SessionEvent>,

    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    services_tx: watch::Sender<Vec<ServiceProfile>>,
    services: Vec<ServiceProfile>,

    owner: Subscriber,
    attempt: u64,
    retries: u32,
    started_reported: bool,
    /// Connect, discovery or disconnect deadline
    link_timer: Option<AbortHandle>,
    /// Pending discovery delay or retry delay
    phase_timer: Option<AbortHandle>,

    queue: OperationQueue,
    registry: CallbackRegistry,
    /// Subscribe keys the transport currently has enabled
    live: HashSet<CommandKey>,
    finished: bool,
}

impl Session {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
        self.start_attempt();

        while !self.finished {
            let Some(event) = rx.recv().await else {
                debug!(device = %self.address, "all handles dropped, closing session");
                self.abandon();
                break;
            };
            self.handle(event);
        }

        // Requests that raced the shutdown still get exactly one answer
        rx.close();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Request(command) = event {
                self.reply(&command, GattEvent::Failed(GattError::DeviceNotConnected));
            }
        }
        debug!(device = %self.address, session = %self.id, "session task stopped");
    }

    fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Request(command) => self.on_request(command),
            SessionEvent::Disconnect => self.on_disconnect(),
            SessionEvent::Adapter { attempt, event } if attempt == self.attempt => {
                self.on_adapter_event(event)
            }
            SessionEvent::Adapter { attempt, event } => {
                debug!(device = %self.address, attempt, ?event, "event from retired attempt ignored");
            }
            SessionEvent::LinkTimeout { attempt } if attempt == self.attempt => {
                self.on_link_timeout()
            }
            SessionEvent::DiscoveryDue { attempt } if attempt == self.attempt => self.discover(),
            SessionEvent::RetryDue { attempt } if attempt == self.attempt => {
                if self.state == SessionState::Connecting {
                    self.start_attempt();
                }
            }
            SessionEvent::OperationTimeout { key, generation } => {
                self.on_operation_timeout(key, generation)
            }
            SessionEvent::LinkTimeout { .. }
            | SessionEvent::DiscoveryDue { .. }
            | SessionEvent::RetryDue { .. } => {
                debug!(device = %self.address, "stale timer ignored");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------------

    fn start_attempt(&mut self) {
        self.attempt += 1;
        let attempt = self.attempt;
        if self.state != SessionState::Connecting {
            self.transition(SessionState::Connecting);
        }

        let auto_connect = self.settings.auto_connect && self.retries == 0;
        info!(device = %self.device, attempt, auto_connect, "connecting");

        match self.adapter.connect(&self.device, auto_connect, self.sink(attempt)) {
            Ok(()) => {
                self.link_timer = Some(self.schedule(
                    self.settings.connect_timeout,
                    SessionEvent::LinkTimeout { attempt },
                ));
                if !self.started_reported {
                    self.started_reported = true;
                    self.dispatcher.deliver(&self.owner, GattEvent::ConnectStarted);
                }
            }
            Err(reason) => {
                warn!(device = %self.address, %reason, "connect rejected by adapter");
                self.adapter.close(&self.address);
                self.fail(GattError::Rejected {
                    operation: OperationKind::Connect,
                    reason,
                });
            }
        }
    }

    fn on_link_established(&mut self) {
        if self.state != SessionState::Connecting {
            debug!(device = %self.address, state = %self.state, "unexpected link establishment");
            return;
        }
        self.cancel_timers();
        self.transition(SessionState::DiscoveringCapabilities);

        let delay = self.settings.discovery_delay;
        if delay.is_zero() {
            self.discover();
        } else {
            let attempt = self.attempt;
            self.phase_timer = Some(self.schedule(delay, SessionEvent::DiscoveryDue { attempt }));
        }
    }

    fn discover(&mut self) {
        if self.state != SessionState::DiscoveringCapabilities {
            return;
        }
        match self.adapter.discover_capabilities(&self.address) {
            Ok(()) => {
                let attempt = self.attempt;
                self.link_timer = Some(self.schedule(
                    self.settings.connect_timeout,
                    SessionEvent::LinkTimeout { attempt },
                ));
            }
            Err(reason) => self.connect_failed(GattError::Rejected {
                operation: OperationKind::Discover,
                reason,
            }),
        }
    }

    fn on_discovered(&mut self, status: AdapterStatus, services: Vec<ServiceProfile>) {
        if self.state != SessionState::DiscoveringCapabilities {
            debug!(device = %self.address, state = %self.state, "unexpected discovery result");
            return;
        }
        self.cancel_timers();
        if !status.is_success() {
            self.connect_failed(GattError::CapabilityDiscoveryFailure(status.code()));
            return;
        }

        info!(device = %self.address, services = services.len(), "capabilities discovered");
        self.services = services.clone();
        self.services_tx.send_replace(services.clone());
        self.transition(SessionState::Connected);
        self.observer.connected(&self.address, self.id);
        self.dispatcher
            .deliver(&self.owner, GattEvent::Connected { services });
    }

    fn on_link_lost(&mut self, status: AdapterStatus) {
        match self.state {
            SessionState::Connecting | SessionState::DiscoveringCapabilities => {
                self.connect_failed(GattError::ConnectFailure(status.code()))
            }
            SessionState::Connected => self.finish_disconnected(false, status),
            SessionState::Disconnecting => self.finish_disconnected(true, status),
            state => debug!(device = %self.address, %state, "link loss ignored"),
        }
    }

    fn on_link_timeout(&mut self) {
        match self.state {
            SessionState::Connecting | SessionState::DiscoveringCapabilities => {
                self.connect_failed(GattError::ConnectTimeout)
            }
            SessionState::Disconnecting => {
                warn!(device = %self.address, "link did not drop in time, closing anyway");
                self.finish_disconnected(true, AdapterStatus::SUCCESS);
            }
            _ => {}
        }
    }

    /// A connect attempt failed: retry within the reconnect budget, else give up
    fn connect_failed(&mut self, error: GattError) {
        self.cancel_timers();
        self.teardown_link();

        if error.is_retryable() && self.retries < self.settings.reconnect_count {
            self.retries += 1;
            let delay = self.settings.policy.delay(self.retries);
            warn!(
                device = %self.address,
                %error,
                retry = self.retries,
                max_retries = self.settings.reconnect_count,
                delay_ms = delay.as_millis() as u64,
                "connect attempt failed, retrying"
            );
            if self.state != SessionState::Connecting {
                self.transition(SessionState::Connecting);
            }
            let attempt = self.attempt;
            self.phase_timer = Some(self.schedule(delay, SessionEvent::RetryDue { attempt }));
        } else {
            self.fail(error);
        }
    }

    fn fail(&mut self, error: GattError) {
        self.cancel_timers();
        warn!(
            device = %self.address,
            %error,
            timeout = error.is_timeout(),
            attempts = self.retries + 1,
            "connect failed"
        );
        self.transition(SessionState::Failed);
        self.dispatcher
            .deliver(&self.owner, GattEvent::ConnectFailed(error));
        self.release();
    }

    fn on_disconnect(&mut self) {
        match self.state {
            SessionState::Idle
            | SessionState::Connecting
            | SessionState::DiscoveringCapabilities => {
                self.cancel_timers();
                self.transition(SessionState::Disconnecting);
                self.teardown_link();
                self.finish_disconnected(true, AdapterStatus::SUCCESS);
            }
            SessionState::Connected => {
                self.transition(SessionState::Disconnecting);
                match self.adapter.disconnect(&self.address) {
                    Ok(()) => {
                        let attempt = self.attempt;
                        self.link_timer = Some(self.schedule(
                            self.settings.connect_timeout,
                            SessionEvent::LinkTimeout { attempt },
                        ));
                    }
                    Err(reason) => {
                        warn!(device = %self.address, %reason, "disconnect rejected, closing");
                        self.finish_disconnected(true, AdapterStatus::SUCCESS);
                    }
                }
            }
            state => debug!(device = %self.address, %state, "disconnect ignored"),
        }
    }

    /// Every handle is gone; nobody can observe the session any more
    fn abandon(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.cancel_timers();
        self.teardown_link();
        self.finish_disconnected(true, AdapterStatus::SUCCESS);
    }

    fn finish_disconnected(&mut self, active: bool, status: AdapterStatus) {
        self.cancel_timers();
        if active && self.state != SessionState::Disconnecting {
            self.transition(SessionState::Disconnecting);
        }
        self.transition(SessionState::Disconnected);
        self.adapter.close(&self.address);
        info!(device = %self.address, active, %status, "disconnected");
        self.dispatcher
            .deliver(&self.owner, GattEvent::Disconnected { active, status });
        self.release();
    }

    /// Retire the current attempt and release the adapter link
    fn teardown_link(&mut self) {
        self.attempt += 1;
        if let Err(reason) = self.adapter.disconnect(&self.address) {
            debug!(device = %self.address, %reason, "disconnect during teardown refused");
        }
        match self.adapter.clear_cache(&self.address) {
            CacheClear::Cleared => debug!(device = %self.address, "attribute cache cleared"),
            CacheClear::Failed => warn!(device = %self.address, "attribute cache clear failed"),
            CacheClear::Unsupported => {}
        }
        self.adapter.close(&self.address);
    }

    /// Fail everything still pending and detach from the supervisor
    fn release(&mut self) {
        for entry in self.queue.drain() {
            for command in entry.into_commands() {
                self.reply(&command, GattEvent::Failed(GattError::DeviceNotConnected));
            }
        }
        self.registry.clear();
        self.live.clear();
        self.observer.closed(&self.address, self.id);
        self.finished = true;
    }

    fn transition(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            warn!(device = %self.address, from = %self.state, to = %next, "unexpected state transition");
            debug_assert!(false, "illegal session transition {} -> {}", self.state, next);
        }
        debug!(device = %self.address, from = %self.state, to = %next, "state");
        self.state = next;
        self.state_tx.send_replace(next);
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    fn on_request(&mut self, command: Command) {
        if self.state != SessionState::Connected {
            self.reply(&command, GattEvent::Failed(GattError::DeviceNotConnected));
            return;
        }
        match command.kind() {
            OperationKind::Subscribe(_) => self.request_subscribe(command),
            OperationKind::Unsubscribe(_) => self.request_unsubscribe(command),
            OperationKind::Connect | OperationKind::Discover => {
                let error = GattError::UnsupportedOperation {
                    operation: command.kind(),
                    target: *command.target(),
                };
                self.reply(&command, GattEvent::Failed(error));
            }
            _ => {
                self.registry.add_command(&command);
                self.enqueue(command);
            }
        }
    }

    fn request_subscribe(&mut self, command: Command) {
        let key = command.key();
        let id = command.subscriber().id();
        self.cancel_teardown(&key);

        if self.queue.contains(&key) {
            // Transport subscribe not answered yet; share its outcome
            self.registry.add_command(&command);
            self.enqueue(command);
            return;
        }
        if self.registry.contains(&key, &id) {
            self.reply(&command, GattEvent::Started);
            return;
        }
        let count = self.registry.add_command(&command);
        if count > 1 || (self.live.contains(&key) && !self.teardown_in_flight(&key)) {
            debug!(device = %self.address, key = %key, subscribers = count, "subscription shared");
            self.reply(&command, GattEvent::Started);
            return;
        }
        self.enqueue(command);
    }

    fn request_unsubscribe(&mut self, command: Command) {
        let Some(subscription) = command.key().subscription_key() else {
            return;
        };
        let id = command.subscriber().id();
        if !self.registry.contains(&subscription, &id) {
            self.reply(&command, GattEvent::Stopped);
            return;
        }
        for withdrawn in self.queue.withdraw(&subscription, &id) {
            self.reply(&withdrawn, GattEvent::Failed(GattError::SubscriptionCancelled));
        }
        if self.registry.remove_command(&command) > 0 {
            self.reply(&command, GattEvent::Stopped);
            return;
        }
        self.enqueue(command);
    }

    /// Drop a queued transport unsubscribe for `key` that has not been dispatched.
    /// Its callers are already out of the registry and are answered `Stopped`.
    fn cancel_teardown(&mut self, key: &CommandKey) {
        let Some(teardown) = key.teardown_key() else {
            return;
        };
        if !self.queue.contains(&teardown) || self.queue.active() == Some(&teardown) {
            return;
        }
        if let Some(entry) = self.queue.complete(&teardown) {
            debug!(device = %self.address, key = %teardown, "pending unsubscribe cancelled");
            for command in entry.into_commands() {
                self.reply(&command, GattEvent::Stopped);
            }
        }
    }

    fn teardown_in_flight(&self, key: &CommandKey) -> bool {
        key.teardown_key()
            .is_some_and(|teardown| self.queue.active() == Some(&teardown))
    }

    fn enqueue(&mut self, command: Command) {
        let key = command.key();
        if let Enqueued::Queued { generation } = self.queue.enqueue(command) {
            debug!(device = %self.address, key = %key, "queued");
            let timer = self.schedule(
                self.settings.operation_timeout,
                SessionEvent::OperationTimeout { key, generation },
            );
            self.queue.arm(&key, timer);
        }
        self.advance();
    }

    /// Dispatch pending keys until one is in flight or the queue is empty
    fn advance(&mut self) {
        while self.state == SessionState::Connected {
            let Some(key) = self.queue.next() else {
                break;
            };
            if self.execute(&key) {
                break;
            }
        }
    }

    /// Submit the active key to the adapter. Returns true when it is in flight.
    fn execute(&mut self, key: &CommandKey) -> bool {
        let Some((command, enqueued_at)) = self
            .queue
            .entry(key)
            .and_then(|entry| entry.head().cloned().map(|head| (head, entry.enqueued_at())))
        else {
            self.queue.complete(key);
            return false;
        };
        if let Some(outcome) = self.settled_locally(key) {
            debug!(device = %self.address, key = %key, "answered without the transport");
            self.resolve(key, Ok(outcome));
            return false;
        }
        if let Err(error) = self.check_capability(&command) {
            debug!(device = %self.address, key = %key, %error, "refused before dispatch");
            self.resolve(key, Err(error));
            return false;
        }

        let target = command.target();
        let submitted = match (command.kind(), command.payload()) {
            (OperationKind::Read, _) => self.adapter.read(&self.address, target),
            (OperationKind::Write, Payload::Bytes(data)) => {
                debug!(device = %self.address, payload = %hex::encode(data), "write");
                self.adapter.write(&self.address, target, data)
            }
            (OperationKind::Subscribe(mode), _) => {
                self.adapter.subscribe(&self.address, target, mode)
            }
            (OperationKind::Unsubscribe(mode), _) => {
                self.adapter.unsubscribe(&self.address, target, mode)
            }
            (OperationKind::ReadDescriptor, _) => self.adapter.read_descriptor(&self.address, target),
            (OperationKind::ReadSignalStrength, _) => {
                self.adapter.read_signal_strength(&self.address)
            }
            (OperationKind::SetTransferSize, Payload::Size(size)) => {
                self.adapter.set_transfer_size(&self.address, *size)
            }
            _ => Err(AdapterError::Unsupported),
        };

        match submitted {
            Ok(()) => {
                debug!(
                    device = %self.address,
                    key = %key,
                    waited_ms = enqueued_at.elapsed().as_millis() as u64,
                    "dispatched"
                );
                true
            }
            Err(reason) => {
                warn!(device = %self.address, key = %key, %reason, "adapter refused operation");
                self.resolve(
                    key,
                    Err(GattError::Rejected {
                        operation: command.kind(),
                        reason,
                    }),
                );
                false
            }
        }
    }

    /// Subscription changes the transport already reflects.
    /// A subscribe for a live key, or an unsubscribe for a key that is not
    /// live or has regained subscribers, needs no transport call.
    fn settled_locally(&self, key: &CommandKey) -> Option<GattEvent> {
        match key.kind() {
            OperationKind::Subscribe(_) if self.live.contains(key) => Some(GattEvent::Started),
            OperationKind::Unsubscribe(_) => {
                let subscription = key.subscription_key()?;
                if !self.live.contains(&subscription) || self.registry.count(&subscription) > 0 {
                    Some(GattEvent::Stopped)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Check the command against the discovered profile.
    /// An empty profile means the adapter reported nothing to check against.
    fn check_capability(&self, command: &Command) -> Result<(), GattError> {
        let target = command.target();
        if self.services.is_empty() || target.is_link() {
            return Ok(());
        }
        let attribute =
            find_attribute(&self.services, target).ok_or(GattError::AttributeNotFound(*target))?;

        let supported = match command.kind() {
            OperationKind::Read => attribute.can_read(),
            OperationKind::Write => attribute.can_write(),
            OperationKind::Subscribe(SubscriptionMode::Notify)
            | OperationKind::Unsubscribe(SubscriptionMode::Notify) => attribute.can_notify(),
            OperationKind::Subscribe(SubscriptionMode::Indicate)
            | OperationKind::Unsubscribe(SubscriptionMode::Indicate) => attribute.can_indicate(),
            OperationKind::ReadDescriptor => {
                return match target.descriptor {
                    Some(descriptor) if attribute.has_descriptor(&descriptor) => Ok(()),
                    _ => Err(GattError::AttributeNotFound(*target)),
                };
            }
            _ => true,
        };

        if supported {
            Ok(())
        } else {
            Err(GattError::UnsupportedOperation {
                operation: command.kind(),
                target: *target,
            })
        }
    }

    fn on_completion(&mut self, event: AdapterEvent) {
        let (kind, target, status, result) = match event {
            AdapterEvent::ReadComplete {
                target,
                status,
                value,
            } => (OperationKind::Read, target, status, GattEvent::Read(value)),
            AdapterEvent::WriteComplete {
                target,
                status,
                value,
            } => (OperationKind::Write, target, status, GattEvent::Written(value)),
            AdapterEvent::SubscriptionChanged {
                target,
                mode,
                enabled: true,
                status,
            } => (OperationKind::Subscribe(mode), target, status, GattEvent::Started),
            AdapterEvent::SubscriptionChanged {
                target,
                mode,
                enabled: false,
                status,
            } => (OperationKind::Unsubscribe(mode), target, status, GattEvent::Stopped),
            AdapterEvent::DescriptorRead {
                target,
                status,
                value,
            } => (
                OperationKind::ReadDescriptor,
                target,
                status,
                GattEvent::Descriptor(value),
            ),
            AdapterEvent::SignalStrength { status, rssi } => (
                OperationKind::ReadSignalStrength,
                TargetId::link(),
                status,
                GattEvent::SignalStrength(rssi),
            ),
            AdapterEvent::TransferSizeChanged { status, size } => (
                OperationKind::SetTransferSize,
                TargetId::link(),
                status,
                GattEvent::TransferSize(size),
            ),
            other => {
                debug!(device = %self.address, event = ?other, "not a completion");
                return;
            }
        };

        let Some(key) = self.queue.active().copied() else {
            debug!(device = %self.address, %kind, %target, "completion with nothing in flight ignored");
            return;
        };
        if !key.answers(kind, &target) {
            debug!(device = %self.address, active = %key, %kind, %target, "completion for another operation ignored");
            return;
        }

        let outcome = if status.is_success() {
            Ok(result)
        } else {
            Err(GattError::OperationFailure(status.code()))
        };
        self.resolve(&key, outcome);
        self.advance();
    }

    fn on_operation_timeout(&mut self, key: CommandKey, generation: u64) {
        let Some((entry, was_active)) = self.queue.expire(&key, generation) else {
            return;
        };
        warn!(device = %self.address, key = %key, "operation timed out");
        self.settle(&key, entry, Err(GattError::OperationTimeout));
        if was_active {
            self.advance();
        }
    }

    fn on_push(&mut self, target: TargetId, value: Vec<u8>) {
        if self.state != SessionState::Connected {
            return;
        }
        let subscribers = self.registry.push_targets(&target);
        debug!(
            device = %self.address,
            %target,
            payload = %hex::encode(&value),
            subscribers = subscribers.len(),
            "push"
        );
        self.dispatcher
            .deliver_all(&subscribers, &GattEvent::Notified(value));
    }

    /// Remove a finished key from the queue and answer its commands
    fn resolve(&mut self, key: &CommandKey, outcome: Result<GattEvent, GattError>) {
        if let Some(entry) = self.queue.complete(key) {
            self.settle(key, entry, outcome);
        }
    }

    fn settle(&mut self, key: &CommandKey, entry: QueueEntry, outcome: Result<GattEvent, GattError>) {
        let event = match &outcome {
            Ok(event) => event.clone(),
            Err(error) => GattEvent::Failed(error.clone()),
        };

        match key.kind() {
            OperationKind::Subscribe(_) => {
                if outcome.is_ok() {
                    self.live.insert(*key);
                }
                for command in entry.into_commands() {
                    if outcome.is_err() {
                        self.registry.remove(key, &command.subscriber().id());
                    }
                    self.reply(&command, event.clone());
                }
            }
            OperationKind::Unsubscribe(_) => {
                if let Some(subscription) = key.subscription_key() {
                    if outcome.is_ok() {
                        self.live.remove(&subscription);
                    } else if self.live.contains(&subscription) {
                        // Still enabled on the transport, so its callers keep it
                        warn!(device = %self.address, key = %subscription, "unsubscribe failed, subscription kept");
                        for command in entry.commands() {
                            self.registry.add(subscription, command.subscriber().clone());
                        }
                    }
                }
                for command in entry.into_commands() {
                    self.reply(&command, event.clone());
                }
            }
            _ => {
                self.registry.take(key);
                for command in entry.into_commands() {
                    self.reply(&command, event.clone());
                }
            }
        }
    }

    fn on_adapter_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::LinkEstablished => self.on_link_established(),
            AdapterEvent::LinkLost { status } => self.on_link_lost(status),
            AdapterEvent::CapabilitiesDiscovered { status, services } => {
                self.on_discovered(status, services)
            }
            AdapterEvent::ValueChanged { target, value } => self.on_push(target, value),
            completion => self.on_completion(completion),
        }
    }

    // ------------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------------

    fn reply(&self, command: &Command, event: GattEvent) {
        self.dispatcher.deliver(command.subscriber(), event);
    }

    fn cancel_timers(&mut self) {
        for timer in [self.link_timer.take(), self.phase_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
    }

    /// Post `event` back to this session after `delay`
    fn schedule(&self, delay: Duration, event: SessionEvent) -> AbortHandle {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(events) = events.upgrade() {
                let _ = events.send(event);
            }
        })
        .abort_handle()
    }

    /// Event sink for one connect attempt
    fn sink(&self, attempt: u64) -> AdapterEventSink {
        let events = self.events.clone();
        AdapterEventSink::new(move |event| match events.upgrade() {
            Some(events) => events.send(SessionEvent::Adapter { attempt, event }).is_ok(),
            None => false,
        })
    }
}
