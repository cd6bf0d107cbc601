// GATT Manager - Public entry point
//
// Validates requests synchronously, locates the device's session through the
// supervisor and hands commands to it. Results arrive on the subscriber
// passed with each request.

use crate::manager::{ConnectionSupervisor, GattConfig, SupervisorStats};
use crate::session::{
    Command, Dispatcher, GattError, ReconnectPolicy, SessionHandle, SessionId, SessionObserver,
    SessionState, Subscriber,
};
use crate::transport::{
    Device, DeviceAddress, GattAdapter, ServiceProfile, SubscriptionMode, TargetId,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Smallest and largest transfer unit a link can negotiate
pub const MIN_TRANSFER_SIZE: u16 = 23;
pub const MAX_TRANSFER_SIZE: u16 = 512;

fn lock(supervisor: &Mutex<ConnectionSupervisor>) -> MutexGuard<'_, ConnectionSupervisor> {
    supervisor.lock().unwrap_or_else(|e| e.into_inner())
}

/// Keeps the supervisor in step with session lifecycles
struct SupervisorLink {
    supervisor: Arc<Mutex<ConnectionSupervisor>>,
}

impl SessionObserver for SupervisorLink {
    fn connected(&self, device: &DeviceAddress, session: SessionId) {
        let evicted = lock(&self.supervisor).promote(device, session);
        if let Some(evicted) = evicted {
            info!(
                device = %evicted.address(),
                promoted = %device,
                "connection limit reached, disconnecting least recently connected device"
            );
            evicted.disconnect();
        }
    }

    fn closed(&self, device: &DeviceAddress, session: SessionId) {
        if lock(&self.supervisor).remove(device, session) {
            debug!(device = %device, %session, "session released");
        }
    }
}

pub struct GattManager {
    adapter: Arc<dyn GattAdapter>,
    config: GattConfig,
    policy: Option<Arc<dyn ReconnectPolicy>>,
    supervisor: Arc<Mutex<ConnectionSupervisor>>,
    link: Arc<SupervisorLink>,
    dispatcher: Dispatcher,
}

impl GattManager {
    /// Create a manager on the current Tokio runtime
    pub fn new(adapter: Arc<dyn GattAdapter>, config: GattConfig) -> Result<Self, GattError> {
        config.validate()?;
        let supervisor = Arc::new(Mutex::new(ConnectionSupervisor::from_config(&config)));
        Ok(Self {
            adapter,
            link: Arc::new(SupervisorLink {
                supervisor: supervisor.clone(),
            }),
            supervisor,
            config,
            policy: None,
            dispatcher: Dispatcher::spawn(),
        })
    }

    /// Replace the retry delay policy derived from the configuration
    pub fn with_reconnect_policy(mut self, policy: Arc<dyn ReconnectPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn config(&self) -> &GattConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Start connecting to `device`.
    ///
    /// `timeout` overrides the configured connect timeout. The subscriber
    /// receives `ConnectStarted`, then `Connected` or `ConnectFailed`, and
    /// finally `Disconnected` once an established link goes away.
    pub fn connect(
        &self,
        device: &Device,
        timeout: Option<Duration>,
        subscriber: Subscriber,
    ) -> Result<SessionHandle, GattError> {
        self.ensure_enabled()?;

        let mut settings = self.config.session_settings(timeout);
        if let Some(policy) = &self.policy {
            settings.policy = policy.clone();
        }

        // Held across the spawn so the session cannot report back before it is registered
        let mut supervisor = lock(&self.supervisor);
        supervisor.admit(device.address())?;
        let session = SessionHandle::spawn(
            device.clone(),
            self.adapter.clone(),
            settings,
            self.dispatcher.clone(),
            self.link.clone(),
            subscriber,
        );
        supervisor.insert_connecting(session.clone());
        info!(device = %device, session = %session.id(), "session created");
        Ok(session)
    }

    /// Caller-initiated disconnect. Returns false when the device has no session.
    pub fn disconnect(&self, address: &DeviceAddress) -> bool {
        match self.session(address) {
            Some(session) => {
                session.disconnect();
                true
            }
            None => {
                debug!(device = %address, "disconnect for unknown device ignored");
                false
            }
        }
    }

    pub fn disconnect_all(&self) {
        for session in lock(&self.supervisor).sessions() {
            session.disconnect();
        }
    }

    /// Disconnect everything and wait until every session has stopped
    pub async fn shutdown(&self) {
        let sessions = lock(&self.supervisor).drain();
        info!(sessions = sessions.len(), "shutting down");
        for session in &sessions {
            session.disconnect();
        }
        for session in &sessions {
            session.wait_for(|s| s.is_terminal()).await;
        }
    }

    pub fn is_connected(&self, address: &DeviceAddress) -> bool {
        self.session(address).is_some_and(|s| s.is_connected())
    }

    pub fn connected_devices(&self) -> Vec<Device> {
        lock(&self.supervisor).connected_devices()
    }

    pub fn connection_state(&self, address: &DeviceAddress) -> Option<SessionState> {
        self.session(address).map(|s| s.state())
    }

    /// Capability profile of a connected device
    pub fn services(&self, address: &DeviceAddress) -> Option<Vec<ServiceProfile>> {
        self.session(address)
            .filter(|s| s.is_connected())
            .map(|s| s.services())
    }

    pub fn session(&self, address: &DeviceAddress) -> Option<SessionHandle> {
        lock(&self.supervisor).session(address).cloned()
    }

    pub fn stats(&self) -> SupervisorStats {
        lock(&self.supervisor).stats()
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    pub fn subscribe(
        &self,
        address: &DeviceAddress,
        service: Uuid,
        attribute: Uuid,
        subscriber: Subscriber,
    ) -> Result<(), GattError> {
        let target = TargetId::new(service, attribute);
        self.submit(address, Command::subscribe(target, SubscriptionMode::Notify, subscriber))
    }

    pub fn unsubscribe(
        &self,
        address: &DeviceAddress,
        service: Uuid,
        attribute: Uuid,
        subscriber: Subscriber,
    ) -> Result<(), GattError> {
        let target = TargetId::new(service, attribute);
        self.submit(address, Command::unsubscribe(target, SubscriptionMode::Notify, subscriber))
    }

    /// Subscribe with acknowledged pushes
    pub fn indicate(
        &self,
        address: &DeviceAddress,
        service: Uuid,
        attribute: Uuid,
        subscriber: Subscriber,
    ) -> Result<(), GattError> {
        let target = TargetId::new(service, attribute);
        self.submit(address, Command::subscribe(target, SubscriptionMode::Indicate, subscriber))
    }

    pub fn stop_indicate(
        &self,
        address: &DeviceAddress,
        service: Uuid,
        attribute: Uuid,
        subscriber: Subscriber,
    ) -> Result<(), GattError> {
        let target = TargetId::new(service, attribute);
        self.submit(
            address,
            Command::unsubscribe(target, SubscriptionMode::Indicate, subscriber),
        )
    }

    pub fn read(
        &self,
        address: &DeviceAddress,
        service: Uuid,
        attribute: Uuid,
        subscriber: Subscriber,
    ) -> Result<(), GattError> {
        self.submit(address, Command::read(TargetId::new(service, attribute), subscriber))
    }

    pub fn write(
        &self,
        address: &DeviceAddress,
        service: Uuid,
        attribute: Uuid,
        payload: Vec<u8>,
        subscriber: Subscriber,
    ) -> Result<(), GattError> {
        if payload.is_empty() {
            return Err(GattError::EmptyPayload);
        }
        let target = TargetId::new(service, attribute);
        self.submit(address, Command::write(target, payload, subscriber))
    }

    pub fn read_descriptor(
        &self,
        address: &DeviceAddress,
        service: Uuid,
        attribute: Uuid,
        descriptor: Uuid,
        subscriber: Subscriber,
    ) -> Result<(), GattError> {
        let target = TargetId::new(service, attribute).with_descriptor(descriptor);
        self.submit(address, Command::read_descriptor(target, subscriber))
    }

    pub fn read_signal_strength(
        &self,
        address: &DeviceAddress,
        subscriber: Subscriber,
    ) -> Result<(), GattError> {
        self.submit(address, Command::read_signal_strength(subscriber))
    }

    pub fn set_transfer_size(
        &self,
        address: &DeviceAddress,
        size: u16,
        subscriber: Subscriber,
    ) -> Result<(), GattError> {
        if !(MIN_TRANSFER_SIZE..=MAX_TRANSFER_SIZE).contains(&size) {
            return Err(GattError::InvalidTransferSize(size));
        }
        self.submit(address, Command::set_transfer_size(size, subscriber))
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn ensure_enabled(&self) -> Result<(), GattError> {
        if self.adapter.is_enabled() {
            Ok(())
        } else {
            Err(GattError::TransportUnavailable)
        }
    }

    fn submit(&self, address: &DeviceAddress, command: Command) -> Result<(), GattError> {
        self.ensure_enabled()?;
        let session = self
            .session(address)
            .filter(|s| s.is_connected())
            .ok_or(GattError::DeviceNotConnected)?;
        debug!(device = %address, key = %command.key(), "request");
        session.submit(command)
    }
}
