// Simulated Adapter
// In-memory GattAdapter used by the demo binary and the test-suite.
// Manual mode leaves every outcome to the caller; auto mode answers after a fixed latency.

use crate::session::OperationKind;
use crate::transport::{
    AdapterError, AdapterEvent, AdapterEventSink, AdapterStatus, CacheClear, Device,
    DeviceAddress, GattAdapter, ServiceProfile, SubscriptionMode, TargetId,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

// ============================================================================
// CALL JOURNAL
// ============================================================================

/// One primitive submitted to the adapter
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterCall {
    Connect { device: DeviceAddress, auto_connect: bool },
    Disconnect { device: DeviceAddress },
    Close { device: DeviceAddress },
    ClearCache { device: DeviceAddress },
    Discover { device: DeviceAddress },
    Read { device: DeviceAddress, target: TargetId },
    Write { device: DeviceAddress, target: TargetId, payload: Vec<u8> },
    Subscribe { device: DeviceAddress, target: TargetId, mode: SubscriptionMode },
    Unsubscribe { device: DeviceAddress, target: TargetId, mode: SubscriptionMode },
    ReadDescriptor { device: DeviceAddress, target: TargetId },
    ReadSignalStrength { device: DeviceAddress },
    SetTransferSize { device: DeviceAddress, size: u16 },
}

impl AdapterCall {
    /// Operation kind of the call; `None` for link housekeeping
    pub fn kind(&self) -> Option<OperationKind> {
        match self {
            Self::Connect { .. } => Some(OperationKind::Connect),
            Self::Discover { .. } => Some(OperationKind::Discover),
            Self::Read { .. } => Some(OperationKind::Read),
            Self::Write { .. } => Some(OperationKind::Write),
            Self::Subscribe { mode, .. } => Some(OperationKind::Subscribe(*mode)),
            Self::Unsubscribe { mode, .. } => Some(OperationKind::Unsubscribe(*mode)),
            Self::ReadDescriptor { .. } => Some(OperationKind::ReadDescriptor),
            Self::ReadSignalStrength { .. } => Some(OperationKind::ReadSignalStrength),
            Self::SetTransferSize { .. } => Some(OperationKind::SetTransferSize),
            Self::Disconnect { .. } | Self::Close { .. } | Self::ClearCache { .. } => None,
        }
    }

    pub fn device(&self) -> &DeviceAddress {
        match self {
            Self::Connect { device, .. }
            | Self::Disconnect { device }
            | Self::Close { device }
            | Self::ClearCache { device }
            | Self::Discover { device }
            | Self::Read { device, .. }
            | Self::Write { device, .. }
            | Self::Subscribe { device, .. }
            | Self::Unsubscribe { device, .. }
            | Self::ReadDescriptor { device, .. }
            | Self::ReadSignalStrength { device }
            | Self::SetTransferSize { device, .. } => device,
        }
    }
}

/// What an auto-mode link does after `connect`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkBehavior {
    /// Link comes up and discovery succeeds
    Establish,
    /// Link never comes up; `LinkLost` with the status
    Fail(AdapterStatus),
    /// Link comes up, discovery reports the status
    FailDiscovery(AdapterStatus),
    /// Nothing is ever reported
    Silent,
}

// ============================================================================
// SIMULATED ADAPTER
// ============================================================================

struct SimState {
    enabled: bool,
    latency: Option<Duration>,
    link: LinkBehavior,
    services: Vec<ServiceProfile>,
    sinks: HashMap<DeviceAddress, AdapterEventSink>,
    linked: HashSet<DeviceAddress>,
    calls: Vec<AdapterCall>,
    outstanding: HashMap<DeviceAddress, usize>,
    max_outstanding: usize,
    rejected: HashSet<OperationKind>,
    values: HashMap<TargetId, Vec<u8>>,
    rssi: i32,
    cache: CacheClear,
    report_disconnect: bool,
}

/// In-memory adapter with a call journal and an outstanding-operation high-water mark
#[derive(Clone)]
pub struct SimulatedAdapter {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedAdapter {
    /// Manual mode: outcomes are injected by the caller
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                enabled: true,
                latency: None,
                link: LinkBehavior::Establish,
                services: Vec::new(),
                sinks: HashMap::new(),
                linked: HashSet::new(),
                calls: Vec::new(),
                outstanding: HashMap::new(),
                max_outstanding: 0,
                rejected: HashSet::new(),
                values: HashMap::new(),
                rssi: -60,
                cache: CacheClear::Unsupported,
                report_disconnect: true,
            })),
        }
    }

    /// Answer every accepted primitive after `latency`
    pub fn auto_respond(self, latency: Duration) -> Self {
        self.lock().latency = Some(latency);
        self
    }

    pub fn with_services(self, services: Vec<ServiceProfile>) -> Self {
        self.lock().services = services;
        self
    }

    pub fn with_link_behavior(self, behavior: LinkBehavior) -> Self {
        self.lock().link = behavior;
        self
    }

    pub fn with_value(self, target: TargetId, value: Vec<u8>) -> Self {
        self.lock().values.insert(target, value);
        self
    }

    pub fn with_rssi(self, rssi: i32) -> Self {
        self.lock().rssi = rssi;
        self
    }

    pub fn with_cache_clear(self, outcome: CacheClear) -> Self {
        self.lock().cache = outcome;
        self
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.lock().enabled = enabled;
    }

    pub fn set_link_behavior(&self, behavior: LinkBehavior) {
        self.lock().link = behavior;
    }

    /// When false, `disconnect` drops the link without ever reporting it
    pub fn set_report_disconnect(&self, report: bool) {
        self.lock().report_disconnect = report;
    }

    /// Refuse every future submission of `kind` synchronously
    pub fn reject(&self, kind: OperationKind) {
        self.lock().rejected.insert(kind);
    }

    pub fn accept(&self, kind: OperationKind) {
        self.lock().rejected.remove(&kind);
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.lock().calls.clone()
    }

    /// Number of submissions (accepted or not) of `kind`
    pub fn count(&self, kind: OperationKind) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.kind() == Some(kind))
            .count()
    }

    /// Queued operations submitted, in order, ignoring link housekeeping
    pub fn operations(&self) -> Vec<AdapterCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c.kind(), Some(k) if k.is_queued()))
            .cloned()
            .collect()
    }

    pub fn outstanding(&self, device: &DeviceAddress) -> usize {
        self.lock().outstanding.get(device).copied().unwrap_or(0)
    }

    /// Highest number of simultaneously outstanding operations seen on any link
    pub fn max_outstanding(&self) -> usize {
        self.lock().max_outstanding
    }

    pub fn is_linked(&self, device: &DeviceAddress) -> bool {
        self.lock().linked.contains(device)
    }

    // ------------------------------------------------------------------------
    // Event injection
    // ------------------------------------------------------------------------

    /// Deliver an event to the session that owns `device`.
    /// Completions release one outstanding slot.
    pub fn emit(&self, device: &DeviceAddress, event: AdapterEvent) -> bool {
        let sink = {
            let mut state = self.lock();
            if event.is_completion() {
                if let Some(n) = state.outstanding.get_mut(device) {
                    *n = n.saturating_sub(1);
                }
            }
            match &event {
                AdapterEvent::LinkEstablished => {
                    state.linked.insert(device.clone());
                }
                AdapterEvent::LinkLost { .. } => {
                    state.linked.remove(device);
                }
                _ => {}
            }
            state.sinks.get(device).cloned()
        };
        match sink {
            Some(sink) => sink.emit(event),
            None => false,
        }
    }

    pub fn establish_link(&self, device: &DeviceAddress) -> bool {
        self.emit(device, AdapterEvent::LinkEstablished)
    }

    pub fn lose_link(&self, device: &DeviceAddress, status: AdapterStatus) -> bool {
        self.emit(device, AdapterEvent::LinkLost { status })
    }

    /// Report successful discovery with the configured services
    pub fn complete_discovery(&self, device: &DeviceAddress) -> bool {
        let services = self.lock().services.clone();
        self.emit(
            device,
            AdapterEvent::CapabilitiesDiscovered {
                status: AdapterStatus::SUCCESS,
                services,
            },
        )
    }

    /// Bring a link fully up: link established then discovery
    pub fn bring_up(&self, device: &DeviceAddress) -> bool {
        self.establish_link(device) && self.complete_discovery(device)
    }

    /// Push a value on a subscription
    pub fn push(&self, device: &DeviceAddress, target: TargetId, value: Vec<u8>) -> bool {
        self.emit(device, AdapterEvent::ValueChanged { target, value })
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record and vet one queued primitive, scheduling its answer in auto mode
    fn submit(&self, call: AdapterCall) -> Result<(), AdapterError> {
        let device = call.device().clone();
        let (sink, latency, response) = {
            let mut state = self.lock();
            if !state.enabled {
                return Err(AdapterError::Unavailable);
            }
            state.calls.push(call.clone());
            if let Some(kind) = call.kind() {
                if state.rejected.contains(&kind) {
                    return Err(AdapterError::Rejected(format!("{} refused", kind)));
                }
            }
            let sink = state.sinks.get(&device).cloned().ok_or(AdapterError::NotLinked)?;

            if matches!(call.kind(), Some(k) if k.is_queued()) {
                let n = state.outstanding.entry(device.clone()).or_insert(0);
                *n += 1;
                let n = *n;
                state.max_outstanding = state.max_outstanding.max(n);
            }

            if let AdapterCall::Write { target, payload, .. } = &call {
                state.values.insert(*target, payload.clone());
            }

            let response = Self::auto_response(&state, &call);
            (sink, state.latency, response)
        };

        if let (Some(latency), Some(event)) = (latency, response) {
            self.schedule(device, sink, latency, event);
        }
        Ok(())
    }

    fn schedule(
        &self,
        device: DeviceAddress,
        sink: AdapterEventSink,
        latency: Duration,
        event: AdapterEvent,
    ) {
        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            {
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                if event.is_completion() {
                    if let Some(n) = state.outstanding.get_mut(&device) {
                        *n = n.saturating_sub(1);
                    }
                }
                match &event {
                    AdapterEvent::LinkEstablished => {
                        state.linked.insert(device.clone());
                    }
                    AdapterEvent::LinkLost { .. } => {
                        state.linked.remove(&device);
                    }
                    _ => {}
                }
            }
            trace!(device = %device, ?event, "simulated response");
            sink.emit(event);
        });
    }

    fn auto_response(state: &SimState, call: &AdapterCall) -> Option<AdapterEvent> {
        let ok = AdapterStatus::SUCCESS;
        let event = match call {
            AdapterCall::Discover { .. } => match state.link {
                LinkBehavior::FailDiscovery(status) => AdapterEvent::CapabilitiesDiscovered {
                    status,
                    services: Vec::new(),
                },
                _ => AdapterEvent::CapabilitiesDiscovered {
                    status: ok,
                    services: state.services.clone(),
                },
            },
            AdapterCall::Read { target, .. } => AdapterEvent::ReadComplete {
                target: *target,
                status: ok,
                value: state.values.get(target).cloned().unwrap_or_default(),
            },
            AdapterCall::Write { target, payload, .. } => AdapterEvent::WriteComplete {
                target: *target,
                status: ok,
                value: payload.clone(),
            },
            AdapterCall::Subscribe { target, mode, .. } => AdapterEvent::SubscriptionChanged {
                target: *target,
                mode: *mode,
                enabled: true,
                status: ok,
            },
            AdapterCall::Unsubscribe { target, mode, .. } => AdapterEvent::SubscriptionChanged {
                target: *target,
                mode: *mode,
                enabled: false,
                status: ok,
            },
            AdapterCall::ReadDescriptor { target, .. } => AdapterEvent::DescriptorRead {
                target: *target,
                status: ok,
                value: state.values.get(target).cloned().unwrap_or_default(),
            },
            AdapterCall::ReadSignalStrength { .. } => AdapterEvent::SignalStrength {
                status: ok,
                rssi: state.rssi,
            },
            AdapterCall::SetTransferSize { size, .. } => AdapterEvent::TransferSizeChanged {
                status: ok,
                size: *size,
            },
            _ => return None,
        };
        Some(event)
    }
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl GattAdapter for SimulatedAdapter {
    fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    fn connect(
        &self,
        device: &Device,
        auto_connect: bool,
        events: AdapterEventSink,
    ) -> Result<(), AdapterError> {
        let address = device.address().clone();
        let (latency, link) = {
            let mut state = self.lock();
            if !state.enabled {
                return Err(AdapterError::Unavailable);
            }
            state.calls.push(AdapterCall::Connect {
                device: address.clone(),
                auto_connect,
            });
            if state.rejected.contains(&OperationKind::Connect) {
                return Err(AdapterError::Rejected("connect refused".to_string()));
            }
            state.sinks.insert(address.clone(), events.clone());
            (state.latency, state.link)
        };

        if let Some(latency) = latency {
            let event = match link {
                LinkBehavior::Establish | LinkBehavior::FailDiscovery(_) => {
                    Some(AdapterEvent::LinkEstablished)
                }
                LinkBehavior::Fail(status) => Some(AdapterEvent::LinkLost { status }),
                LinkBehavior::Silent => None,
            };
            if let Some(event) = event {
                self.schedule(address, events, latency, event);
            }
        }
        Ok(())
    }

    fn disconnect(&self, device: &DeviceAddress) -> Result<(), AdapterError> {
        let sink = {
            let mut state = self.lock();
            state.calls.push(AdapterCall::Disconnect {
                device: device.clone(),
            });
            if !state.linked.remove(device) || !state.report_disconnect {
                return Ok(());
            }
            state.sinks.get(device).cloned()
        };
        if let Some(sink) = sink {
            sink.emit(AdapterEvent::LinkLost {
                status: AdapterStatus::SUCCESS,
            });
        }
        Ok(())
    }

    fn close(&self, device: &DeviceAddress) {
        let mut state = self.lock();
        state.calls.push(AdapterCall::Close {
            device: device.clone(),
        });
        state.sinks.remove(device);
        state.linked.remove(device);
        state.outstanding.remove(device);
    }

    fn discover_capabilities(&self, device: &DeviceAddress) -> Result<(), AdapterError> {
        self.submit(AdapterCall::Discover {
            device: device.clone(),
        })
    }

    fn read(&self, device: &DeviceAddress, target: &TargetId) -> Result<(), AdapterError> {
        self.submit(AdapterCall::Read {
            device: device.clone(),
            target: *target,
        })
    }

    fn write(
        &self,
        device: &DeviceAddress,
        target: &TargetId,
        payload: &[u8],
    ) -> Result<(), AdapterError> {
        self.submit(AdapterCall::Write {
            device: device.clone(),
            target: *target,
            payload: payload.to_vec(),
        })
    }

    fn subscribe(
        &self,
        device: &DeviceAddress,
        target: &TargetId,
        mode: SubscriptionMode,
    ) -> Result<(), AdapterError> {
        self.submit(AdapterCall::Subscribe {
            device: device.clone(),
            target: *target,
            mode,
        })
    }

    fn unsubscribe(
        &self,
        device: &DeviceAddress,
        target: &TargetId,
        mode: SubscriptionMode,
    ) -> Result<(), AdapterError> {
        self.submit(AdapterCall::Unsubscribe {
            device: device.clone(),
            target: *target,
            mode,
        })
    }

    fn read_descriptor(
        &self,
        device: &DeviceAddress,
        target: &TargetId,
    ) -> Result<(), AdapterError> {
        self.submit(AdapterCall::ReadDescriptor {
            device: device.clone(),
            target: *target,
        })
    }

    fn read_signal_strength(&self, device: &DeviceAddress) -> Result<(), AdapterError> {
        self.submit(AdapterCall::ReadSignalStrength {
            device: device.clone(),
        })
    }

    fn set_transfer_size(&self, device: &DeviceAddress, size: u16) -> Result<(), AdapterError> {
        self.submit(AdapterCall::SetTransferSize {
            device: device.clone(),
            size,
        })
    }

    fn clear_cache(&self, device: &DeviceAddress) -> CacheClear {
        let mut state = self.lock();
        state.calls.push(AdapterCall::ClearCache {
            device: device.clone(),
        });
        state.cache
    }
}
