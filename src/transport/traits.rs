// Transport Traits and Core Types
// Defines the adapter boundary the session layer drives, and the identity types shared by every layer

use crate::transport::ServiceProfile;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// DEVICE IDENTITY
// ============================================================================

/// Stable key of a remote device (a MAC-style address, normalised to upper case)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: &str) -> Self {
        Self(address.trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

/// A remote device as observed by discovery. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    address: DeviceAddress,
    name: Option<String>,
}

impl Device {
    pub fn new(address: &str) -> Self {
        Self {
            address: DeviceAddress::new(address),
            name: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

// ============================================================================
// TARGET IDENTITY
// ============================================================================

/// The (service, attribute, optional descriptor) triple naming a remote resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetId {
    pub service: Uuid,
    pub attribute: Uuid,
    pub descriptor: Option<Uuid>,
}

impl TargetId {
    pub fn new(service: Uuid, attribute: Uuid) -> Self {
        Self {
            service,
            attribute,
            descriptor: None,
        }
    }

    pub fn with_descriptor(mut self, descriptor: Uuid) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    /// Target used by link-level operations (signal strength, transfer size)
    pub fn link() -> Self {
        Self::new(Uuid::nil(), Uuid::nil())
    }

    pub fn is_link(&self) -> bool {
        self.service.is_nil() && self.attribute.is_nil()
    }

    /// The attribute this target lives on, without the descriptor
    pub fn attribute_target(&self) -> Self {
        Self::new(self.service, self.attribute)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_link() {
            return write!(f, "link");
        }
        write!(f, "{}/{}", self.service, self.attribute)?;
        if let Some(descriptor) = &self.descriptor {
            write!(f, "/{}", descriptor)?;
        }
        Ok(())
    }
}

/// How pushed values are acknowledged on a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionMode {
    /// Unacknowledged pushes
    Notify,
    /// Acknowledged pushes
    Indicate,
}

impl fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Notify => write!(f, "notify"),
            Self::Indicate => write!(f, "indicate"),
        }
    }
}

// ============================================================================
// ADAPTER STATUS AND EVENTS
// ============================================================================

/// Raw status code reported by the radio stack. Zero means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdapterStatus(pub i32);

impl AdapterStatus {
    pub const SUCCESS: AdapterStatus = AdapterStatus(0);

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }

    pub fn code(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for AdapterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Asynchronous outcomes and pushes delivered by the adapter
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// Physical link is up
    LinkEstablished,

    /// Physical link went down (or never came up)
    LinkLost { status: AdapterStatus },

    /// Capability discovery finished
    CapabilitiesDiscovered {
        status: AdapterStatus,
        services: Vec<ServiceProfile>,
    },

    ReadComplete {
        target: TargetId,
        status: AdapterStatus,
        value: Vec<u8>,
    },

    WriteComplete {
        target: TargetId,
        status: AdapterStatus,
        value: Vec<u8>,
    },

    /// Subscription switched on (`enabled`) or off
    SubscriptionChanged {
        target: TargetId,
        mode: SubscriptionMode,
        enabled: bool,
        status: AdapterStatus,
    },

    /// Unsolicited value on an active subscription
    ValueChanged { target: TargetId, value: Vec<u8> },

    DescriptorRead {
        target: TargetId,
        status: AdapterStatus,
        value: Vec<u8>,
    },

    SignalStrength { status: AdapterStatus, rssi: i32 },

    TransferSizeChanged { status: AdapterStatus, size: u16 },
}

impl AdapterEvent {
    /// Whether this event answers a queued operation
    pub fn is_completion(&self) -> bool {
        !matches!(
            self,
            Self::LinkEstablished
                | Self::LinkLost { .. }
                | Self::CapabilitiesDiscovered { .. }
                | Self::ValueChanged { .. }
        )
    }
}

/// Channel the adapter reports events on for one connect attempt
#[derive(Clone)]
pub struct AdapterEventSink {
    deliver: Arc<dyn Fn(AdapterEvent) -> bool + Send + Sync>,
}

impl AdapterEventSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(AdapterEvent) -> bool + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// Deliver an event. Returns false once the receiving session is gone.
    pub fn emit(&self, event: AdapterEvent) -> bool {
        (self.deliver)(event)
    }
}

impl fmt::Debug for AdapterEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterEventSink").finish_non_exhaustive()
    }
}

/// Outcome of a best-effort cache clear
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClear {
    Cleared,
    Failed,
    Unsupported,
}

// ============================================================================
// ADAPTER ERRORS
// ============================================================================

/// Synchronous submission failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Adapter unavailable")]
    Unavailable,

    #[error("No link to device")]
    NotLinked,

    #[error("Operation not supported by adapter")]
    Unsupported,
}

// ============================================================================
// ADAPTER TRAIT
// ============================================================================

/// Boundary to the radio stack.
///
/// Every call submits one primitive and returns at once: `Ok` when the stack
/// accepted it, `Err` when it refused synchronously. Outcomes arrive later on
/// the sink handed to `connect`. Callers never submit more than one operation
/// per connection at a time.
pub trait GattAdapter: Send + Sync {
    /// Whether the radio is present and switched on
    fn is_enabled(&self) -> bool;

    /// Open a link; events for this attempt are reported on `events`
    fn connect(
        &self,
        device: &Device,
        auto_connect: bool,
        events: AdapterEventSink,
    ) -> Result<(), AdapterError>;

    /// Ask the stack to drop the link; `LinkLost` follows
    fn disconnect(&self, device: &DeviceAddress) -> Result<(), AdapterError>;

    /// Release every stack resource held for the device
    fn close(&self, device: &DeviceAddress);

    fn discover_capabilities(&self, device: &DeviceAddress) -> Result<(), AdapterError>;

    fn read(&self, device: &DeviceAddress, target: &TargetId) -> Result<(), AdapterError>;

    fn write(
        &self,
        device: &DeviceAddress,
        target: &TargetId,
        payload: &[u8],
    ) -> Result<(), AdapterError>;

    fn subscribe(
        &self,
        device: &DeviceAddress,
        target: &TargetId,
        mode: SubscriptionMode,
    ) -> Result<(), AdapterError>;

    fn unsubscribe(
        &self,
        device: &DeviceAddress,
        target: &TargetId,
        mode: SubscriptionMode,
    ) -> Result<(), AdapterError>;

    fn read_descriptor(&self, device: &DeviceAddress, target: &TargetId)
        -> Result<(), AdapterError>;

    fn read_signal_strength(&self, device: &DeviceAddress) -> Result<(), AdapterError>;

    fn set_transfer_size(&self, device: &DeviceAddress, size: u16) -> Result<(), AdapterError>;

    /// Drop the stack's cached attribute table. Best-effort.
    fn clear_cache(&self, _device: &DeviceAddress) -> CacheClear {
        CacheClear::Unsupported
    }
}
