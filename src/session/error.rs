// Session Errors
// Every failure a subscriber or API caller can observe

use crate::session::OperationKind;
use crate::transport::{AdapterError, TargetId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GattError {
    #[error("Connect timeout")]
    ConnectTimeout,

    #[error("Connect failed with status {0}")]
    ConnectFailure(i32),

    #[error("Capability discovery failed with status {0}")]
    CapabilityDiscoveryFailure(i32),

    #[error("Operation failed with status {0}")]
    OperationFailure(i32),

    #[error("Operation {operation} not supported by {target}")]
    UnsupportedOperation {
        operation: OperationKind,
        target: TargetId,
    },

    #[error("Attribute not found: {0}")]
    AttributeNotFound(TargetId),

    #[error("Payload is empty")]
    EmptyPayload,

    #[error("Transfer size {0} outside 23..=512")]
    InvalidTransferSize(u16),

    #[error("Device not connected")]
    DeviceNotConnected,

    #[error("Device already connected or connecting")]
    AlreadyConnected,

    #[error("Maximum connections reached")]
    MaxConnectionsReached,

    #[error("Transport unavailable")]
    TransportUnavailable,

    #[error("Operation timeout")]
    OperationTimeout,

    #[error("Subscription withdrawn before it started")]
    SubscriptionCancelled,

    #[error("Adapter rejected {operation}: {reason}")]
    Rejected {
        operation: OperationKind,
        reason: AdapterError,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GattError {
    /// Errors raised while establishing a link
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout
                | Self::ConnectFailure(_)
                | Self::CapabilityDiscoveryFailure(_)
                | Self::DeviceNotConnected
                | Self::AlreadyConnected
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout | Self::OperationTimeout)
    }

    /// Whether repeating the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout
                | Self::ConnectFailure(_)
                | Self::CapabilityDiscoveryFailure(_)
                | Self::OperationFailure(_)
                | Self::OperationTimeout
                | Self::Rejected { .. }
        )
    }
}
