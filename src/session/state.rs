// Session State - Lifecycle graph of one logical connection

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Created, no attempt made yet
    Idle,
    /// Waiting for the link (or for the next retry)
    Connecting,
    /// Link up, capability discovery pending
    DiscoveringCapabilities,
    /// Ready for operations
    Connected,
    /// Caller asked to disconnect; waiting for the link to drop
    Disconnecting,
    Disconnected,
    /// Connect attempts exhausted
    Failed,
}

impl SessionState {
    /// Whether the state graph has an edge from `self` to `next`
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Disconnecting)
                | (Connecting, Connecting)
                | (Connecting, DiscoveringCapabilities)
                | (Connecting, Disconnecting)
                | (Connecting, Failed)
                | (DiscoveringCapabilities, Connecting)
                | (DiscoveringCapabilities, Connected)
                | (DiscoveringCapabilities, Disconnecting)
                | (DiscoveringCapabilities, Failed)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Disconnecting, Disconnected)
                | (Failed, Connecting)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }

    /// Still working towards a link
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting | Self::DiscoveringCapabilities)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::DiscoveringCapabilities => "discovering",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}
