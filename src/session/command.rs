// Commands - One requested operation and the key it is tracked under
//
// Non-shared operations are keyed per subscriber so independent callers never
// collide; shared operations (subscriptions) are keyed by target alone.

use crate::session::{Subscriber, SubscriberId};
use crate::transport::{SubscriptionMode, TargetId};
use std::fmt;

// ============================================================================
// OPERATION KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Connect,
    Discover,
    Read,
    Write,
    Subscribe(SubscriptionMode),
    Unsubscribe(SubscriptionMode),
    ReadDescriptor,
    ReadSignalStrength,
    SetTransferSize,
}

impl OperationKind {
    /// Shared kinds are reference-counted across subscribers
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Subscribe(_) | Self::Unsubscribe(_))
    }

    /// Kinds that travel through the operation queue
    pub fn is_queued(&self) -> bool {
        !matches!(self, Self::Connect | Self::Discover)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Discover => write!(f, "discover"),
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Subscribe(mode) => write!(f, "subscribe({})", mode),
            Self::Unsubscribe(mode) => write!(f, "unsubscribe({})", mode),
            Self::ReadDescriptor => write!(f, "read-descriptor"),
            Self::ReadSignalStrength => write!(f, "read-signal-strength"),
            Self::SetTransferSize => write!(f, "set-transfer-size"),
        }
    }
}

// ============================================================================
// COMMAND KEY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandKey {
    kind: OperationKind,
    target: TargetId,
    subscriber: Option<SubscriberId>,
}

impl CommandKey {
    pub fn new(kind: OperationKind, target: TargetId, subscriber: SubscriberId) -> Self {
        Self {
            kind,
            target,
            subscriber: if kind.is_shared() {
                None
            } else {
                Some(subscriber)
            },
        }
    }

    /// Key of a shared operation, independent of any subscriber
    pub fn shared(kind: OperationKind, target: TargetId) -> Self {
        Self {
            kind,
            target,
            subscriber: None,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn target(&self) -> &TargetId {
        &self.target
    }

    pub fn subscriber(&self) -> Option<SubscriberId> {
        self.subscriber
    }

    /// Whether an adapter completion for (kind, target) answers this key
    pub fn answers(&self, kind: OperationKind, target: &TargetId) -> bool {
        self.kind == kind && &self.target == target
    }

    /// The subscription an unsubscribe key tears down
    pub fn subscription_key(&self) -> Option<CommandKey> {
        match self.kind {
            OperationKind::Unsubscribe(mode) => Some(Self::shared(
                OperationKind::Subscribe(mode),
                self.target,
            )),
            _ => None,
        }
    }

    /// The unsubscribe that tears down a subscribe key
    pub fn teardown_key(&self) -> Option<CommandKey> {
        match self.kind {
            OperationKind::Subscribe(mode) => Some(Self::shared(
                OperationKind::Unsubscribe(mode),
                self.target,
            )),
            _ => None,
        }
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind, self.target)?;
        if let Some(subscriber) = &self.subscriber {
            write!(f, "#{}", subscriber)?;
        }
        Ok(())
    }
}

// ============================================================================
// COMMAND
// ============================================================================

/// Operation-dependent argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    None,
    Bytes(Vec<u8>),
    Size(u16),
}

#[derive(Debug, Clone)]
pub struct Command {
    kind: OperationKind,
    target: TargetId,
    payload: Payload,
    subscriber: Subscriber,
}

impl Command {
    pub fn new(
        kind: OperationKind,
        target: TargetId,
        payload: Payload,
        subscriber: Subscriber,
    ) -> Self {
        Self {
            kind,
            target,
            payload,
            subscriber,
        }
    }

    pub fn read(target: TargetId, subscriber: Subscriber) -> Self {
        Self::new(OperationKind::Read, target, Payload::None, subscriber)
    }

    pub fn write(target: TargetId, data: Vec<u8>, subscriber: Subscriber) -> Self {
        Self::new(OperationKind::Write, target, Payload::Bytes(data), subscriber)
    }

    pub fn subscribe(target: TargetId, mode: SubscriptionMode, subscriber: Subscriber) -> Self {
        Self::new(OperationKind::Subscribe(mode), target, Payload::None, subscriber)
    }

    pub fn unsubscribe(target: TargetId, mode: SubscriptionMode, subscriber: Subscriber) -> Self {
        Self::new(
            OperationKind::Unsubscribe(mode),
            target,
            Payload::None,
            subscriber,
        )
    }

    pub fn read_descriptor(target: TargetId, subscriber: Subscriber) -> Self {
        Self::new(OperationKind::ReadDescriptor, target, Payload::None, subscriber)
    }

    pub fn read_signal_strength(subscriber: Subscriber) -> Self {
        Self::new(
            OperationKind::ReadSignalStrength,
            TargetId::link(),
            Payload::None,
            subscriber,
        )
    }

    pub fn set_transfer_size(size: u16, subscriber: Subscriber) -> Self {
        Self::new(
            OperationKind::SetTransferSize,
            TargetId::link(),
            Payload::Size(size),
            subscriber,
        )
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn target(&self) -> &TargetId {
        &self.target
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    pub fn key(&self) -> CommandKey {
        CommandKey::new(self.kind, self.target, self.subscriber.id())
    }
}
