// Result Delivery - What subscribers receive, and on which context
//
// A Subscriber picks its delivery context once, at creation. Caller-context
// subscribers are served on the runtime that created them through an ordered
// lane; primary-context subscribers share the manager's single primary lane.
// Delivery is always a non-blocking channel send.

use crate::session::GattError;
use crate::transport::{AdapterStatus, ServiceProfile};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

// ============================================================================
// EVENTS
// ============================================================================

/// Everything a subscriber can be told
#[derive(Debug, Clone, PartialEq)]
pub enum GattEvent {
    /// The adapter accepted the first connect attempt
    ConnectStarted,
    /// Link up and capabilities discovered
    Connected { services: Vec<ServiceProfile> },
    /// Terminal connect failure, after retries
    ConnectFailed(GattError),
    /// An established (or establishing) link went away
    Disconnected { active: bool, status: AdapterStatus },

    Read(Vec<u8>),
    Written(Vec<u8>),
    /// Subscription is active for this subscriber
    Started,
    /// Subscription is gone for this subscriber
    Stopped,
    /// Value pushed on an active subscription
    Notified(Vec<u8>),
    Descriptor(Vec<u8>),
    SignalStrength(i32),
    TransferSize(u16),

    /// The subscriber's command failed
    Failed(GattError),
}

impl GattEvent {
    pub fn error(&self) -> Option<&GattError> {
        match self {
            Self::ConnectFailed(e) | Self::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error().is_some()
    }
}

// ============================================================================
// SUBSCRIBER
// ============================================================================

static NEXT_SUBSCRIBER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    fn next() -> Self {
        Self(NEXT_SUBSCRIBER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryContext {
    /// The runtime (or task) that issued the request
    Caller,
    /// The manager's primary lane
    Primary,
}

type Handler = Arc<dyn Fn(GattEvent) + Send + Sync>;

#[derive(Clone)]
enum Sink {
    Channel(mpsc::UnboundedSender<GattEvent>),
    Handler(Handler),
}

/// A party interested in the results of one or more commands.
///
/// Identity is the id: clones of a subscriber are the same subscriber, which is
/// how an unsubscribe finds the subscription it cancels.
#[derive(Clone)]
pub struct Subscriber {
    id: SubscriberId,
    context: DeliveryContext,
    sink: Sink,
}

impl Subscriber {
    /// Caller-context subscriber whose events are read from the returned receiver
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<GattEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = Self {
            id: SubscriberId::next(),
            context: DeliveryContext::Caller,
            sink: Sink::Channel(tx),
        };
        (subscriber, rx)
    }

    /// Caller-context subscriber backed by a callback.
    ///
    /// The callback runs on an ordered lane spawned on the current Tokio
    /// runtime. Outside a runtime it is served by the primary lane instead.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(GattEvent) + Send + Sync + 'static,
    {
        match Handle::try_current() {
            Ok(handle) => {
                let (tx, mut rx) = mpsc::unbounded_channel::<GattEvent>();
                handle.spawn(async move {
                    while let Some(event) = rx.recv().await {
                        f(event);
                    }
                });
                Self {
                    id: SubscriberId::next(),
                    context: DeliveryContext::Caller,
                    sink: Sink::Channel(tx),
                }
            }
            Err(_) => Self::on_primary(f),
        }
    }

    /// Callback served on the manager's primary lane
    pub fn on_primary<F>(f: F) -> Self
    where
        F: Fn(GattEvent) + Send + Sync + 'static,
    {
        Self {
            id: SubscriberId::next(),
            context: DeliveryContext::Primary,
            sink: Sink::Handler(Arc::new(f)),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn context(&self) -> DeliveryContext {
        self.context
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Subscriber {}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("context", &self.context)
            .finish()
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// Routes events to subscribers without ever blocking the sender
#[derive(Clone)]
pub struct Dispatcher {
    primary: mpsc::UnboundedSender<(Handler, GattEvent)>,
}

impl Dispatcher {
    /// Start the primary lane on the current runtime
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Handler, GattEvent)>();
        tokio::spawn(async move {
            while let Some((handler, event)) = rx.recv().await {
                handler(event);
            }
        });
        Self { primary: tx }
    }

    /// Hand `event` to `subscriber`. Returns false if nobody is listening any more.
    pub fn deliver(&self, subscriber: &Subscriber, event: GattEvent) -> bool {
        let delivered = match &subscriber.sink {
            Sink::Channel(tx) => tx.send(event).is_ok(),
            Sink::Handler(handler) => self.primary.send((handler.clone(), event)).is_ok(),
        };
        if !delivered {
            debug!(subscriber = %subscriber.id, "subscriber gone, event dropped");
        }
        delivered
    }

    pub fn deliver_all<'a, I>(&self, subscribers: I, event: &GattEvent)
    where
        I: IntoIterator<Item = &'a Subscriber>,
    {
        for subscriber in subscribers {
            self.deliver(subscriber, event.clone());
        }
    }
}
