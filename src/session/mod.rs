// Session Module - Per-connection operation serialization and lifecycle
//
// A session owns one device link: its state machine, its single-flight
// operation queue and the registry that multiplexes subscribers onto
// commands. All of it runs on one task per connection.

mod actor;
pub mod backoff;
mod command;
mod dispatch;
mod error;
pub mod queue;
mod registry;
mod state;

pub use actor::{SessionHandle, SessionId, SessionObserver, SessionSettings};
pub use backoff::{ExponentialBackoff, FixedInterval, ReconnectPolicy};
pub use command::{Command, CommandKey, OperationKind, Payload};
pub use dispatch::{DeliveryContext, Dispatcher, GattEvent, Subscriber, SubscriberId};
pub use error::GattError;
pub use queue::{Enqueued, OperationQueue, QueueEntry};
pub use registry::CallbackRegistry;
pub use state::SessionState;
