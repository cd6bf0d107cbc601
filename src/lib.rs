// gattq - Single-flight GATT client core
//
// transport: the adapter boundary, identity types and a simulated adapter
// session:   per-connection state machine, operation queue and subscriber registry
// manager:   configuration, connection supervision and the public API

pub mod manager;
pub mod session;
pub mod transport;

pub use manager::{GattConfig, GattManager, ReconnectStrategy};
pub use session::{GattError, GattEvent, SessionState, Subscriber};
pub use transport::{Device, DeviceAddress, GattAdapter, TargetId};
