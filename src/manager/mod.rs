// Manager Module - Multi-device front end
// Configuration, the connection supervisor and the public API

mod api;
mod config;
mod supervisor;

pub use api::{GattManager, MAX_TRANSFER_SIZE, MIN_TRANSFER_SIZE};
pub use config::{
    GattConfig, ReconnectStrategy, MAX_CONNECTIONS_LIMIT, MAX_RECONNECT_COUNT,
    MIN_CONNECT_TIMEOUT_MS,
};
pub use supervisor::{ConnectionSupervisor, SupervisorStats};
