// Transport module - THE RADIO BOUNDARY
// Adapter contract, identity types, capability profiles and an in-memory adapter

mod traits;
mod profile;
pub mod sim;

pub use traits::{
    // Core trait
    GattAdapter,
    // Identity
    Device, DeviceAddress, TargetId, SubscriptionMode,
    // Events and errors
    AdapterEvent, AdapterEventSink, AdapterStatus, AdapterError, CacheClear,
};

pub use profile::{find_attribute, AttributeProfile, ServiceProfile};

pub use sim::{AdapterCall, LinkBehavior, SimulatedAdapter};
