// Manager Configuration - Limits, timeouts and reconnect behaviour

use crate::session::{ExponentialBackoff, FixedInterval, GattError, ReconnectPolicy, SessionSettings};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Hard ceiling on simultaneous links; most radio stacks cannot hold more
pub const MAX_CONNECTIONS_LIMIT: usize = 7;
pub const MIN_CONNECT_TIMEOUT_MS: u64 = 100;
pub const MAX_RECONNECT_COUNT: u32 = 10;

/// How the delay between connect retries evolves
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectStrategy {
    /// `reconnect_interval_ms` before every retry
    #[default]
    Fixed,
    /// Starts at `reconnect_interval_ms`, doubles per retry, capped at one minute, ±20% jitter
    Exponential,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GattConfig {
    /// Cap on the connected set (clamped to 7)
    pub max_connections: usize,
    /// Cap on sessions still connecting
    pub max_pending_connections: usize,
    /// Deadline for one queued operation
    pub operation_timeout_ms: u64,
    /// Deadline for one connect attempt (and for discovery, and for a disconnect to land)
    pub connect_timeout_ms: u64,
    /// Retries after a failed connect attempt
    pub reconnect_count: u32,
    pub reconnect_interval_ms: u64,
    pub reconnect_strategy: ReconnectStrategy,
    /// Request a background connect on the first attempt
    pub auto_reconnect_on_first_connect: bool,
    /// Settling delay between link establishment and capability discovery
    pub discovery_delay_ms: u64,
}

impl GattConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values above the hard ceiling are clamped
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.min(MAX_CONNECTIONS_LIMIT);
        self
    }

    pub fn with_max_pending_connections(mut self, max: usize) -> Self {
        self.max_pending_connections = max;
        self
    }

    pub fn with_operation_timeout_ms(mut self, ms: u64) -> Self {
        self.operation_timeout_ms = ms;
        self
    }

    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn with_reconnect_count(mut self, count: u32) -> Self {
        self.reconnect_count = count;
        self
    }

    pub fn with_reconnect_interval_ms(mut self, ms: u64) -> Self {
        self.reconnect_interval_ms = ms;
        self
    }

    pub fn with_reconnect_strategy(mut self, strategy: ReconnectStrategy) -> Self {
        self.reconnect_strategy = strategy;
        self
    }

    pub fn with_auto_reconnect_on_first_connect(mut self, enabled: bool) -> Self {
        self.auto_reconnect_on_first_connect = enabled;
        self
    }

    pub fn with_discovery_delay_ms(mut self, ms: u64) -> Self {
        self.discovery_delay_ms = ms;
        self
    }

    pub fn validate(&self) -> Result<(), GattError> {
        if self.max_connections == 0 || self.max_connections > MAX_CONNECTIONS_LIMIT {
            return Err(GattError::InvalidConfig(format!(
                "max_connections must be within 1..={}",
                MAX_CONNECTIONS_LIMIT
            )));
        }
        if self.max_pending_connections == 0 {
            return Err(GattError::InvalidConfig(
                "max_pending_connections must be > 0".to_string(),
            ));
        }
        if self.operation_timeout_ms == 0 {
            return Err(GattError::InvalidConfig(
                "operation_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.connect_timeout_ms < MIN_CONNECT_TIMEOUT_MS {
            return Err(GattError::InvalidConfig(format!(
                "connect_timeout_ms must be >= {}",
                MIN_CONNECT_TIMEOUT_MS
            )));
        }
        if self.reconnect_count > MAX_RECONNECT_COUNT {
            return Err(GattError::InvalidConfig(format!(
                "reconnect_count must be <= {}",
                MAX_RECONNECT_COUNT
            )));
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn discovery_delay(&self) -> Duration {
        Duration::from_millis(self.discovery_delay_ms)
    }

    /// Retry delay policy described by the strategy fields
    pub fn reconnect_policy(&self) -> Arc<dyn ReconnectPolicy> {
        let interval = Duration::from_millis(self.reconnect_interval_ms);
        match self.reconnect_strategy {
            ReconnectStrategy::Fixed => Arc::new(FixedInterval::new(interval)),
            ReconnectStrategy::Exponential => Arc::new(
                ExponentialBackoff::new(interval)
                    .with_max_interval(Duration::from_secs(60))
                    .with_jitter(0.2),
            ),
        }
    }

    /// Session parameters for a connect with an optional timeout override
    pub fn session_settings(&self, connect_timeout: Option<Duration>) -> SessionSettings {
        let min = Duration::from_millis(MIN_CONNECT_TIMEOUT_MS);
        SessionSettings {
            connect_timeout: connect_timeout.unwrap_or_else(|| self.connect_timeout()).max(min),
            operation_timeout: self.operation_timeout(),
            discovery_delay: self.discovery_delay(),
            reconnect_count: self.reconnect_count,
            auto_connect: self.auto_reconnect_on_first_connect,
            policy: self.reconnect_policy(),
        }
    }
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            max_connections: MAX_CONNECTIONS_LIMIT,
            max_pending_connections: MAX_CONNECTIONS_LIMIT,
            operation_timeout_ms: 5_000,
            connect_timeout_ms: 10_000,
            reconnect_count: 0,
            reconnect_interval_ms: 5_000,
            reconnect_strategy: ReconnectStrategy::Fixed,
            auto_reconnect_on_first_connect: false,
            discovery_delay_ms: 500,
        }
    }
}
