// Connection Supervisor - Which sessions exist, and which of them are connected
//
// Sessions start in the connecting set and are promoted once their
// capabilities are discovered. The connected set keeps promotion order so the
// least recently promoted session is the one evicted when the cap is hit.

use crate::manager::GattConfig;
use crate::session::{GattError, SessionHandle, SessionId};
use crate::transport::{Device, DeviceAddress};
use std::collections::HashMap;

/// Counts of supervised sessions
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub connecting: usize,
    pub connected: usize,
    pub evictions: u64,
}

#[derive(Debug)]
pub struct ConnectionSupervisor {
    max_connections: usize,
    max_pending: usize,
    connecting: HashMap<DeviceAddress, SessionHandle>,
    /// Oldest promotion first
    connected: Vec<SessionHandle>,
    evictions: u64,
}

impl ConnectionSupervisor {
    pub fn new(max_connections: usize, max_pending: usize) -> Self {
        Self {
            max_connections,
            max_pending,
            connecting: HashMap::new(),
            connected: Vec::new(),
            evictions: 0,
        }
    }

    pub fn from_config(config: &GattConfig) -> Self {
        Self::new(config.max_connections, config.max_pending_connections)
    }

    /// Locate the live session for a device, connecting or connected
    pub fn session(&self, address: &DeviceAddress) -> Option<&SessionHandle> {
        self.connecting.get(address).or_else(|| {
            self.connected
                .iter()
                .find(|s| s.address() == address)
        })
    }

    pub fn contains(&self, address: &DeviceAddress) -> bool {
        self.session(address).is_some()
    }

    /// Check that a new session for `address` may be created.
    /// A session that already reached a terminal state is dropped here.
    pub fn admit(&mut self, address: &DeviceAddress) -> Result<(), GattError> {
        if let Some(existing) = self.session(address) {
            if !existing.state().is_terminal() {
                return Err(GattError::AlreadyConnected);
            }
            let id = existing.id();
            self.remove(address, id);
        }
        if self.connecting.len() >= self.max_pending {
            return Err(GattError::MaxConnectionsReached);
        }
        if self.connected.len() >= self.max_connections {
            return Err(GattError::MaxConnectionsReached);
        }
        Ok(())
    }

    pub fn insert_connecting(&mut self, session: SessionHandle) {
        self.connecting.insert(session.address().clone(), session);
    }

    /// Move a session to the connected set.
    /// Returns the session evicted to make room, if any.
    pub fn promote(&mut self, address: &DeviceAddress, id: SessionId) -> Option<SessionHandle> {
        match self.connecting.get(address) {
            Some(session) if session.id() == id => {}
            _ => return None,
        }
        let session = self.connecting.remove(address)?;

        let evicted = if self.connected.len() >= self.max_connections {
            self.evictions += 1;
            Some(self.connected.remove(0))
        } else {
            None
        };
        self.connected.push(session);
        evicted
    }

    /// Forget a session. Ignored unless `id` is the session currently held for `address`.
    pub fn remove(&mut self, address: &DeviceAddress, id: SessionId) -> bool {
        if self.connecting.get(address).is_some_and(|s| s.id() == id) {
            self.connecting.remove(address);
            return true;
        }
        let before = self.connected.len();
        self.connected
            .retain(|s| !(s.address() == address && s.id() == id));
        self.connected.len() != before
    }

    pub fn connected_devices(&self) -> Vec<Device> {
        self.connected.iter().map(|s| s.device().clone()).collect()
    }

    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.connecting
            .values()
            .chain(self.connected.iter())
            .cloned()
            .collect()
    }

    /// Remove every session, returning them for shutdown
    pub fn drain(&mut self) -> Vec<SessionHandle> {
        let mut sessions: Vec<SessionHandle> = self.connecting.drain().map(|(_, s)| s).collect();
        sessions.append(&mut self.connected);
        sessions
    }

    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            connecting: self.connecting.len(),
            connected: self.connected.len(),
            evictions: self.evictions,
        }
    }
}
