//! In-process star network with the same `Session` interface
//!
//! Used by tests and local simulations. Messages are delivered in send order
//! and only become visible on the receiver's next `poll`.

use super::protocol::Message;
use super::session::{ConnectionState, Session, SessionEvent};
use super::{DeviceId, DeviceInfo, SessionError};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Default)]
struct Hub {
    host: Option<DeviceId>,
    /// Devices currently attached, in join order
    members: BTreeMap<u64, DeviceInfo>,
    inboxes: HashMap<DeviceId, Vec<SessionEvent>>,
    next_seq: u64,
}

impl Hub {
    fn contains(&self, id: &str) -> bool {
        self.members.values().any(|d| d.id == id)
    }

    fn push(&mut self, to: &str, event: SessionEvent) {
        if let Some(inbox) = self.inboxes.get_mut(to) {
            inbox.push(event);
        }
    }

    fn clients(&self) -> Vec<DeviceInfo> {
        self.members
            .values()
            .filter(|d| Some(&d.id) != self.host.as_ref())
            .cloned()
            .collect()
    }

    fn detach(&mut self, id: &str) {
        self.members.retain(|_, d| d.id != id);
        if self.host.as_deref() == Some(id) {
            self.host = None;
            for client in self.clients() {
                self.push(&client.id, SessionEvent::ConnectionLost);
                self.push(
                    &client.id,
                    SessionEvent::StateChanged(ConnectionState::Disconnected),
                );
            }
            self.members.clear();
        } else if let Some(host) = self.host.clone() {
            self.push(&host, SessionEvent::DeviceLeft(id.to_string()));
        }
    }
}

/// Shared switchboard that sessions attach to
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<Hub>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach the hosting device
    pub fn host(&self, display_name: &str) -> Result<MemorySession, SessionError> {
        let mut hub = self.lock();
        if hub.host.is_some() {
            return Err(SessionError::InvalidState(ConnectionState::Hosting));
        }
        let mut device = DeviceInfo::new(display_name);
        device.is_host = true;
        hub.host = Some(device.id.clone());
        let seq = hub.next_seq;
        hub.next_seq += 1;
        hub.members.insert(seq, device.clone());
        hub.inboxes.insert(
            device.id.clone(),
            vec![SessionEvent::StateChanged(ConnectionState::Hosting)],
        );
        Ok(MemorySession {
            hub: self.clone(),
            device,
            advertised_players: None,
        })
    }

    /// Attach a client to the current host
    pub fn join(&self, display_name: &str) -> Result<MemorySession, SessionError> {
        let mut hub = self.lock();
        let Some(host_id) = hub.host.clone() else {
            return Err(SessionError::NotConnected);
        };
        let device = DeviceInfo::new(display_name);
        let host = hub
            .members
            .values()
            .find(|d| d.id == host_id)
            .cloned()
            .ok_or(SessionError::NotConnected)?;
        let seq = hub.next_seq;
        hub.next_seq += 1;
        hub.members.insert(seq, device.clone());
        hub.inboxes.insert(
            device.id.clone(),
            vec![
                SessionEvent::StateChanged(ConnectionState::Connected),
                SessionEvent::DeviceJoined(host),
            ],
        );
        hub.push(&host_id, SessionEvent::DeviceJoined(device.clone()));
        debug!("{} joined the hub", device.display_name);
        Ok(MemorySession {
            hub: self.clone(),
            device,
            advertised_players: None,
        })
    }

    /// Simulate a device vanishing without a goodbye
    pub fn drop_connection(&self, device_id: &str) {
        let mut hub = self.lock();
        if hub.contains(device_id) {
            hub.detach(device_id);
            hub.push(device_id, SessionEvent::ConnectionLost);
            hub.push(
                device_id,
                SessionEvent::StateChanged(ConnectionState::Disconnected),
            );
        }
    }
}

/// One device's attachment to a `MemoryHub`
pub struct MemorySession {
    hub: MemoryHub,
    device: DeviceInfo,
    advertised_players: Option<usize>,
}

impl MemorySession {
    /// Player count last published by a host
    pub fn advertised_player_count(&self) -> Option<usize> {
        self.advertised_players
    }

    fn deliver(&self, to: &str, message: &Message) -> Result<(), SessionError> {
        let mut hub = self.hub.lock();
        if !hub.contains(&self.device.id) {
            return Err(SessionError::NotConnected);
        }
        let from_host = hub.host.as_deref() == Some(self.device.id.as_str());
        let to_host = hub.host.as_deref() == Some(to);
        if !hub.contains(to) || (!from_host && !to_host) {
            return Err(SessionError::UnknownDevice(to.to_string()));
        }
        hub.push(
            to,
            SessionEvent::Message {
                from: self.device.id.clone(),
                message: message.clone(),
            },
        );
        Ok(())
    }
}

impl Session for MemorySession {
    fn local_device(&self) -> &DeviceInfo {
        &self.device
    }

    fn state(&self) -> ConnectionState {
        let hub = self.hub.lock();
        if !hub.contains(&self.device.id) {
            ConnectionState::Disconnected
        } else if hub.host.as_deref() == Some(self.device.id.as_str()) {
            ConnectionState::Hosting
        } else {
            ConnectionState::Connected
        }
    }

    fn send(&mut self, to: &str, message: &Message) -> Result<(), SessionError> {
        self.deliver(to, message)
    }

    fn broadcast(&mut self, message: &Message) -> Result<(), SessionError> {
        let targets: Vec<DeviceId> = {
            let hub = self.hub.lock();
            if !hub.contains(&self.device.id) {
                return Err(SessionError::NotConnected);
            }
            if hub.host.as_deref() == Some(self.device.id.as_str()) {
                hub.clients().into_iter().map(|d| d.id).collect()
            } else {
                hub.host.iter().cloned().collect()
            }
        };
        for to in targets {
            self.deliver(&to, message)?;
        }
        Ok(())
    }

    fn broadcast_except(&mut self, message: &Message, skip: &str) -> Result<(), SessionError> {
        if !self.is_host() {
            return Err(SessionError::InvalidState(self.state()));
        }
        let targets: Vec<DeviceId> = self
            .hub
            .lock()
            .clients()
            .into_iter()
            .map(|d| d.id)
            .filter(|id| id != skip)
            .collect();
        for to in targets {
            self.deliver(&to, message)?;
        }
        Ok(())
    }

    fn poll(&mut self) -> Vec<SessionEvent> {
        let mut hub = self.hub.lock();
        hub.inboxes
            .get_mut(&self.device.id)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    fn disconnect(&mut self) {
        let mut hub = self.hub.lock();
        if hub.contains(&self.device.id) {
            hub.detach(&self.device.id);
            hub.push(
                &self.device.id,
                SessionEvent::StateChanged(ConnectionState::Disconnected),
            );
        }
    }

    fn connected_devices(&self) -> Vec<DeviceInfo> {
        let hub = self.hub.lock();
        if !hub.contains(&self.device.id) {
            return Vec::new();
        }
        if hub.host.as_deref() == Some(self.device.id.as_str()) {
            hub.clients()
        } else {
            hub.members
                .values()
                .filter(|d| hub.host.as_ref() == Some(&d.id))
                .cloned()
                .collect()
        }
    }

    fn advertise_player_count(&mut self, player_count: usize) -> Result<(), SessionError> {
        if !self.is_host() {
            return Err(SessionError::InvalidState(self.state()));
        }
        self.advertised_players = Some(player_count);
        Ok(())
    }
}
