//! Networking: mDNS discovery, TCP host/client, session lifecycle
//!
//! This module provides:
//! - mDNS-SD advertisement and browsing of hosted games on the local network
//! - TCP server for hosting (default port 55333 with auto-increment)
//! - TCP client for joining a discovered or manually entered host
//! - Length-prefixed JSON protocol for device messaging
//! - The `Session` abstraction over all of the above, plus an in-memory
//!   implementation for tests

pub mod client;
pub mod memory;
pub mod peer;
pub mod protocol;
pub mod server;
pub mod session;

pub use client::Client;
pub use memory::{MemoryHub, MemorySession};
pub use protocol::Message;
pub use server::{Server, ServerEvent};
pub use session::{ConnectionState, LanSession, Session, SessionEvent};

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::mpsc;
use std::thread;
use thiserror::Error;
use tracing::{debug, warn};

/// Farkle service type for mDNS discovery
pub const SERVICE_TYPE: &str = "_farkle._tcp.local.";

/// Current protocol version
pub const PROTOCOL_VERSION: &str = "1";

/// Device identifier, unique per running instance
pub type DeviceId = String;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("network I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("service discovery failed: {0}")]
    Discovery(#[from] mdns_sd::Error),

    #[error("not connected")]
    NotConnected,

    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("cannot do that while {0:?}")]
    InvalidState(ConnectionState),
}

/// Identity of a device taking part in a game
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub display_name: String,
    pub is_host: bool,
}

impl DeviceInfo {
    /// A fresh identity with a random id
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            id: new_device_id(),
            display_name: display_name.into(),
            is_host: false,
        }
    }

    /// A known identity, e.g. one persisted on this device
    pub fn with_id(id: impl Into<DeviceId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            is_host: false,
        }
    }
}

/// Generate a random device id
pub fn new_device_id() -> DeviceId {
    format!("farkle-{:08x}", rand::rng().random::<u32>())
}

/// What a host publishes about its game
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAdvertisement {
    pub game_id: String,
    pub display_name: String,
    pub player_count: usize,
}

/// A host found while browsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHost {
    pub device_id: DeviceId,
    pub display_name: String,
    pub game_id: String,
    pub player_count: usize,
    /// Protocol version they're running
    pub version: String,
    pub hostname: String,
    /// IPv4 first
    pub addresses: Vec<IpAddr>,
    pub port: u16,
}

impl DiscoveredHost {
    /// Socket addresses to try, in preference order
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        self.addresses
            .iter()
            .map(|ip| SocketAddr::new(*ip, self.port))
            .collect()
    }

    pub fn is_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

/// Events from the service discovery system
#[derive(Debug)]
pub enum DiscoveryEvent {
    HostDiscovered(DiscoveredHost),
    /// A host went offline
    HostLost(DeviceId),
}

/// Service discovery manager for finding hosted games on the local network
pub struct ServiceDiscovery {
    daemon: ServiceDaemon,
    our_device_id: DeviceId,
    registered_instance: Option<String>,
}

impl ServiceDiscovery {
    pub fn new(device_id: DeviceId) -> Result<Self, SessionError> {
        let daemon = ServiceDaemon::new()?;

        Ok(Self {
            daemon,
            our_device_id: device_id,
            registered_instance: None,
        })
    }

    /// Advertise a hosted game, replacing any earlier advertisement
    pub fn advertise(&mut self, ad: &HostAdvertisement, port: u16) -> Result<(), SessionError> {
        self.stop_advertising()?;

        let player_count = ad.player_count.to_string();
        let properties: [(&str, &str); 5] = [
            ("version", PROTOCOL_VERSION),
            ("device_id", &self.our_device_id),
            ("display_name", &ad.display_name),
            ("game_id", &ad.game_id),
            ("player_count", &player_count),
        ];

        // Instance name is the device id (must be unique on the network)
        let instance_name = &self.our_device_id;
        let hostname = format!("{}.local.", self.our_device_id);

        let service_info = ServiceInfo::new(
            SERVICE_TYPE,
            instance_name,
            &hostname,
            (),
            port,
            &properties[..],
        )?
        .enable_addr_auto();

        self.daemon.register(service_info)?;
        debug!("Advertising {} on port {}", ad.game_id, port);

        self.registered_instance = Some(instance_name.to_string());
        Ok(())
    }

    /// Stop advertising on the network
    pub fn stop_advertising(&mut self) -> Result<(), SessionError> {
        if let Some(instance_name) = self.registered_instance.take() {
            let fullname = format!("{}.{}", instance_name, SERVICE_TYPE);
            self.daemon.unregister(&fullname)?;
        }
        Ok(())
    }

    /// Start browsing for hosted games
    ///
    /// Returns a receiver that will emit DiscoveryEvents as hosts are found/lost
    pub fn browse(&self) -> Result<mpsc::Receiver<DiscoveryEvent>, SessionError> {
        let receiver = self.daemon.browse(SERVICE_TYPE)?;

        let (tx, rx) = mpsc::channel();
        let our_device_id = self.our_device_id.clone();

        thread::spawn(move || {
            while let Ok(event) = receiver.recv() {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let properties = info.get_properties();
                        let text = |key: &str| {
                            properties
                                .get_property_val_str(key)
                                .unwrap_or_default()
                                .to_string()
                        };

                        let device_id = text("device_id");
                        if device_id == our_device_id {
                            continue;
                        }

                        let player_count = text("player_count").parse().unwrap_or(0);
                        let mut version = text("version");
                        if version.is_empty() {
                            version = PROTOCOL_VERSION.to_string();
                        }

                        // IPv6 link-local addresses need a scope id that IpAddr
                        // doesn't carry, so prefer IPv4
                        let mut addresses: Vec<IpAddr> = info
                            .get_addresses()
                            .iter()
                            .map(|s| s.to_ip_addr())
                            .collect();
                        addresses.sort_by_key(|addr| match addr {
                            IpAddr::V4(_) => 0,
                            IpAddr::V6(_) => 1,
                        });

                        let host = DiscoveredHost {
                            device_id,
                            display_name: text("display_name"),
                            game_id: text("game_id"),
                            player_count,
                            version,
                            hostname: info.get_hostname().to_string(),
                            addresses,
                            port: info.get_port(),
                        };
                        if !host.is_compatible() {
                            warn!("{} runs protocol {}", host.display_name, host.version);
                        }

                        if tx.send(DiscoveryEvent::HostDiscovered(host)).is_err() {
                            break;
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        // fullname is "<device_id>._farkle._tcp.local."
                        if let Some(device_id) =
                            fullname.strip_suffix(&format!(".{}", SERVICE_TYPE))
                        {
                            if tx
                                .send(DiscoveryEvent::HostLost(device_id.to_string()))
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    _ => {}
                }
            }
        });

        Ok(rx)
    }

    /// Stop browsing for hosts
    pub fn stop_browsing(&self) -> Result<(), SessionError> {
        self.daemon.stop_browse(SERVICE_TYPE)?;
        Ok(())
    }

    /// Shutdown the discovery service
    pub fn shutdown(self) -> Result<(), SessionError> {
        self.daemon.shutdown()?;
        Ok(())
    }
}

/// Tracks discovered hosts
#[derive(Debug, Default)]
pub struct HostTracker {
    hosts: HashMap<DeviceId, DiscoveredHost>,
}

impl HostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a host
    pub fn update(&mut self, host: DiscoveredHost) {
        self.hosts.insert(host.device_id.clone(), host);
    }

    pub fn remove(&mut self, device_id: &str) -> Option<DiscoveredHost> {
        self.hosts.remove(device_id)
    }

    /// Known hosts, sorted by display name
    pub fn hosts(&self) -> Vec<&DiscoveredHost> {
        let mut hosts: Vec<_> = self.hosts.values().collect();
        hosts.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        hosts
    }

    pub fn get(&self, device_id: &str) -> Option<&DiscoveredHost> {
        self.hosts.get(device_id)
    }

    pub fn count(&self) -> usize {
        self.hosts.len()
    }

    pub fn clear(&mut self) {
        self.hosts.clear();
    }
}
