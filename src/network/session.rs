//! Connection lifecycle shared by LAN and in-memory transports

use super::client::Client;
use super::protocol::Message;
use super::server::{Server, ServerEvent, DEFAULT_PORT};
use super::{
    DeviceId, DeviceInfo, DiscoveredHost, DiscoveryEvent, HostAdvertisement, HostTracker,
    ServiceDiscovery, SessionError, PROTOCOL_VERSION,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Browsing,
    Connecting,
    Hosting,
    Connected,
}

/// Something that happened on a session since the last poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    HostDiscovered(DiscoveredHost),
    HostLost(DeviceId),
    /// A device joined (on the host), or the host accepted us (on a client)
    DeviceJoined(DeviceInfo),
    DeviceLeft(DeviceId),
    /// The connection to the host dropped
    ConnectionLost,
    ConnectFailed(String),
    Message { from: DeviceId, message: Message },
}

/// A device's view of the star network.
///
/// The host can address any connected device. A client can only reach the
/// host; its broadcasts go to the host, which relays as needed.
pub trait Session {
    fn local_device(&self) -> &DeviceInfo;

    fn state(&self) -> ConnectionState;

    fn is_host(&self) -> bool {
        self.state() == ConnectionState::Hosting
    }

    /// Send to one device
    fn send(&mut self, to: &str, message: &Message) -> Result<(), SessionError>;

    /// Send to every reachable device
    fn broadcast(&mut self, message: &Message) -> Result<(), SessionError>;

    /// Host only: send to every device except one
    fn broadcast_except(&mut self, message: &Message, skip: &str) -> Result<(), SessionError>;

    /// Drain events since the last poll
    fn poll(&mut self) -> Vec<SessionEvent>;

    /// Leave the game and close all connections
    fn disconnect(&mut self);

    /// Devices currently reachable from this one
    fn connected_devices(&self) -> Vec<DeviceInfo>;

    /// Host only: publish the game's player count to browsing devices
    fn advertise_player_count(&mut self, player_count: usize) -> Result<(), SessionError>;
}

enum Role {
    Idle,
    Host {
        server: Server,
        devices: HashMap<SocketAddr, DeviceInfo>,
        advertisement: HostAdvertisement,
    },
    Client {
        client: Client,
        host: Option<DeviceInfo>,
    },
}

/// Session over mDNS discovery and TCP
pub struct LanSession {
    device: DeviceInfo,
    state: ConnectionState,
    role: Role,
    discovery: Option<ServiceDiscovery>,
    browse_rx: Option<Receiver<DiscoveryEvent>>,
    hosts: HostTracker,
    connecting: Option<Receiver<io::Result<Client>>>,
    events: Vec<SessionEvent>,
}

impl LanSession {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self::with_device(DeviceInfo::new(display_name))
    }

    pub fn with_device(device: DeviceInfo) -> Self {
        Self {
            device,
            state: ConnectionState::Disconnected,
            role: Role::Idle,
            discovery: None,
            browse_rx: None,
            hosts: HostTracker::new(),
            connecting: None,
            events: Vec::new(),
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Session {:?} -> {:?}", self.state, state);
            self.state = state;
            self.events.push(SessionEvent::StateChanged(state));
        }
    }

    fn discovery(&mut self) -> Result<&mut ServiceDiscovery, SessionError> {
        if self.discovery.is_none() {
            self.discovery = Some(ServiceDiscovery::new(self.device.id.clone())?);
        }
        self.discovery.as_mut().ok_or(SessionError::NotConnected)
    }

    /// Start hosting on the default port range and advertise the game
    pub fn host(&mut self, advertisement: HostAdvertisement) -> Result<u16, SessionError> {
        self.host_on_port(advertisement, DEFAULT_PORT)
    }

    pub fn host_on_port(
        &mut self,
        advertisement: HostAdvertisement,
        port: u16,
    ) -> Result<u16, SessionError> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Browsing => {}
            other => return Err(SessionError::InvalidState(other)),
        }
        self.stop_browsing();

        let server = Server::start_on_port(port)?;
        let port = server.port();
        if let Err(e) = self.discovery().and_then(|d| d.advertise(&advertisement, port)) {
            // Manual connections still work without mDNS
            warn!("Could not advertise game: {}", e);
        }

        self.device.is_host = true;
        self.role = Role::Host {
            server,
            devices: HashMap::new(),
            advertisement,
        };
        self.set_state(ConnectionState::Hosting);
        info!("Hosting as {}", self.device.display_name);
        Ok(port)
    }

    /// Look for hosts on the local network
    pub fn browse(&mut self) -> Result<(), SessionError> {
        if self.state != ConnectionState::Disconnected {
            return Err(SessionError::InvalidState(self.state));
        }
        let rx = self.discovery()?.browse()?;
        self.browse_rx = Some(rx);
        self.set_state(ConnectionState::Browsing);
        Ok(())
    }

    fn stop_browsing(&mut self) {
        if self.browse_rx.take().is_some() {
            if let Some(discovery) = &self.discovery {
                let _ = discovery.stop_browsing();
            }
            self.hosts.clear();
        }
    }

    /// Hosts seen while browsing
    pub fn discovered_hosts(&self) -> Vec<&DiscoveredHost> {
        self.hosts.hosts()
    }

    /// Connect to a discovered host in the background
    pub fn connect(&mut self, host: &DiscoveredHost) -> Result<(), SessionError> {
        self.connect_addrs(host.socket_addrs())
    }

    /// Connect to explicit addresses in the background
    pub fn connect_addrs(&mut self, addrs: Vec<SocketAddr>) -> Result<(), SessionError> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Browsing => {}
            other => return Err(SessionError::InvalidState(other)),
        }
        let (tx, rx) = mpsc::channel();
        let device = self.device.clone();
        thread::spawn(move || {
            let _ = tx.send(Client::connect_any(&addrs, device));
        });
        self.connecting = Some(rx);
        self.set_state(ConnectionState::Connecting);
        Ok(())
    }

    fn poll_connecting(&mut self) {
        let Some(rx) = &self.connecting else {
            return;
        };
        let result = match rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Disconnected) => Err(io::Error::other("connect thread ended")),
        };
        self.connecting = None;

        match result.and_then(|mut client| client.join().map(|_| client)) {
            Ok(client) => {
                info!("Connected to {}", client.host_addr());
                self.stop_browsing();
                self.role = Role::Client { client, host: None };
                self.set_state(ConnectionState::Connected);
            }
            Err(e) => {
                warn!("Connect failed: {}", e);
                self.events.push(SessionEvent::ConnectFailed(e.to_string()));
                let fallback = if self.browse_rx.is_some() {
                    ConnectionState::Browsing
                } else {
                    ConnectionState::Disconnected
                };
                self.set_state(fallback);
            }
        }
    }

    fn poll_discovery(&mut self) {
        let Some(rx) = &self.browse_rx else {
            return;
        };
        let mut found = Vec::new();
        let mut closed = false;
        loop {
            match rx.try_recv() {
                Ok(event) => found.push(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    closed = true;
                    break;
                }
            }
        }
        if closed {
            self.browse_rx = None;
        }
        for event in found {
            match event {
                DiscoveryEvent::HostDiscovered(host) => {
                    self.hosts.update(host.clone());
                    self.events.push(SessionEvent::HostDiscovered(host));
                }
                DiscoveryEvent::HostLost(id) => {
                    if self.hosts.remove(&id).is_some() {
                        self.events.push(SessionEvent::HostLost(id));
                    }
                }
            }
        }
    }

    fn poll_host(&mut self) {
        let Role::Host {
            server, devices, ..
        } = &mut self.role
        else {
            return;
        };
        let host_device = self.device.clone();

        for event in server.poll() {
            match event {
                ServerEvent::PeerConnected { .. } => {}
                ServerEvent::MessageReceived {
                    from,
                    device_id,
                    message,
                } => match message {
                    Message::Hello { device, version } => {
                        if version != PROTOCOL_VERSION {
                            warn!("{} speaks protocol {}", device.display_name, version);
                        }
                        let welcome = Message::Welcome {
                            host: host_device.clone(),
                            devices: devices.values().cloned().collect(),
                        };
                        let _ = server.send_to(from, &welcome);
                        info!("{} joined", device.display_name);
                        devices.insert(from, device.clone());
                        self.events.push(SessionEvent::DeviceJoined(device));
                    }
                    Message::Ping => {
                        let _ = server.send_to(from, &Message::Pong);
                    }
                    Message::Leave { .. } => {}
                    message => match device_id {
                        Some(id) => self.events.push(SessionEvent::Message { from: id, message }),
                        None => debug!("Dropping message from unidentified peer {}", from),
                    },
                },
                ServerEvent::PeerDisconnected { addr, .. } => {
                    if let Some(device) = devices.remove(&addr) {
                        info!("{} left", device.display_name);
                        self.events.push(SessionEvent::DeviceLeft(device.id));
                    }
                }
            }
        }
    }

    fn poll_client(&mut self) {
        let Role::Client { client, host } = &mut self.role else {
            return;
        };
        let mut lost = false;
        for message in client.poll() {
            match message {
                Message::Welcome { host: device, .. } => {
                    *host = Some(device.clone());
                    self.events.push(SessionEvent::DeviceJoined(device));
                }
                Message::Ping => {
                    let _ = client.send(&Message::Pong);
                }
                Message::Leave { .. } => lost = true,
                message => {
                    let from = host.as_ref().map(|h| h.id.clone()).unwrap_or_default();
                    self.events.push(SessionEvent::Message { from, message });
                }
            }
        }
        if lost || !client.is_connected() {
            warn!("Lost connection to host");
            self.role = Role::Idle;
            self.events.push(SessionEvent::ConnectionLost);
            self.set_state(ConnectionState::Disconnected);
        }
    }
}

impl Session for LanSession {
    fn local_device(&self) -> &DeviceInfo {
        &self.device
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn send(&mut self, to: &str, message: &Message) -> Result<(), SessionError> {
        match &self.role {
            Role::Host { server, .. } => server
                .send_to_device(to, message)
                .map_err(|_| SessionError::UnknownDevice(to.to_string())),
            Role::Client { client, host } => {
                match host {
                    Some(h) if h.id != to => return Err(SessionError::UnknownDevice(to.to_string())),
                    _ => {}
                }
                Ok(client.send(message)?)
            }
            Role::Idle => Err(SessionError::NotConnected),
        }
    }

    fn broadcast(&mut self, message: &Message) -> Result<(), SessionError> {
        match &self.role {
            Role::Host { server, .. } => Ok(server.broadcast(message)?),
            Role::Client { client, .. } => Ok(client.send(message)?),
            Role::Idle => Err(SessionError::NotConnected),
        }
    }

    fn broadcast_except(&mut self, message: &Message, skip: &str) -> Result<(), SessionError> {
        match &self.role {
            Role::Host { server, .. } => Ok(server.broadcast_except(message, Some(skip))?),
            _ => Err(SessionError::InvalidState(self.state)),
        }
    }

    fn poll(&mut self) -> Vec<SessionEvent> {
        self.poll_connecting();
        self.poll_discovery();
        self.poll_host();
        self.poll_client();
        std::mem::take(&mut self.events)
    }

    fn disconnect(&mut self) {
        match std::mem::replace(&mut self.role, Role::Idle) {
            Role::Host { mut server, .. } => {
                let _ = server.broadcast(&Message::Leave {
                    device_id: self.device.id.clone(),
                });
                server.stop();
                if let Some(discovery) = &mut self.discovery {
                    let _ = discovery.stop_advertising();
                }
            }
            Role::Client { mut client, .. } => {
                let _ = client.leave();
                client.close();
            }
            Role::Idle => {}
        }
        self.stop_browsing();
        self.connecting = None;
        self.device.is_host = false;
        self.set_state(ConnectionState::Disconnected);
    }

    fn connected_devices(&self) -> Vec<DeviceInfo> {
        match &self.role {
            Role::Host { devices, .. } => devices.values().cloned().collect(),
            Role::Client { host, .. } => host.iter().cloned().collect(),
            Role::Idle => Vec::new(),
        }
    }

    fn advertise_player_count(&mut self, player_count: usize) -> Result<(), SessionError> {
        let (ad, port) = match &mut self.role {
            Role::Host {
                server,
                advertisement,
                ..
            } => {
                if advertisement.player_count == player_count {
                    return Ok(());
                }
                advertisement.player_count = player_count;
                (advertisement.clone(), server.port())
            }
            _ => return Err(SessionError::InvalidState(self.state)),
        };
        self.discovery()?.advertise(&ad, port)
    }
}

impl Drop for LanSession {
    fn drop(&mut self) {
        if self.state != ConnectionState::Disconnected {
            self.disconnect();
        }
        if let Some(discovery) = self.discovery.take() {
            let _ = discovery.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn ad() -> HostAdvertisement {
        HostAdvertisement {
            game_id: "g1".to_string(),
            display_name: "Host".to_string(),
            player_count: 2,
        }
    }

    fn poll_until<F: FnMut(&SessionEvent) -> bool>(
        session: &mut LanSession,
        mut pred: F,
    ) -> Vec<SessionEvent> {
        let start = Instant::now();
        let mut seen = Vec::new();
        while start.elapsed() < Duration::from_secs(5) {
            let events = session.poll();
            let hit = events.iter().any(&mut pred);
            seen.extend(events);
            if hit {
                return seen;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("condition not met; saw {:?}", seen);
    }

    #[test]
    fn test_host_and_client_over_loopback() {
        let mut host = LanSession::new("Host");
        let port = host.host_on_port(ad(), 55440).unwrap();
        assert_eq!(host.state(), ConnectionState::Hosting);
        assert!(host.local_device().is_host);

        let mut client = LanSession::new("Tablet");
        client
            .connect_addrs(vec![SocketAddr::from(([127, 0, 0, 1], port))])
            .unwrap();
        assert_eq!(client.state(), ConnectionState::Connecting);

        poll_until(&mut client, |e| {
            *e == SessionEvent::StateChanged(ConnectionState::Connected)
        });
        let client_id = client.local_device().id.clone();
        poll_until(&mut host, |e| {
            matches!(e, SessionEvent::DeviceJoined(d) if d.id == client_id)
        });
        poll_until(&mut client, |e| matches!(e, SessionEvent::DeviceJoined(d) if d.is_host));

        client.broadcast(&Message::Ping).unwrap();
        client
            .broadcast(&Message::TurnStarted {
                round: 1,
                player_id: 3,
            })
            .unwrap();
        let events = poll_until(&mut host, |e| matches!(e, SessionEvent::Message { .. }));
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Message { from, message: Message::TurnStarted { player_id: 3, .. } }
                if *from == client_id
        )));

        host.send(&client_id, &Message::Ping).unwrap();
        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        poll_until(&mut host, |e| *e == SessionEvent::DeviceLeft(client_id.clone()));
    }

    #[test]
    fn test_failed_connect_returns_to_disconnected() {
        let mut client = LanSession::new("Tablet");
        client
            .connect_addrs(vec![SocketAddr::from(([127, 0, 0, 1], 1))])
            .unwrap();
        let events = poll_until(&mut client, |e| matches!(e, SessionEvent::ConnectFailed(_)));
        assert!(events.contains(&SessionEvent::StateChanged(ConnectionState::Disconnected)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_client_sees_host_leave() {
        let mut host = LanSession::new("Host");
        let port = host.host_on_port(ad(), 55445).unwrap();
        let mut client = LanSession::new("Tablet");
        client
            .connect_addrs(vec![SocketAddr::from(([127, 0, 0, 1], port))])
            .unwrap();
        poll_until(&mut client, |e| {
            *e == SessionEvent::StateChanged(ConnectionState::Connected)
        });
        poll_until(&mut host, |e| matches!(e, SessionEvent::DeviceJoined(_)));

        host.disconnect();
        poll_until(&mut client, |e| *e == SessionEvent::ConnectionLost);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_idle_session_rejects_sends() {
        let mut session = LanSession::new("Solo");
        assert!(matches!(
            session.send("x", &Message::Ping),
            Err(SessionError::NotConnected)
        ));
        assert!(session.connected_devices().is_empty());
        assert!(matches!(
            session.advertise_player_count(3),
            Err(SessionError::InvalidState(ConnectionState::Disconnected))
        ));
    }
}
