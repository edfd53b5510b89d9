//! TCP server for hosting games

use super::peer::Peer;
use super::protocol::Message;
use super::DeviceInfo;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Default port for Farkle hosts
pub const DEFAULT_PORT: u16 = 55333;

/// Maximum port to try when auto-incrementing
pub const MAX_PORT: u16 = 55433;

/// A game server that accepts device connections
pub struct Server {
    /// Local address the server is bound to
    addr: SocketAddr,
    /// Channel to receive new peer connections
    new_peers_rx: Receiver<Peer>,
    /// Connected peers
    peers: Vec<Peer>,
    /// Cleared to stop the acceptor thread
    accepting: Arc<AtomicBool>,
    /// Running flag
    running: bool,
}

impl Server {
    /// Start a new server on the default port with auto-increment
    pub fn start() -> io::Result<Self> {
        Self::start_on_port(DEFAULT_PORT)
    }

    /// Start a new server on a specific port with auto-increment fallback
    pub fn start_on_port(start_port: u16) -> io::Result<Self> {
        let mut port = start_port;
        let listener = loop {
            match TcpListener::bind(("0.0.0.0", port)) {
                Ok(l) => break l,
                Err(e) if e.kind() == io::ErrorKind::AddrInUse && port < MAX_PORT => {
                    port += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        info!("Hosting on port {}", addr.port());

        let (new_peers_tx, new_peers_rx) = channel();
        let accepting = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&accepting);

        thread::spawn(move || {
            accept_loop(listener, new_peers_tx, flag);
        });

        Ok(Server {
            addr,
            new_peers_rx,
            peers: Vec::new(),
            accepting,
            running: true,
        })
    }

    /// Get the address the server is listening on
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the port the server is listening on
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Poll for new connections and messages
    pub fn poll(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        loop {
            match self.new_peers_rx.try_recv() {
                Ok(peer) => {
                    debug!("Connection from {}", peer.addr);
                    events.push(ServerEvent::PeerConnected { addr: peer.addr });
                    self.peers.push(peer);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.running = false;
                    break;
                }
            }
        }

        let mut disconnected = Vec::new();
        for (i, peer) in self.peers.iter_mut().enumerate() {
            for msg in peer.recv_all() {
                if let Message::Hello { ref device, .. } = msg {
                    peer.set_device(device.clone());
                }
                let leaving = matches!(msg, Message::Leave { .. });
                events.push(ServerEvent::MessageReceived {
                    from: peer.addr,
                    device_id: peer.device_id().map(str::to_string),
                    message: msg,
                });
                if leaving {
                    peer.close();
                }
            }
            if !peer.is_alive() {
                disconnected.push(i);
            }
        }

        for i in disconnected.into_iter().rev() {
            let peer = self.peers.remove(i);
            events.push(ServerEvent::PeerDisconnected {
                addr: peer.addr,
                device_id: peer.device_id().map(str::to_string),
            });
        }

        events
    }

    /// Broadcast a message to all identified peers (serializes once)
    pub fn broadcast(&self, msg: &Message) -> io::Result<()> {
        self.broadcast_except(msg, None)
    }

    /// Broadcast to every identified peer other than `skip`
    pub fn broadcast_except(&self, msg: &Message, skip: Option<&str>) -> io::Result<()> {
        let bytes = msg.to_bytes()?;
        for peer in &self.peers {
            match peer.device_id() {
                Some(id) if Some(id) != skip => {
                    let _ = peer.send_raw(bytes.clone());
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Send a message to a specific peer by address
    pub fn send_to(&self, addr: SocketAddr, msg: &Message) -> io::Result<()> {
        match self.peers.iter().find(|p| p.addr == addr) {
            Some(peer) => peer.send(msg),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "peer not found")),
        }
    }

    /// Send a message to the peer that identified as `device_id`
    pub fn send_to_device(&self, device_id: &str, msg: &Message) -> io::Result<()> {
        match self.peers.iter().find(|p| p.device_id() == Some(device_id)) {
            Some(peer) => peer.send(msg),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "device not connected")),
        }
    }

    /// Get the number of connected peers
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Devices that have said hello
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.peers.iter().filter_map(|p| p.device.clone()).collect()
    }

    /// Check if the server is still running
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Stop the server
    pub fn stop(&mut self) {
        self.running = false;
        self.accepting.store(false, Ordering::Relaxed);
        self.peers.clear();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.accepting.store(false, Ordering::Relaxed);
    }
}

/// Events from the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new peer connected
    PeerConnected { addr: SocketAddr },
    /// A peer disconnected
    PeerDisconnected {
        addr: SocketAddr,
        device_id: Option<String>,
    },
    /// A message was received from a peer
    MessageReceived {
        from: SocketAddr,
        device_id: Option<String>,
        message: Message,
    },
}

fn accept_loop(listener: TcpListener, tx: Sender<Peer>, accepting: Arc<AtomicBool>) {
    while accepting.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if let Ok(peer) = Peer::new(stream) {
                    if tx.send(peer).is_err() {
                        break;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> DeviceInfo {
        DeviceInfo {
            id: id.to_string(),
            display_name: id.to_string(),
            is_host: false,
        }
    }

    #[test]
    fn test_server_starts_on_default_port() {
        let server = Server::start();
        assert!(server.is_ok());
        let server = server.unwrap();
        assert!(server.port() >= DEFAULT_PORT);
        assert!(server.port() <= MAX_PORT);
    }

    #[test]
    fn test_server_auto_increment_port() {
        let server1 = Server::start_on_port(55400).unwrap();
        let port1 = server1.port();

        let server2 = Server::start_on_port(port1).unwrap();
        let port2 = server2.port();

        assert_ne!(port1, port2);
        assert!(port2 > port1);
    }

    #[test]
    fn test_server_accepts_connection_and_hello() {
        let mut server = Server::start_on_port(55410).unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], server.port()));

        let client = Peer::connect(addr).unwrap();
        client
            .send(&Message::Hello {
                device: device("dev-1"),
                version: "1".to_string(),
            })
            .unwrap();

        thread::sleep(Duration::from_millis(200));
        let events = server.poll();

        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::PeerConnected { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::MessageReceived { device_id: Some(id), message: Message::Hello { .. }, .. }
                if id == "dev-1"
        )));
        assert_eq!(server.peer_count(), 1);
        assert_eq!(server.devices()[0].id, "dev-1");
    }

    #[test]
    fn test_broadcast_skips_unidentified_and_excluded() {
        let mut server = Server::start_on_port(55415).unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], server.port()));

        let mut a = Peer::connect(addr).unwrap();
        let mut b = Peer::connect(addr).unwrap();
        for (peer, id) in [(&a, "a"), (&b, "b")] {
            peer.send(&Message::Hello {
                device: device(id),
                version: "1".to_string(),
            })
            .unwrap();
        }
        thread::sleep(Duration::from_millis(200));
        server.poll();

        server.broadcast_except(&Message::Pong, Some("a")).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(a.recv_all().is_empty());
        assert_eq!(b.recv_all(), vec![Message::Pong]);
    }
}
