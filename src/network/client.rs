//! TCP client for joining games

use super::peer::Peer;
use super::protocol::Message;
use super::server::DEFAULT_PORT;
use super::{DeviceInfo, PROTOCOL_VERSION};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// A connection from this device to a host
pub struct Client {
    /// Connection to the host
    peer: Peer,
    /// Our device identity
    device: DeviceInfo,
    /// Whether we've said hello
    joined: bool,
}

impl Client {
    /// Connect to a host at the given address
    ///
    /// The address can be:
    /// - "IP:PORT" (e.g., "192.168.1.100:55333")
    /// - "IP" (uses default port 55333)
    /// - "hostname:PORT"
    /// - "hostname" (uses default port)
    pub fn connect(addr: &str, device: DeviceInfo) -> io::Result<Self> {
        let socket_addr = parse_address(addr)?;
        Self::connect_addr(socket_addr, device)
    }

    /// Connect to a host at the given socket address
    pub fn connect_addr(addr: SocketAddr, device: DeviceInfo) -> io::Result<Self> {
        let peer = Peer::connect(addr)?;

        Ok(Client {
            peer,
            device,
            joined: false,
        })
    }

    /// Try each address in order until one connects
    pub fn connect_any(addrs: &[SocketAddr], device: DeviceInfo) -> io::Result<Self> {
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses to try");
        for addr in addrs {
            match Self::connect_addr(*addr, device.clone()) {
                Ok(client) => return Ok(client),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Introduce this device to the host
    pub fn join(&mut self) -> io::Result<()> {
        if self.joined {
            return Ok(());
        }
        self.peer.send(&Message::Hello {
            device: self.device.clone(),
            version: PROTOCOL_VERSION.to_string(),
        })?;
        self.joined = true;
        Ok(())
    }

    /// Send a message to the host
    pub fn send(&self, msg: &Message) -> io::Result<()> {
        self.peer.send(msg)
    }

    /// Send a leave message and disconnect
    pub fn leave(&mut self) -> io::Result<()> {
        let result = self.peer.send(&Message::Leave {
            device_id: self.device.id.clone(),
        });
        self.joined = false;
        result
    }

    /// Close the connection without saying goodbye
    pub fn close(&mut self) {
        self.peer.close();
    }

    /// Poll for incoming messages from the host
    pub fn poll(&mut self) -> Vec<Message> {
        self.peer.recv_all()
    }

    /// Check if still connected
    pub fn is_connected(&self) -> bool {
        self.peer.is_alive()
    }

    /// Get the host's address
    pub fn host_addr(&self) -> SocketAddr {
        self.peer.addr
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }
}

/// Parse an address string into a SocketAddr
///
/// Handles formats:
/// - "192.168.1.100:55333" -> parse directly
/// - "192.168.1.100" -> add default port
/// - "hostname:55333" -> resolve and use port
/// - "hostname" -> resolve and use default port
pub fn parse_address(addr: &str) -> io::Result<SocketAddr> {
    let with_port = if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{}:{}", addr, DEFAULT_PORT)
    };
    with_port
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "could not resolve address"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::server::{Server, ServerEvent};
    use std::thread;
    use std::time::Duration;

    fn device() -> DeviceInfo {
        DeviceInfo {
            id: "client-1".to_string(),
            display_name: "Tablet".to_string(),
            is_host: false,
        }
    }

    #[test]
    fn test_parse_address_with_port() {
        let addr = parse_address("127.0.0.1:55333").unwrap();
        assert_eq!(addr.port(), 55333);
    }

    #[test]
    fn test_parse_address_without_port() {
        let addr = parse_address("127.0.0.1").unwrap();
        assert_eq!(addr.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_client_connects_to_server() {
        let mut server = Server::start_on_port(55420).unwrap();
        let addr = format!("127.0.0.1:{}", server.port());

        let mut client = Client::connect(&addr, device()).unwrap();
        client.join().unwrap();

        thread::sleep(Duration::from_millis(200));
        let events = server.poll();

        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::PeerConnected { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::MessageReceived {
                message: Message::Hello { device, .. },
                ..
            } if device.display_name == "Tablet"
        )));
    }

    #[test]
    fn test_client_receives_broadcast() {
        let mut server = Server::start_on_port(55425).unwrap();
        let addr = format!("127.0.0.1:{}", server.port());

        let mut client = Client::connect(&addr, device()).unwrap();
        client.join().unwrap();

        thread::sleep(Duration::from_millis(200));
        server.poll();

        server
            .broadcast(&Message::AssignPlayer {
                player_id: 4,
                device_id: Some("client-1".to_string()),
            })
            .unwrap();

        thread::sleep(Duration::from_millis(200));
        let messages = client.poll();

        assert!(messages.iter().any(|m| matches!(
            m,
            Message::AssignPlayer { player_id: 4, device_id: Some(id) } if id == "client-1"
        )));
    }

    #[test]
    fn test_connect_any_tries_each_address() {
        let server = Server::start_on_port(55430).unwrap();
        let dead = SocketAddr::from(([127, 0, 0, 1], 1));
        let live = SocketAddr::from(([127, 0, 0, 1], server.port()));
        let client = Client::connect_any(&[dead, live], device()).unwrap();
        assert_eq!(client.host_addr(), live);
        assert!(Client::connect_any(&[], device()).is_err());
    }
}
