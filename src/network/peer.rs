//! Peer connection handling

use super::protocol::Message;
use super::DeviceInfo;
use std::io::{self, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// A connected peer
pub struct Peer {
    /// Peer's address
    pub addr: SocketAddr,
    /// Peer's device identity (once it has said hello)
    pub device: Option<DeviceInfo>,
    /// Channel of encoded frames to write to this peer
    tx: Sender<Vec<u8>>,
    /// Channel to receive messages from this peer
    rx: Receiver<Message>,
    /// Handle used to close the socket and stop both threads
    stream: TcpStream,
    /// Whether the connection is still alive
    alive: bool,
}

impl Peer {
    /// Create a new peer from a TCP stream
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let addr = stream.peer_addr()?;

        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(Duration::from_secs(5)))?;

        let (outgoing_tx, outgoing_rx) = channel::<Vec<u8>>();
        let (incoming_tx, incoming_rx) = channel::<Message>();

        let mut write_stream = stream.try_clone()?;
        let mut read_stream = stream.try_clone()?;

        // Writer thread
        thread::spawn(move || {
            while let Ok(bytes) = outgoing_rx.recv() {
                if write_stream.write_all(&bytes).and_then(|_| write_stream.flush()).is_err() {
                    break;
                }
            }
            let _ = write_stream.shutdown(Shutdown::Both);
        });

        // Reader thread: blocks until a frame arrives or the socket closes
        thread::spawn(move || loop {
            match Message::read_from(&mut read_stream) {
                Ok(msg) => {
                    if incoming_tx.send(msg).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Peer {} read ended: {}", addr, e);
                    break;
                }
            }
        });

        Ok(Peer {
            addr,
            device: None,
            tx: outgoing_tx,
            rx: incoming_rx,
            stream,
            alive: true,
        })
    }

    /// Connect to a peer at the given address
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(5))?;
        Self::new(stream)
    }

    /// Send a message to this peer
    pub fn send(&self, msg: &Message) -> io::Result<()> {
        self.send_raw(msg.to_bytes()?)
    }

    /// Send an already-encoded frame
    pub fn send_raw(&self, bytes: Vec<u8>) -> io::Result<()> {
        self.tx
            .send(bytes)
            .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "peer disconnected"))
    }

    /// Try to receive a message from this peer (non-blocking)
    pub fn try_recv(&mut self) -> Option<Message> {
        match self.rx.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.alive = false;
                None
            }
        }
    }

    /// Receive all pending messages from this peer
    pub fn recv_all(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Some(msg) = self.try_recv() {
            messages.push(msg);
        }
        messages
    }

    /// Check if the peer connection is still alive
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device.as_ref().map(|d| d.id.as_str())
    }

    /// Record the identity sent in the peer's hello
    pub fn set_device(&mut self, device: DeviceInfo) {
        self.device = Some(device);
    }

    /// Close the connection
    pub fn close(&mut self) {
        self.alive = false;
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
