//! UDP transport for peer messages.

use keel_core::PeerMessage;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Maximum datagram size (64KB is plenty for JSON frames).
const MAX_MSG_SIZE: usize = 65536;

/// Send half of the transport; cheap to clone across tasks.
#[derive(Clone)]
pub struct TransportSender {
    socket: Arc<UdpSocket>,
}

impl TransportSender {
    /// Send a message to a specific address.
    pub async fn send(&self, msg: &PeerMessage, addr: SocketAddr) -> Result<(), std::io::Error> {
        let bytes = msg
            .to_bytes()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        debug!("Sending {:?} to {}", msg, addr);
        self.socket.send_to(&bytes, addr).await?;
        Ok(())
    }

    /// Send a message to multiple addresses, skipping failures.
    pub async fn broadcast(&self, msg: &PeerMessage, addrs: &[SocketAddr]) -> Result<(), std::io::Error> {
        let bytes = msg
            .to_bytes()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        for addr in addrs {
            debug!("Broadcasting {:?} to {}", msg, addr);
            if let Err(e) = self.socket.send_to(&bytes, *addr).await {
                warn!("Failed to send to {}: {}", addr, e);
            }
        }
        Ok(())
    }
}

/// UDP transport for sending and receiving peer messages.
pub struct Transport {
    socket: Arc<UdpSocket>,
    incoming_tx: mpsc::Sender<(PeerMessage, SocketAddr)>,
    incoming_rx: mpsc::Receiver<(PeerMessage, SocketAddr)>,
}

impl Transport {
    /// Create a new transport bound to the specified port.
    pub async fn new(port: u16) -> Result<Self, std::io::Error> {
        let addr = format!("0.0.0.0:{}", port);
        let socket = UdpSocket::bind(&addr).await?;

        let (incoming_tx, incoming_rx) = mpsc::channel(256);

        Ok(Self {
            socket: Arc::new(socket),
            incoming_tx,
            incoming_rx,
        })
    }

    /// Get the local address this transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// A cloneable send half sharing this socket.
    pub fn sender(&self) -> TransportSender {
        TransportSender {
            socket: self.socket.clone(),
        }
    }

    /// Start receiving messages in the background.
    pub fn start_receive(&self) {
        let socket = self.socket.clone();
        let tx = self.incoming_tx.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_MSG_SIZE];

            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, src)) => match PeerMessage::from_bytes(&buf[..len]) {
                        Ok(msg) => {
                            debug!("Received {:?} from {}", msg, src);
                            if tx.send((msg, src)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse message from {}: {}", src, e);
                        }
                    },
                    Err(e) => {
                        error!("UDP receive error: {}", e);
                    }
                }
            }
        });
    }

    /// Receive the next incoming message.
    pub async fn recv(&mut self) -> Option<(PeerMessage, SocketAddr)> {
        self.incoming_rx.recv().await
    }
}
