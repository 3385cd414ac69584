use anyhow::{Context, Result};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::net::UdpSocket;

/// Transport address of a peer. Opaque to the session layer except for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerAddress {
    Udp(SocketAddr),
    /// Connection handle of a BLE transport. Framing is up to that transport.
    Ble(u32),
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerAddress::Udp(a) => write!(f, "udp:{}", a),
            PeerAddress::Ble(h) => write!(f, "ble:{}", h),
        }
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(a: SocketAddr) -> Self {
        PeerAddress::Udp(a)
    }
}

/// Outgoing side of a transport. Must not block; a full socket buffer is an error.
pub trait TransportSend: Send + Sync {
    fn send(&self, peer: &PeerAddress, data: &[u8]) -> std::io::Result<()>;
}

/// Transport specific resource held by a handshake, e.g. a BLE connection.
pub trait RendezvousConnection: Send {
    fn close(&mut self);
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub async fn bind(local: &str) -> Result<Self> {
        let socket = UdpSocket::bind(local)
            .await
            .context(format!("binding udp socket to {}", local))?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }
}

impl TransportSend for UdpTransport {
    fn send(&self, peer: &PeerAddress, data: &[u8]) -> std::io::Result<()> {
        match peer {
            PeerAddress::Udp(addr) => {
                self.socket.try_send_to(data, *addr)?;
                Ok(())
            }
            PeerAddress::Ble(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "udp transport can't reach ble peer",
            )),
        }
    }
}

/// Collects datagrams instead of sending them. Used to wire session managers together
/// without sockets.
#[derive(Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<(PeerAddress, Vec<u8>)>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take_sent(&self) -> Vec<(PeerAddress, Vec<u8>)> {
        match self.sent.lock() {
            Ok(mut sent) => std::mem::take(&mut *sent),
            Err(_) => Vec::new(),
        }
    }

    /// Makes every following send fail, as a full socket would.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::Relaxed);
    }
}

impl TransportSend for MemoryTransport {
    fn send(&self, peer: &PeerAddress, data: &[u8]) -> std::io::Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "send buffer full",
            ));
        }
        self.sent
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "lock poisoned"))?
            .push((*peer, data.to_vec()));
        Ok(())
    }
}
