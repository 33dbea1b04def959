//! Virtual NIC contract
//!
//! The NIC driver itself lives outside the core. The core consumes an open
//! device: an MTU, a blocking read returning one complete frame, a write
//! accepting one complete frame, and a close. Frame contents (Ethernet vs
//! IP) are opaque; everything is encrypted as a byte string.
//!
//! [`MemoryNic`] is the in-memory implementation used by loopback mode and
//! the test suite.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// An open virtual network device
#[async_trait]
pub trait VirtualNic: Send + Sync {
    /// Maximum frame size in bytes
    fn mtu(&self) -> usize;

    /// Read one complete frame (≤ MTU); blocks until one is available
    async fn read_frame(&self) -> io::Result<Vec<u8>>;

    /// Write one complete frame (≤ MTU)
    async fn write_frame(&self, frame: &[u8]) -> io::Result<()>;

    /// Close the device
    async fn close(&self);
}

/// In-memory NIC backed by channels
///
/// The host side injects frames through the [`MemoryNicHandle`] and
/// observes frames the core writes back.
pub struct MemoryNic {
    mtu: usize,
    ingress: Mutex<mpsc::Receiver<Vec<u8>>>,
    egress: mpsc::Sender<Vec<u8>>,
}

/// Host-side handle to a [`MemoryNic`]
pub struct MemoryNicHandle {
    inject_tx: mpsc::Sender<Vec<u8>>,
    delivered_rx: mpsc::Receiver<Vec<u8>>,
}

impl MemoryNic {
    /// Create a memory NIC and its host-side handle
    pub fn new(mtu: usize) -> (Arc<Self>, MemoryNicHandle) {
        let (inject_tx, ingress) = mpsc::channel(256);
        let (egress, delivered_rx) = mpsc::channel(256);

        (
            Arc::new(Self {
                mtu,
                ingress: Mutex::new(ingress),
                egress,
            }),
            MemoryNicHandle {
                inject_tx,
                delivered_rx,
            },
        )
    }
}

#[async_trait]
impl VirtualNic for MemoryNic {
    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn read_frame(&self) -> io::Result<Vec<u8>> {
        self.ingress
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "nic closed"))
    }

    async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        if frame.len() > self.mtu {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds MTU {}", frame.len(), self.mtu),
            ));
        }
        self.egress
            .send(frame.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "nic closed"))
    }

    async fn close(&self) {
        self.ingress.lock().await.close();
    }
}

impl MemoryNicHandle {
    /// Inject a frame as if the host wrote it to the device
    pub async fn inject(&self, frame: Vec<u8>) -> io::Result<()> {
        self.inject_tx
            .send(frame)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "nic closed"))
    }

    /// Next frame the core delivered to the device
    pub async fn delivered(&mut self) -> Option<Vec<u8>> {
        self.delivered_rx.recv().await
    }

    /// Next delivered frame, or `None` after the timeout
    pub async fn delivered_timeout(
        &mut self,
        timeout: std::time::Duration,
    ) -> Option<Vec<u8>> {
        tokio::time::timeout(timeout, self.delivered_rx.recv())
            .await
            .ok()
            .flatten()
    }
}
