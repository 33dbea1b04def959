//! Router: glue between the virtual NIC and the session pipeline
//!
//! Two tasks per NIC: one reads frames from the device and feeds the
//! connection's outbound path, the other drains decrypted inbound frames to
//! the device. The router owns no session state — it holds a weak handle to
//! the connection and checks validity before each dispatch, so a closed
//! connection can be dropped without the router keeping it alive.

use crate::conn::Connection;
use crate::nic::VirtualNic;
use crate::{ProtocolError, Result};
use bytes::Bytes;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Frame pump between one NIC and one connection
pub struct Router {
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Router {
    /// Start the pump tasks
    ///
    /// Takes the connection's inbound receiver; a connection can be routed
    /// exactly once.
    pub fn spawn(nic: Arc<dyn VirtualNic>, conn: &Arc<Connection>) -> Result<Self> {
        let inbound = conn.take_inbound().ok_or_else(|| {
            ProtocolError::Violation("connection is already routed".to_string())
        })?;

        let cancel = CancellationToken::new();
        let weak: Weak<Connection> = Arc::downgrade(conn);

        let outbound_task = {
            let nic = nic.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                nic_to_session(nic, weak, cancel).await;
            })
        };

        let inbound_task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                session_to_nic(nic, inbound, cancel).await;
            })
        };

        Ok(Self {
            cancel,
            tasks: vec![outbound_task, inbound_task],
        })
    }

    /// Stop both pump tasks
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Outbound: device reads feed the encrypted pipeline
async fn nic_to_session(
    nic: Arc<dyn VirtualNic>,
    conn: Weak<Connection>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = nic.read_frame() => match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("nic read ended: {}", e);
                    break;
                }
            },
        };

        // The router holds no owning reference; a torn-down connection ends
        // the pump
        let conn = match conn.upgrade() {
            Some(conn) => conn,
            None => break,
        };

        match conn.send_frame(Bytes::from(frame)) {
            Ok(()) => {}
            Err(ProtocolError::SendBufferFull) => {
                // Backpressure: frame dropped, counter already incremented
            }
            Err(ProtocolError::Closed) => break,
            Err(e) => {
                warn!("outbound frame rejected: {}", e);
            }
        }
    }
}

/// Inbound: decrypted frames drain to the device
async fn session_to_nic(
    nic: Arc<dyn VirtualNic>,
    mut inbound: tokio::sync::mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = inbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if let Err(e) = nic.write_frame(&frame).await {
            debug!("nic write ended: {}", e);
            break;
        }
    }
}
