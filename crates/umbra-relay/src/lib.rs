//! Umbra development relay broker
//!
//! Implements the relay contract the core consumes: each client opens a
//! WebSocket to `/pair?token=<hex>`; the broker pairs exactly two clients
//! per token and forwards binary messages between them verbatim. Payloads
//! are opaque — handshakes and data frames pass through end to end and the
//! broker cannot decrypt anything.
//!
//! This is the test/dev harness, not a hardened production relay.

#![forbid(unsafe_code)]

pub mod config;
pub mod pairing;
pub mod websocket;

pub use config::RelayConfig;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A running relay broker
pub struct RelayServer {
    /// The bound listen address
    pub local_addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl RelayServer {
    /// Bind and start serving in the background
    pub async fn spawn(config: RelayConfig) -> anyhow::Result<Self> {
        let bind_addr: SocketAddr = config.bind_addr.parse()?;
        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let pair_timeout = Duration::from_secs(config.pair_timeout_secs);
        let state = Arc::new(websocket::AppState::new(config));
        let app = websocket::router(state.clone());

        let sweeper = {
            let state = state.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(pair_timeout / 2);
                loop {
                    interval.tick().await;
                    state.pairs.sweep(pair_timeout);
                }
            })
        };

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("relay server stopped: {}", e);
            }
        });

        info!(%local_addr, "relay broker listening");

        Ok(Self {
            local_addr,
            handle,
            sweeper,
        })
    }

    /// WebSocket base URL clients dial
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Stop serving
    pub fn shutdown(&self) {
        self.handle.abort();
        self.sweeper.abort();
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
