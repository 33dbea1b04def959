//! WebSocket transport over TCP and TLS streams
//!
//! One protocol message maps to one binary WebSocket frame, so the transport
//! preserves message boundaries without extra length framing. Buffers are
//! sized generously to absorb bursts without stalling TCP.

use crate::transport::{MessageTransport, MAX_TRANSPORT_MESSAGE, TRANSPORT_BUFFER_SIZE};
use crate::{NetworkError, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Timeout for establishing a WebSocket connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffer and size limits applied to every WebSocket stream
pub(crate) fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.write_buffer_size = TRANSPORT_BUFFER_SIZE;
    config.max_write_buffer_size = 2 * TRANSPORT_BUFFER_SIZE;
    config.max_message_size = Some(MAX_TRANSPORT_MESSAGE);
    config.max_frame_size = Some(MAX_TRANSPORT_MESSAGE);
    config
}

/// The concrete stream variants a WebSocket transport can run over
enum WsStream {
    /// Dialed over TCP (tungstenite wraps the TcpStream)
    Dialed(WebSocketStream<MaybeTlsStream<TcpStream>>),
    /// Accepted over TCP
    Accepted(WebSocketStream<TcpStream>),
    /// Dialed over pinned TLS
    DialedTls(Box<WebSocketStream<tokio_rustls::client::TlsStream<TcpStream>>>),
    /// Accepted over TLS
    AcceptedTls(Box<WebSocketStream<tokio_rustls::server::TlsStream<TcpStream>>>),
}

/// WebSocket message transport
pub struct WsTransport {
    stream: WsStream,
    remote: Option<SocketAddr>,
    descriptor: String,
}

impl WsTransport {
    /// Dial a plain WebSocket endpoint (`ws://host:port/path`)
    pub async fn dial(url: &str) -> Result<Self> {
        let (stream, _response) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config()), true),
        )
        .await
        .map_err(|_| NetworkError::Timeout)?
        .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;

        let remote = match stream.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
            _ => None,
        };

        debug!(url, "WebSocket dialed");

        Ok(Self {
            stream: WsStream::Dialed(stream),
            remote,
            descriptor: format!("ws ({})", url),
        })
    }

    /// Dial a peer by socket address on the mesh path
    pub async fn dial_addr(addr: SocketAddr) -> Result<Self> {
        Self::dial(&format!("ws://{}/mesh", addr)).await
    }

    /// Wrap an accepted, already-upgraded plain stream
    pub(crate) fn from_accepted(
        stream: WebSocketStream<TcpStream>,
        remote: SocketAddr,
    ) -> Self {
        Self {
            stream: WsStream::Accepted(stream),
            remote: Some(remote),
            descriptor: format!("ws-accepted ({})", remote),
        }
    }

    /// Wrap a dialed TLS stream (direct path)
    pub(crate) fn from_dialed_tls(
        stream: WebSocketStream<tokio_rustls::client::TlsStream<TcpStream>>,
        remote: SocketAddr,
    ) -> Self {
        Self {
            stream: WsStream::DialedTls(Box::new(stream)),
            remote: Some(remote),
            descriptor: format!("direct+tls ({})", remote),
        }
    }

    /// Wrap an accepted TLS stream (direct path)
    pub(crate) fn from_accepted_tls(
        stream: WebSocketStream<tokio_rustls::server::TlsStream<TcpStream>>,
        remote: SocketAddr,
    ) -> Self {
        Self {
            stream: WsStream::AcceptedTls(Box::new(stream)),
            remote: Some(remote),
            descriptor: format!("direct+tls ({})", remote),
        }
    }

    /// Override the human-readable descriptor (used by the relay client)
    pub fn set_descriptor(&mut self, descriptor: String) {
        self.descriptor = descriptor;
    }

    async fn send_msg(&mut self, msg: Message) -> Result<()> {
        let result = match &mut self.stream {
            WsStream::Dialed(s) => s.send(msg).await,
            WsStream::Accepted(s) => s.send(msg).await,
            WsStream::DialedTls(s) => s.send(msg).await,
            WsStream::AcceptedTls(s) => s.send(msg).await,
        };
        result.map_err(|e| NetworkError::WebSocket(e.to_string()))
    }

    async fn next_msg(&mut self) -> Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> {
        match &mut self.stream {
            WsStream::Dialed(s) => s.next().await,
            WsStream::Accepted(s) => s.next().await,
            WsStream::DialedTls(s) => s.next().await,
            WsStream::AcceptedTls(s) => s.next().await,
        }
    }
}

impl MessageTransport for WsTransport {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        self.send_msg(Message::Binary(data.to_vec())).await
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.next_msg().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                // Transport-level keepalives are invisible to the protocol
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "WebSocket closed by peer");
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    return Err(NetworkError::WebSocket(format!(
                        "unexpected non-binary frame: {:?}",
                        other
                    )))
                }
                Some(Err(e)) => return Err(NetworkError::WebSocket(e.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        let _ = match &mut self.stream {
            WsStream::Dialed(s) => s.close(None).await,
            WsStream::Accepted(s) => s.close(None).await,
            WsStream::DialedTls(s) => s.close().await,
            WsStream::AcceptedTls(s) => s.close().await,
        };
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn descriptor(&self) -> String {
        self.descriptor.clone()
    }
}

impl WsTransport {
    /// Split into independently owned write and read halves.
    ///
    /// The connection driver runs one write loop and one read loop per
    /// connection; each loop exclusively owns its half.
    pub fn split(self) -> (WsSink, WsSource) {
        let descriptor = self.descriptor;
        let remote = self.remote;

        let (sink, source) = match self.stream {
            WsStream::Dialed(s) => {
                let (tx, rx) = s.split();
                (SinkInner::Dialed(tx), SourceInner::Dialed(rx))
            }
            WsStream::Accepted(s) => {
                let (tx, rx) = s.split();
                (SinkInner::Accepted(tx), SourceInner::Accepted(rx))
            }
            WsStream::DialedTls(s) => {
                let (tx, rx) = (*s).split();
                (SinkInner::DialedTls(tx), SourceInner::DialedTls(rx))
            }
            WsStream::AcceptedTls(s) => {
                let (tx, rx) = (*s).split();
                (SinkInner::AcceptedTls(tx), SourceInner::AcceptedTls(rx))
            }
        };

        (
            WsSink {
                inner: sink,
                remote,
                descriptor: descriptor.clone(),
            },
            WsSource {
                inner: source,
                descriptor,
            },
        )
    }
}

enum SinkInner {
    Dialed(futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>),
    Accepted(futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>),
    DialedTls(
        futures::stream::SplitSink<
            WebSocketStream<tokio_rustls::client::TlsStream<TcpStream>>,
            Message,
        >,
    ),
    AcceptedTls(
        futures::stream::SplitSink<
            WebSocketStream<tokio_rustls::server::TlsStream<TcpStream>>,
            Message,
        >,
    ),
}

enum SourceInner {
    Dialed(futures::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>),
    Accepted(futures::stream::SplitStream<WebSocketStream<TcpStream>>),
    DialedTls(
        futures::stream::SplitStream<WebSocketStream<tokio_rustls::client::TlsStream<TcpStream>>>,
    ),
    AcceptedTls(
        futures::stream::SplitStream<WebSocketStream<tokio_rustls::server::TlsStream<TcpStream>>>,
    ),
}

/// Exclusively owned write half of a WebSocket transport
pub struct WsSink {
    inner: SinkInner,
    remote: Option<SocketAddr>,
    descriptor: String,
}

impl WsSink {
    /// Send one message to the peer
    pub async fn send(&mut self, data: Bytes) -> Result<()> {
        let msg = Message::Binary(data.to_vec());
        let result = match &mut self.inner {
            SinkInner::Dialed(s) => s.send(msg).await,
            SinkInner::Accepted(s) => s.send(msg).await,
            SinkInner::DialedTls(s) => s.send(msg).await,
            SinkInner::AcceptedTls(s) => s.send(msg).await,
        };
        result.map_err(|e| NetworkError::WebSocket(e.to_string()))
    }

    /// Close the write half, best-effort
    pub async fn close(&mut self) {
        let _ = match &mut self.inner {
            SinkInner::Dialed(s) => s.close().await,
            SinkInner::Accepted(s) => s.close().await,
            SinkInner::DialedTls(s) => s.close().await,
            SinkInner::AcceptedTls(s) => s.close().await,
        };
    }

    /// Remote socket address, if known
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Transport description for logging and status
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }
}

/// Exclusively owned read half of a WebSocket transport
pub struct WsSource {
    inner: SourceInner,
    descriptor: String,
}

impl WsSource {
    /// Receive one message from the peer (`None` on clean close)
    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        loop {
            let next = match &mut self.inner {
                SourceInner::Dialed(s) => s.next().await,
                SourceInner::Accepted(s) => s.next().await,
                SourceInner::DialedTls(s) => s.next().await,
                SourceInner::AcceptedTls(s) => s.next().await,
            };

            match next {
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "WebSocket closed by peer");
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    return Err(NetworkError::WebSocket(format!(
                        "unexpected non-binary frame: {:?}",
                        other
                    )))
                }
                Some(Err(e)) => return Err(NetworkError::WebSocket(e.to_string())),
                None => return Ok(None),
            }
        }
    }

    /// Transport description for logging and status
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }
}

/// WebSocket listener: TCP accept plus upgrade
pub struct WsListener {
    tcp: TcpListener,
    local_addr: SocketAddr,
}

impl WsListener {
    /// Bind a listener on the given address
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let tcp = TcpListener::bind(addr).await?;
        let local_addr = tcp.local_addr()?;

        debug!(%local_addr, "WebSocket listener bound");

        Ok(Self { tcp, local_addr })
    }

    /// The bound local address (useful when binding port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one incoming transport
    pub async fn accept(&self) -> Result<WsTransport> {
        let (tcp, remote) = self.tcp.accept().await?;
        tcp.set_nodelay(true)?;

        let ws = tokio_tungstenite::accept_async_with_config(tcp, Some(ws_config()))
            .await
            .map_err(|e| NetworkError::ConnectionFailed(format!("upgrade failed: {}", e)))?;

        debug!(%remote, "WebSocket accepted");

        Ok(WsTransport::from_accepted(ws, remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_accept_roundtrip() {
        let listener = WsListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr();

        let server = tokio::spawn(async move {
            let mut transport = listener.accept().await.unwrap();
            let got = transport.recv().await.unwrap().unwrap();
            transport.send(got).await.unwrap();
            transport.close().await;
        });

        let mut client = WsTransport::dial_addr(addr).await.unwrap();
        client.send(Bytes::from_static(b"ping")).await.unwrap();
        let echoed = client.recv().await.unwrap().unwrap();
        assert_eq!(&echoed[..], b"ping");

        // Peer close surfaces as clean end-of-stream
        assert!(client.recv().await.unwrap().is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_message_boundaries_preserved() {
        let listener = WsListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr();

        let server = tokio::spawn(async move {
            let mut transport = listener.accept().await.unwrap();
            let a = transport.recv().await.unwrap().unwrap();
            let b = transport.recv().await.unwrap().unwrap();
            (a, b)
        });

        let mut client = WsTransport::dial_addr(addr).await.unwrap();
        client.send(Bytes::from_static(b"first")).await.unwrap();
        client.send(Bytes::from_static(b"second")).await.unwrap();

        let (a, b) = server.await.unwrap();
        assert_eq!(&a[..], b"first");
        assert_eq!(&b[..], b"second");
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Port 1 should be closed
        let result = WsTransport::dial("ws://127.0.0.1:1/mesh").await;
        assert!(result.is_err());
    }
}
