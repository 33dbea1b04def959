//! End-to-end tests through the relay broker: pairing, tunneling, and
//! relay→direct migration with its symmetric-NAT fallback.

use std::sync::Arc;
use std::time::Duration;
use umbra_crypto::IdentityKeyPair;
use umbra_net::transport::tls::{DirectListener, TlsIdentity};
use umbra_protocol::conn::{
    ConnState, ConnectMode, Connection, ConnectionConfig, MigrationConfig, PeerConfig,
};
use umbra_protocol::handshake::{HandshakeConfig, KeyRegistry};
use umbra_protocol::nic::MemoryNic;
use umbra_protocol::router::Router;
use umbra_relay::{RelayConfig, RelayServer};

const MTU: usize = 1380;

struct Mesh {
    a_identity: Arc<IdentityKeyPair>,
    b_identity: Arc<IdentityKeyPair>,
    registry: Arc<KeyRegistry>,
}

fn mesh() -> Mesh {
    let a_identity = Arc::new(IdentityKeyPair::generate());
    let b_identity = Arc::new(IdentityKeyPair::generate());
    let registry = Arc::new(KeyRegistry::new());
    registry.insert(a_identity.id(), a_identity.signer().public_key());
    registry.insert(b_identity.id(), b_identity.signer().public_key());
    Mesh {
        a_identity,
        b_identity,
        registry,
    }
}

async fn broker() -> RelayServer {
    RelayServer::spawn(RelayConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..Default::default()
    })
    .await
    .unwrap()
}

/// Establish A↔B through the broker; B answers the handshake
async fn establish_via_relay(
    mesh: &Mesh,
    broker_url: &str,
    token: [u8; 32],
    config_a: ConnectionConfig,
    config_b: ConnectionConfig,
) -> (Arc<Connection>, Arc<Connection>) {
    let b_identity = mesh.b_identity.clone();
    let registry = mesh.registry.clone();
    let url = broker_url.to_string();

    let b_side = tokio::spawn(async move {
        Connection::accept_via_relay(b_identity, registry, &url, &token, config_b).await
    });

    // Give B a moment to join the pairing first
    tokio::time::sleep(Duration::from_millis(100)).await;

    let conn_a = Connection::dial(
        mesh.a_identity.clone(),
        PeerConfig {
            peer_id: mesh.b_identity.id(),
            peer_key: mesh.b_identity.signer().public_key(),
            mode: ConnectMode::Relay {
                broker: broker_url.to_string(),
                token,
            },
        },
        config_a,
    )
    .await
    .unwrap();

    let conn_b = b_side.await.unwrap().unwrap();
    (conn_a, conn_b)
}

#[tokio::test]
async fn relay_pairs_and_tunnels() {
    let mesh = mesh();
    let broker = broker().await;

    let config = ConnectionConfig::default();
    let (conn_a, conn_b) = establish_via_relay(
        &mesh,
        &broker.url(),
        [0x11; 32],
        config.clone(),
        config,
    )
    .await;

    assert_eq!(conn_a.state(), ConnState::Established);
    assert!(conn_a.status().transport.contains("relay"));

    let (nic_a, handle_a) = MemoryNic::new(MTU);
    let (nic_b, mut handle_b) = MemoryNic::new(MTU);
    let router_a = Router::spawn(nic_a, &conn_a).unwrap();
    let router_b = Router::spawn(nic_b, &conn_b).unwrap();

    handle_a.inject(b"through the broker".to_vec()).await.unwrap();
    let delivered = handle_b
        .delivered_timeout(Duration::from_secs(5))
        .await
        .expect("frame should cross the relay");
    assert_eq!(delivered, b"through the broker");

    router_a.shutdown().await;
    router_b.shutdown().await;
    conn_a.close().await;
    conn_b.close().await;
}

/// Scenario: both peers meet at the relay, then migrate to a pinned-TLS
/// direct transport with no frame loss and no reordering
#[tokio::test]
async fn migration_to_direct_without_loss() {
    let mesh = mesh();
    let broker = broker().await;

    // B owns a direct path: TLS identity + bound listener, advertised in
    // its ESTABLISHED
    let tls_identity = TlsIdentity::generate().unwrap();
    let direct_listener = Arc::new(
        DirectListener::bind("127.0.0.1:0".parse().unwrap(), &tls_identity)
            .await
            .unwrap(),
    );

    let config_b = ConnectionConfig {
        handshake: HandshakeConfig {
            direct_endpoint: Some(direct_listener.local_addr()),
            direct_cert_der: Some(tls_identity.cert_der.as_ref().to_vec()),
            ..Default::default()
        },
        direct_listener: Some(direct_listener),
        ..Default::default()
    };
    let config_a = ConnectionConfig::default();

    let (conn_a, conn_b) =
        establish_via_relay(&mesh, &broker.url(), [0x22; 32], config_a, config_b).await;

    let (nic_a, handle_a) = MemoryNic::new(MTU);
    let (nic_b, mut handle_b) = MemoryNic::new(MTU);
    let router_a = Router::spawn(nic_a, &conn_a).unwrap();
    let router_b = Router::spawn(nic_b, &conn_b).unwrap();

    // A streams one frame every 10 ms across the switchover window
    const FRAMES: u32 = 200;
    let sender = tokio::spawn(async move {
        for i in 0..FRAMES {
            handle_a
                .inject(format!("frame-{:04}", i).into_bytes())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle_a
    });

    // Every frame arrives exactly once, in counter order
    for i in 0..FRAMES {
        let delivered = handle_b
            .delivered_timeout(Duration::from_secs(5))
            .await
            .unwrap_or_else(|| panic!("frame {} lost during migration", i));
        assert_eq!(delivered, format!("frame-{:04}", i).into_bytes());
    }
    let _handle_a = sender.await.unwrap();

    // The switch happened: A now reports a direct transport
    let status = conn_a.status();
    assert!(
        status.transport.contains("direct"),
        "expected direct transport, got {}",
        status.transport
    );
    assert_eq!(conn_b.status().stats.decrypt_errors, 0);
    assert_eq!(conn_b.status().stats.replay_drops, 0);

    router_a.shutdown().await;
    router_b.shutdown().await;
    conn_a.close().await;
    conn_b.close().await;
}

/// Scenario: the advertised direct endpoint is unreachable; the attempt
/// times out and relay remains the transport with no loss
#[tokio::test]
async fn migration_failure_falls_back_to_relay() {
    let mesh = mesh();
    let broker = broker().await;

    // Reserve a port, then free it: the advertised endpoint refuses dials
    let dead_endpoint = {
        let socket = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        socket.local_addr().unwrap()
    };
    let tls_identity = TlsIdentity::generate().unwrap();

    let config_b = ConnectionConfig {
        handshake: HandshakeConfig {
            direct_endpoint: Some(dead_endpoint),
            direct_cert_der: Some(tls_identity.cert_der.as_ref().to_vec()),
            ..Default::default()
        },
        // No direct listener: B advertises a path it cannot serve
        ..Default::default()
    };
    let config_a = ConnectionConfig {
        migration: MigrationConfig {
            enabled: true,
            attempt_timeout: Duration::from_millis(500),
            cooldown: Duration::from_secs(60),
        },
        ..Default::default()
    };

    let (conn_a, conn_b) =
        establish_via_relay(&mesh, &broker.url(), [0x33; 32], config_a, config_b).await;

    let (nic_a, handle_a) = MemoryNic::new(MTU);
    let (nic_b, mut handle_b) = MemoryNic::new(MTU);
    let router_a = Router::spawn(nic_a, &conn_a).unwrap();
    let router_b = Router::spawn(nic_b, &conn_b).unwrap();

    // Traffic spans the failed attempt (initial delay + timeout)
    for i in 0..30u32 {
        handle_a
            .inject(format!("frame-{}", i).into_bytes())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for i in 0..30u32 {
        let delivered = handle_b
            .delivered_timeout(Duration::from_secs(5))
            .await
            .unwrap_or_else(|| panic!("frame {} lost during failed migration", i));
        assert_eq!(delivered, format!("frame-{}", i).into_bytes());
    }

    // Still on the relay, still established
    let status = conn_a.status();
    assert_eq!(status.state, ConnState::Established);
    assert!(
        status.transport.contains("relay"),
        "expected relay transport, got {}",
        status.transport
    );

    router_a.shutdown().await;
    router_b.shutdown().await;
    conn_a.close().await;
    conn_b.close().await;
}

#[tokio::test]
async fn third_peer_is_rejected() {
    let mesh = mesh();
    let broker = broker().await;
    let token = [0x44; 32];

    let config = ConnectionConfig::default();
    let (conn_a, conn_b) =
        establish_via_relay(&mesh, &broker.url(), token, config.clone(), config.clone()).await;

    // A third client presenting the same token cannot pair
    let result = Connection::dial(
        mesh.a_identity.clone(),
        PeerConfig {
            peer_id: mesh.b_identity.id(),
            peer_key: mesh.b_identity.signer().public_key(),
            mode: ConnectMode::Relay {
                broker: broker.url(),
                token,
            },
        },
        ConnectionConfig {
            backoff: umbra_net::BackoffConfig {
                max_attempts: 0,
                ..Default::default()
            },
            ..Default::default()
        },
    )
    .await;
    assert!(result.is_err());

    conn_a.close().await;
    conn_b.close().await;
}
