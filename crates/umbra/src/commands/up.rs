//! Bring a tunnel up
//!
//! Without a platform NIC driver (out of scope for the core), `up` runs a
//! loopback probe: an in-memory NIC emits a small frame each second and
//! logs what the peer delivers, which exercises the full encrypted path.

use crate::cli::UpArgs;
use crate::commands::PeerBundle;
use crate::config::DaemonConfig;
use anyhow::{bail, Context};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use umbra_crypto::keys::Keystore;
use umbra_crypto::NodeId;
use umbra_net::transport::tls::{DirectListener, TlsIdentity};
use umbra_protocol::conn::{ConnectMode, Connection, ConnectionConfig, MeshListener};
use umbra_protocol::handshake::KeyRegistry;
use umbra_protocol::nic::{MemoryNic, MemoryNicHandle};
use umbra_protocol::node::{ConnectRequest, Node};

pub async fn run(args: UpArgs) -> anyhow::Result<()> {
    let store = Keystore::open(&args.keystore)?;
    let identity = Arc::new(
        store
            .load()
            .context("no identity found; run `umbra keygen` first")?,
    );
    info!(node = %identity.id(), "identity loaded");

    let bundle: PeerBundle = bincode::deserialize(
        &std::fs::read(&args.peer)
            .with_context(|| format!("reading peer bundle {}", args.peer.display()))?,
    )
    .context("peer bundle is not valid")?;
    let peer_id = NodeId(bundle.node_id);

    let mut config = match &args.config {
        Some(path) => DaemonConfig::load(path)?.connection_config(),
        None => ConnectionConfig::default(),
    };

    // Optional direct path for relay→direct migration
    if let Some(port) = args.direct_port {
        let tls_identity = TlsIdentity::generate()
            .map_err(|e| anyhow::anyhow!("direct-path certificate: {e}"))?;
        let listener = DirectListener::bind(([0, 0, 0, 0], port).into(), &tls_identity)
            .await
            .map_err(|e| anyhow::anyhow!("binding direct port {port}: {e}"))?;
        config.handshake.direct_endpoint = Some(listener.local_addr());
        config.handshake.direct_cert_der = Some(tls_identity.cert_der.as_ref().to_vec());
        config.direct_listener = Some(Arc::new(listener));
    }

    let registry = Arc::new(KeyRegistry::new());
    registry.insert(peer_id, bundle.key.clone());

    let (nic, nic_handle) = MemoryNic::new(config.handshake.mtu as usize);
    let node = Node::new(identity.clone(), config.clone());

    if let Some(listen_addr) = args.listen {
        let listener = MeshListener::bind(
            listen_addr,
            identity,
            registry,
            config,
            umbra_protocol::conn::listener::DEFAULT_MAX_CLIENTS,
        )
        .await?;
        info!(addr = %listener.local_addr(), "waiting for peer");

        let conn = listener.accept().await?;
        node.attach(conn, nic).await?;
    } else {
        let mode = match (&args.connect, &args.relay) {
            (Some(endpoint), None) => ConnectMode::Direct {
                endpoint: *endpoint,
            },
            (None, Some(broker)) => {
                let token = parse_token(args.token.as_deref().unwrap_or_default())?;
                if args.answer {
                    let conn = Connection::accept_via_relay(
                        identity, registry, broker, &token, config,
                    )
                    .await?;
                    node.attach(conn, nic).await?;
                    return supervise(node, nic_handle, args.status_interval).await;
                }
                ConnectMode::Relay {
                    broker: broker.clone(),
                    token,
                }
            }
            _ => bail!("pick one of --connect, --listen, or --relay"),
        };

        node.connect(
            ConnectRequest {
                peer_id,
                peer_key: bundle.key,
                mode,
            },
            nic,
        )
        .await?;
    }

    supervise(node, nic_handle, args.status_interval).await
}

/// Run the loopback probe until ctrl-c
async fn supervise(
    node: Node,
    mut nic_handle: MemoryNicHandle,
    status_interval: u64,
) -> anyhow::Result<()> {
    info!("tunnel up");

    let mut probe_timer = tokio::time::interval(Duration::from_secs(1));
    let mut status_timer = tokio::time::interval(Duration::from_secs(status_interval.max(1)));
    let mut probe_seq = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            _ = probe_timer.tick() => {
                probe_seq += 1;
                let _ = nic_handle
                    .inject(format!("umbra-probe {probe_seq}").into_bytes())
                    .await;
            }

            delivered = nic_handle.delivered() => {
                match delivered {
                    Some(frame) => {
                        info!(len = frame.len(), "frame from peer: {}",
                            String::from_utf8_lossy(&frame));
                    }
                    None => break,
                }
            }

            _ = status_timer.tick(), if status_interval > 0 => {
                let status = node.status().await;
                println!("{}", serde_json::to_string(&status)?);
            }
        }
    }

    info!("shutting down");
    let _ = node.disconnect().await;
    Ok(())
}

fn parse_token(hex: &str) -> anyhow::Result<[u8; 32]> {
    if hex.len() != 64 {
        bail!("--token must be 64 hex characters");
    }
    let mut token = [0u8; 32];
    for (i, byte) in token.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .context("--token must be hex")?;
    }
    Ok(token)
}
