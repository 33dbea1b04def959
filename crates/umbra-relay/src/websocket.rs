//! WebSocket endpoint
//!
//! `GET /pair?token=<64 hex chars>` upgrades to a WebSocket and joins the
//! pairing for that token. Binary messages are forwarded to the partner
//! verbatim. When pairing is impossible the broker answers with a framed
//! ERROR message (the one protocol message it is allowed to originate) and
//! closes.
//!
//! CORS is permissive: the broker only forwards ciphertext, and security
//! rests entirely on the end-to-end crypto.

use crate::pairing::{PairError, PairManager, PairToken};
use crate::RelayConfig;
use axum::{
    extract::ws::{Message as WsMsg, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use umbra_protocol::wire::messages::{error_code, ErrorMessage, Message};
use umbra_protocol::wire::codec;

/// Maximum WebSocket message size (matches the client transport bound)
const MAX_WS_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Shared broker state
pub struct AppState {
    /// Live pairings
    pub pairs: PairManager,
}

impl AppState {
    /// Build the state from a config
    pub fn new(config: RelayConfig) -> Self {
        Self {
            pairs: PairManager::new(config.max_pairs, config.pending_buffer),
        }
    }
}

/// Build the axum router
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/pair", get(pair_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct PairQuery {
    token: String,
}

/// Upgrade handler: parse the token, then hand the socket to the pump
async fn pair_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<PairQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let token = match parse_token(&query.token) {
        Some(token) => token,
        None => {
            return (StatusCode::BAD_REQUEST, "token must be 64 hex characters").into_response()
        }
    };

    ws.max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_client(socket, state, token))
        .into_response()
}

fn parse_token(hex: &str) -> Option<PairToken> {
    if hex.len() != 64 {
        return None;
    }
    let mut token = [0u8; 32];
    for (i, byte) in token.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(token)
}

/// Pump one client: join the pairing, then bridge both directions
async fn handle_client(socket: WebSocket, state: Arc<AppState>, token: PairToken) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (index, mut partner_rx) = match state.pairs.join(token) {
        Ok(joined) => joined,
        Err(e) => {
            warn!("pairing rejected: {}", e);
            let code = match e {
                PairError::Full | PairError::Busy => error_code::PAIRING_FAILED,
            };
            let reject = codec::encode(
                &Message::Error(ErrorMessage {
                    code,
                    message: e.to_string(),
                }),
                0,
                0,
            );
            let _ = ws_sink.send(WsMsg::Binary(Bytes::from(reject.to_vec()))).await;
            let _ = ws_sink.close().await;
            return;
        }
    };

    info!(peer = index, "client joined pairing");

    // Partner → this client
    let forward_out = async {
        while let Some(data) = partner_rx.recv().await {
            if ws_sink
                .send(WsMsg::Binary(Bytes::from(data.to_vec())))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = ws_sink.close().await;
    };

    // This client → partner
    let forward_in = async {
        while let Some(received) = ws_stream.next().await {
            match received {
                Ok(WsMsg::Binary(data)) => {
                    state
                        .pairs
                        .forward(&token, index, Bytes::from(data.to_vec()));
                }
                Ok(WsMsg::Ping(_)) | Ok(WsMsg::Pong(_)) => {}
                Ok(WsMsg::Close(_)) | Err(_) => break,
                Ok(other) => {
                    debug!("ignoring non-binary relay message: {:?}", other);
                }
            }
        }
    };

    // Either direction ending tears the client down; leaving removes the
    // pairing, which ends the partner's stream too
    tokio::select! {
        _ = forward_out => {}
        _ = forward_in => {}
    }

    state.pairs.leave(&token, index);
    debug!(peer = index, "client left pairing");
}
