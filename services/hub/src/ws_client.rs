//! Gateway: WebSocket upgrade, identity derivation, per-connection loops.
//!
//! Each accepted socket splits into a reader (this task) and a writer task
//! that drains the connection's mailbox. Everything the hub sends (router
//! replies, scheduled fan-out, sweep closes) funnels through that mailbox,
//! so socket ownership never splits.

use crate::registry::Outbound;
use crate::router;
use crate::state::AppState;
use crate::ws_common::{close_socket, encode_bounded, error_frame, now_ms, offer, send_frame, server_frame};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use pulse_protocol::{
    close_codes, error_codes, ConnectedData, MessageType, ServerEvent, SUPPORTED_TYPES,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{info, warn};

const OUTBOUND_MAILBOX: usize = 256;

pub async fn ws_hub_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let identity = derive_identity(params.get("identity"), &headers, addr);
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

/// An explicit `identity` query parameter wins; otherwise the identity is a
/// digest of the peer address and user agent. The hub never interprets it.
fn derive_identity(explicit: Option<&String>, headers: &HeaderMap, addr: SocketAddr) -> String {
    if let Some(identity) = explicit {
        if !identity.is_empty() {
            return identity.clone();
        }
    }
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(addr.ip().to_string().as_bytes());
    hasher.update(user_agent.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

async fn handle_socket(mut socket: WebSocket, state: AppState, identity: String) {
    let (mailbox_tx, mailbox_rx) = mpsc::channel::<Outbound>(OUTBOUND_MAILBOX);
    let conn_id = match state.registry.register(&identity, mailbox_tx.clone()).await {
        Ok(id) => id,
        Err(e) => {
            warn!(identity = %identity, error = %e, "connection rejected");
            let reply = error_frame(error_codes::MAX_CONNECTIONS_EXCEEDED, &e.to_string());
            send_frame(&mut socket, &reply).await;
            close_socket(socket, close_codes::POLICY_VIOLATION, &e.to_string()).await;
            return;
        }
    };
    info!(connection_id = %conn_id, identity = %identity, "client connected");

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, mailbox_rx));

    send_greeting(&state, &conn_id, &mailbox_tx);

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => router::handle_text(&state, &conn_id, &text).await,
            Ok(Message::Ping(data)) => {
                state.registry.touch(&conn_id).await;
                let _ = mailbox_tx.try_send(Outbound::Pong(data));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(connection_id = %conn_id, error = %e, "socket error");
                break;
            }
        }
    }

    state.registry.unregister(&conn_id).await;
    drop(mailbox_tx);
    let _ = writer.await;
    info!(connection_id = %conn_id, "client disconnected");
}

fn send_greeting(state: &AppState, conn_id: &str, mailbox: &mpsc::Sender<Outbound>) {
    let data = serde_json::to_value(ConnectedData {
        connection_id: conn_id.to_owned(),
        server_time: now_ms(),
        supported_types: SUPPORTED_TYPES.to_vec(),
        heartbeat_interval: state.config.heartbeat.interval_ms,
        max_reconnect_attempts: state.config.limits.max_reconnect_attempts,
    })
    .unwrap_or(Value::Null);
    let frame = server_frame(MessageType::System, ServerEvent::Connected, data);
    if let Some(text) = encode_bounded(&frame, state.config.limits.max_message_size) {
        offer(conn_id, mailbox, text);
    }
}

/// Writer half: the only place this connection's socket is written. A close
/// command ends the loop; so does the last mailbox sender going away.
async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Outbound::Frame(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Outbound::Pong(data) => {
                if sink.send(Message::Pong(data)).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}
