//! Inbound frame pipeline: decode, validate, dispatch.
//!
//! The router holds no state of its own. It mutates the registry, enqueues
//! nothing on its own behalf, and answers every frame through the
//! connection's mailbox. Bad frames get a typed `error` reply; the
//! connection stays open.

use crate::registry::ConnectionId;
use crate::state::AppState;
use crate::ws_common::{encode_bounded, error_frame, now_ms, offer, server_frame};
use pulse_protocol::{
    decode, error_codes, parse_history_request, parse_subscription, ClientAction, ClientFrame,
    HistoryData, MessageType, PongData, ServerEvent, ServerFrame, SubscriptionData,
};
use serde_json::Value;
use std::sync::atomic::Ordering;
use tracing::{debug, error, warn};

/// Handle one inbound text frame from an accepted connection.
pub async fn handle_text(state: &AppState, conn_id: &ConnectionId, text: &str) {
    state.request_counter.fetch_add(1, Ordering::Relaxed);

    let frame = match decode(text).and_then(|raw| raw.validate_client()) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connection_id = %conn_id, error = %e, "rejecting invalid frame");
            reply(state, conn_id, error_frame(e.code(), &e.to_string())).await;
            return;
        }
    };

    // The connection may have raced with a close; if it no longer resolves,
    // drop the frame silently.
    if !state.registry.contains(conn_id).await {
        debug!(connection_id = %conn_id, "frame from unregistered connection dropped");
        return;
    }

    match frame.action {
        ClientAction::Subscribe => handle_subscribe(state, conn_id, &frame).await,
        ClientAction::Unsubscribe => handle_unsubscribe(state, conn_id, &frame).await,
        ClientAction::Ping => handle_ping(state, conn_id).await,
        ClientAction::GetHistory => handle_get_history(state, conn_id, &frame).await,
        ClientAction::Ack => {
            debug!(connection_id = %conn_id, frame_id = %frame.id, "ack received");
        }
    }
}

/// Replace the subscription set (last-write-wins) and confirm the accepted
/// types. Reserved entries are filtered before the set reaches the registry.
async fn handle_subscribe(state: &AppState, conn_id: &ConnectionId, frame: &ClientFrame) {
    let types = match parse_subscription(frame.payload.as_ref()) {
        Ok(types) => types,
        Err(e) => {
            reply(state, conn_id, error_frame(e.code(), &e.to_string())).await;
            return;
        }
    };
    state.registry.set_subscriptions(conn_id, &types).await;
    let data = subscription_data(&types);
    reply(
        state,
        conn_id,
        server_frame(frame.kind, ServerEvent::Subscribed, data),
    )
    .await;
}

/// Remove each named type and ack the requested set. Idempotent: unknown or
/// unsubscribed entries are acked all the same.
async fn handle_unsubscribe(state: &AppState, conn_id: &ConnectionId, frame: &ClientFrame) {
    let requested = lenient_types(frame.payload.as_ref());
    for kind in &requested {
        state.registry.remove_subscription(conn_id, *kind).await;
    }
    let data = subscription_data(&requested);
    reply(
        state,
        conn_id,
        server_frame(frame.kind, ServerEvent::Unsubscribed, data),
    )
    .await;
}

async fn handle_ping(state: &AppState, conn_id: &ConnectionId) {
    state.registry.touch(conn_id).await;
    let data = serde_json::to_value(PongData { server_time: now_ms() }).unwrap_or(Value::Null);
    reply(
        state,
        conn_id,
        server_frame(MessageType::System, ServerEvent::Pong, data),
    )
    .await;
}

/// Resolve recent history through the provider, bounding its failures to an
/// `INTERNAL_ERROR` reply.
async fn handle_get_history(state: &AppState, conn_id: &ConnectionId, frame: &ClientFrame) {
    let (kind, limit) = match parse_history_request(
        frame.payload.as_ref(),
        state.config.history.default_limit,
        state.config.history.max_limit,
    ) {
        Ok(request) => request,
        Err(e) => {
            reply(state, conn_id, error_frame(e.code(), &e.to_string())).await;
            return;
        }
    };
    match state.history_provider.fetch(kind, limit) {
        Ok(slice) => {
            let data = serde_json::to_value(HistoryData {
                kind,
                limit,
                total: slice.total,
                items: slice.items,
            })
            .unwrap_or(Value::Null);
            reply(
                state,
                conn_id,
                server_frame(kind, ServerEvent::HistoryData, data),
            )
            .await;
        }
        Err(e) => {
            error!(connection_id = %conn_id, error = %e, "history provider failed");
            reply(
                state,
                conn_id,
                error_frame(error_codes::INTERNAL_ERROR, "history lookup failed"),
            )
            .await;
        }
    }
}

/// Parse a `types` list without failing: unknown entries and the reserved
/// type are dropped, a missing or malformed list is empty.
fn lenient_types(payload: Option<&Value>) -> Vec<MessageType> {
    let mut types = Vec::new();
    let Some(entries) = payload.and_then(|p| p.get("types")).and_then(Value::as_array) else {
        return types;
    };
    for entry in entries {
        if let Ok(kind) = serde_json::from_value::<MessageType>(entry.clone()) {
            if !kind.is_reserved() && !types.contains(&kind) {
                types.push(kind);
            }
        }
    }
    types
}

fn subscription_data(types: &[MessageType]) -> Value {
    serde_json::to_value(SubscriptionData { types: types.to_vec() }).unwrap_or(Value::Null)
}

/// Queue a reply on the connection's mailbox, honoring the outbound size cap.
async fn reply(state: &AppState, conn_id: &ConnectionId, frame: ServerFrame) {
    let Some(mailbox) = state.registry.mailbox(conn_id).await else {
        debug!(connection_id = %conn_id, "reply target already unregistered");
        return;
    };
    let Some(text) = encode_bounded(&frame, state.config.limits.max_message_size) else {
        return;
    };
    offer(conn_id, &mailbox, text);
}
