//! Shared frame construction and delivery helpers for the WS surface.

use crate::registry::Outbound;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use pulse_protocol::{encode, Direction, ErrorData, MessageType, ServerEvent, ServerFrame};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Build a server envelope with a fresh id and current timestamp.
pub fn server_frame(kind: MessageType, event: ServerEvent, data: Value) -> ServerFrame {
    ServerFrame {
        id: Uuid::new_v4().to_string(),
        kind,
        timestamp: now_ms(),
        direction: Direction::ServerToClient,
        event,
        data,
    }
}

pub fn error_frame(code: &str, message: &str) -> ServerFrame {
    let data = serde_json::to_value(ErrorData {
        code: code.to_owned(),
        message: message.to_owned(),
    })
    .unwrap_or(Value::Null);
    server_frame(MessageType::Error, ServerEvent::Error, data)
}

/// Serialize an outbound frame, enforcing the outbound size cap. Oversized
/// frames are dropped with a warning rather than written to any socket.
pub fn encode_bounded(frame: &ServerFrame, max_size: usize) -> Option<String> {
    let text = match encode(frame) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, event = ?frame.event, "failed to serialize outbound frame");
            return None;
        }
    };
    if text.len() > max_size {
        warn!(
            size = text.len(),
            max = max_size,
            event = ?frame.event,
            "outbound frame exceeds message size cap, dropping"
        );
        return None;
    }
    Some(text)
}

/// Queue a frame on a connection mailbox. Failures (full or closed mailbox)
/// are isolated to that connection and only logged.
pub fn offer(id: &str, mailbox: &mpsc::Sender<Outbound>, text: String) -> bool {
    if let Err(e) = mailbox.try_send(Outbound::Frame(text)) {
        warn!(connection_id = %id, error = %e, "dropping frame for unreachable or slow connection");
        return false;
    }
    true
}

/// Direct socket send, for the pre-admission path where no mailbox exists.
pub async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) {
    if let Ok(text) = encode(frame) {
        let _ = socket.send(Message::Text(text)).await;
    }
}

/// Close a raw socket with a code and reason, best-effort.
pub async fn close_socket(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_owned().into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_protocol::error_codes;

    #[test]
    fn error_frame_carries_the_reserved_type_and_code() {
        let frame = error_frame(error_codes::PARSE_ERROR, "invalid JSON");
        assert_eq!(frame.kind, MessageType::Error);
        assert_eq!(frame.event, ServerEvent::Error);
        assert_eq!(frame.direction, Direction::ServerToClient);
        assert_eq!(frame.data["code"], "PARSE_ERROR");
        assert_eq!(frame.data["message"], "invalid JSON");
        assert!(!frame.id.is_empty());
    }

    #[test]
    fn encode_bounded_drops_oversized_frames() {
        let big = "x".repeat(1024);
        let frame = server_frame(
            MessageType::Status,
            ServerEvent::StatusUpdate,
            serde_json::json!({ "blob": big }),
        );
        assert!(encode_bounded(&frame, 64).is_none());
        assert!(encode_bounded(&frame, 64 * 1024).is_some());
    }

    #[test]
    fn fresh_ids_and_monotonic_timestamps_per_frame() {
        let a = server_frame(MessageType::System, ServerEvent::Pong, Value::Null);
        let b = server_frame(MessageType::System, ServerEvent::Pong, Value::Null);
        assert_ne!(a.id, b.id);
        assert!(b.timestamp >= a.timestamp);
    }
}
