// test_client: A raw WebSocket client for driving a hub in tests.
//
// No reconnect logic, no heartbeats: every frame is sent and awaited
// explicitly so tests stay deterministic.

use futures_util::{SinkExt, StreamExt};
use pulse_protocol::{ClientAction, ClientFrame, Direction, MessageType, ServerEvent, ServerFrame};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws, _response) = connect_async(url).await?;
        Ok(Self { ws })
    }

    /// Build a client envelope with a fresh id and current timestamp.
    pub fn frame(kind: MessageType, action: ClientAction, payload: Option<Value>) -> ClientFrame {
        ClientFrame {
            id: Uuid::new_v4().to_string(),
            kind,
            timestamp: crate::now_ms(),
            direction: Direction::ClientToServer,
            action,
            payload,
        }
    }

    pub fn subscribe_frame(types: &[&str]) -> ClientFrame {
        Self::frame(
            MessageType::System,
            ClientAction::Subscribe,
            Some(json!({ "types": types })),
        )
    }

    pub async fn send_frame(&mut self, frame: &ClientFrame) {
        let text = serde_json::to_string(frame).expect("serialize client frame");
        self.send_text(&text).await;
    }

    /// Send raw text, valid JSON or not.
    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_owned().into()))
            .await
            .expect("websocket send");
    }

    /// Next server frame within the timeout; `None` when the connection ends.
    pub async fn next_server_frame(&mut self) -> Option<ServerFrame> {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.ws.next())
                .await
                .expect("timed out waiting for server frame")?;
            match msg {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(&text).expect("valid server frame"));
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Skip frames until one carries `event`. Panics on timeout or close.
    pub async fn expect_event(&mut self, event: ServerEvent) -> ServerFrame {
        loop {
            let frame = self
                .next_server_frame()
                .await
                .unwrap_or_else(|| panic!("connection closed while waiting for {event:?}"));
            if frame.event == event {
                return frame;
            }
        }
    }

    /// Await the server's close frame, returning its code and reason.
    pub async fn expect_close(&mut self) -> Option<(u16, String)> {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.ws.next())
                .await
                .expect("timed out waiting for close")?;
            match msg {
                Ok(Message::Close(frame)) => {
                    return frame.map(|f| (u16::from(f.code), f.reason.to_string()));
                }
                Ok(_) => {}
                Err(_) => return None,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
