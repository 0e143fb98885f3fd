// mock_hub: A scripted hub-side WebSocket server for client testing.
//
// Speaks just enough of the hub protocol to exercise the reconnecting
// client: greets with `connected`, acks subscribe/unsubscribe, answers
// pings, and records every client frame it receives. Tests can drop or
// policy-close live connections to drive reconnect paths.

use futures_util::{SinkExt, StreamExt};
use pulse_protocol::{
    ClientAction, ClientFrame, ConnectedData, Direction, MessageType, ServerEvent, ServerFrame,
    SUPPORTED_TYPES,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use uuid::Uuid;

enum HubCommand {
    Frame(String),
    Close(u16),
}

/// A mock hub bound to a random local port.
pub struct MockHub {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<ClientFrame>>>,
    connections: Arc<Mutex<Vec<mpsc::UnboundedSender<HubCommand>>>>,
    reject_new: Arc<AtomicBool>,
    silent: Arc<AtomicBool>,
    accepted: Arc<AtomicUsize>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockHub {
    /// Start the mock hub on a random available port.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(Mutex::new(Vec::new()));
        let reject_new = Arc::new(AtomicBool::new(false));
        let silent = Arc::new(AtomicBool::new(false));
        let accepted = Arc::new(AtomicUsize::new(0));

        let task = {
            let received = received.clone();
            let connections = connections.clone();
            let reject_new = reject_new.clone();
            let silent = silent.clone();
            let accepted = accepted.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, _peer)) => {
                            let received = received.clone();
                            let connections = connections.clone();
                            let reject_new = reject_new.clone();
                            let silent = silent.clone();
                            let accepted = accepted.clone();
                            tokio::spawn(async move {
                                let _ = Self::handle_connection(
                                    stream,
                                    received,
                                    connections,
                                    reject_new,
                                    silent,
                                    accepted,
                                )
                                .await;
                            });
                        }
                        Err(_) => break,
                    }
                }
            })
        };

        Ok(Self {
            addr,
            received,
            connections,
            reject_new,
            silent,
            accepted,
            _task: task,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Every client frame received so far, in arrival order.
    pub fn received(&self) -> Vec<ClientFrame> {
        self.received.lock().unwrap().clone()
    }

    /// Total connections accepted (including rejected ones).
    pub fn accepted_connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// When set, new connections are immediately policy-closed (1008),
    /// mimicking an admission rejection.
    pub fn set_reject_new(&self, reject: bool) {
        self.reject_new.store(reject, Ordering::SeqCst);
    }

    /// When set, inbound frames are still recorded but never answered;
    /// pings go unanswered, so clients exercise their pong-timeout path.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Push a server frame to every live connection.
    pub fn broadcast(&self, frame: &ServerFrame) {
        let text = serde_json::to_string(frame).expect("serialize server frame");
        self.connections
            .lock()
            .unwrap()
            .retain(|tx| tx.send(HubCommand::Frame(text.clone())).is_ok());
    }

    /// Drop every live connection with a normal close, as a network blip would.
    pub fn drop_all(&self) {
        let mut connections = self.connections.lock().unwrap();
        for tx in connections.drain(..) {
            let _ = tx.send(HubCommand::Close(1001));
        }
    }

    /// Close every live connection with the admission-policy close code.
    pub fn policy_close_all(&self) {
        let mut connections = self.connections.lock().unwrap();
        for tx in connections.drain(..) {
            let _ = tx.send(HubCommand::Close(1008));
        }
    }

    fn server_frame(kind: MessageType, event: ServerEvent, data: serde_json::Value) -> String {
        let frame = ServerFrame {
            id: Uuid::new_v4().to_string(),
            kind,
            timestamp: crate::now_ms(),
            direction: Direction::ServerToClient,
            event,
            data,
        };
        serde_json::to_string(&frame).expect("serialize server frame")
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        received: Arc<Mutex<Vec<ClientFrame>>>,
        connections: Arc<Mutex<Vec<mpsc::UnboundedSender<HubCommand>>>>,
        reject_new: Arc<AtomicBool>,
        silent: Arc<AtomicBool>,
        accepted: Arc<AtomicUsize>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut ws = tokio_tungstenite::accept_async(stream).await?;
        accepted.fetch_add(1, Ordering::SeqCst);

        if reject_new.load(Ordering::SeqCst) {
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "connection limit reached".into(),
                }))
                .await;
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        connections.lock().unwrap().push(tx);

        let greeting = Self::server_frame(
            MessageType::System,
            ServerEvent::Connected,
            serde_json::to_value(ConnectedData {
                connection_id: Uuid::new_v4().to_string(),
                server_time: crate::now_ms(),
                supported_types: SUPPORTED_TYPES.to_vec(),
                heartbeat_interval: 30_000,
                max_reconnect_attempts: 5,
            })?,
        );
        ws.send(Message::Text(greeting.into())).await?;

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    None => break,
                    Some(HubCommand::Frame(text)) => {
                        if ws.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(HubCommand::Close(code)) => {
                        let close_code = CloseCode::from(code);
                        let _ = ws
                            .close(Some(CloseFrame { code: close_code, reason: "".into() }))
                            .await;
                        break;
                    }
                },
                msg = ws.next() => match msg {
                    None | Some(Err(_)) => break,
                    Some(Ok(Message::Text(text))) => {
                        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
                            continue;
                        };
                        received.lock().unwrap().push(frame.clone());
                        if silent.load(Ordering::SeqCst) {
                            continue;
                        }
                        if let Some(reply) = Self::auto_reply(&frame) {
                            if ws.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                },
            }
        }
        Ok(())
    }

    fn auto_reply(frame: &ClientFrame) -> Option<String> {
        let types = frame
            .payload
            .as_ref()
            .and_then(|p| p.get("types"))
            .cloned()
            .unwrap_or_else(|| json!([]));
        match frame.action {
            ClientAction::Subscribe => Some(Self::server_frame(
                frame.kind,
                ServerEvent::Subscribed,
                json!({ "types": types }),
            )),
            ClientAction::Unsubscribe => Some(Self::server_frame(
                frame.kind,
                ServerEvent::Unsubscribed,
                json!({ "types": types }),
            )),
            ClientAction::Ping => Some(Self::server_frame(
                MessageType::System,
                ServerEvent::Pong,
                json!({ "serverTime": crate::now_ms() }),
            )),
            ClientAction::GetHistory => Some(Self::server_frame(
                frame.kind,
                ServerEvent::HistoryData,
                json!({ "type": frame.kind, "limit": 0, "items": [], "total": 0 }),
            )),
            ClientAction::Ack => None,
        }
    }
}
