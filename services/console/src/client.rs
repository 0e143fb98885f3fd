//! Reconnecting hub client.
//!
//! Maintains one logical session over a churning transport:
//! `disconnected -> connecting -> connected -> {reconnecting -> connecting ...}`.
//! While disconnected, outbound frames land in a bounded drop-oldest offline
//! queue; on every (re)connect the queue flushes FIFO and the full local
//! subscription set is replayed in a single `subscribe` frame.

use crate::backoff::ReconnectPolicy;
use futures_util::{SinkExt, StreamExt};
use pulse_protocol::{
    close_codes, encode, ClientAction, ClientFrame, Direction, ErrorData, MessageType, ServerEvent,
    ServerFrame, SubscribePayload,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client-side session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hub WebSocket URL, e.g. `ws://hub.example.com/ws?identity=console-1`.
    pub url: String,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub offline_queue_limit: usize,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat_interval: Duration::from_millis(30_000),
            heartbeat_timeout: Duration::from_millis(60_000),
            reconnect: ReconnectPolicy::default(),
            offline_queue_limit: 100,
        }
    }
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected { connection_id: String },
    Disconnected { retrying: bool },
    Subscribed { types: Vec<MessageType> },
    Unsubscribed { types: Vec<MessageType> },
    /// A broadcast frame: status/stats/health updates and batches.
    Update(ServerFrame),
    /// An `error` frame. Surfaced only; never triggers a reconnect.
    ServerError(ErrorData),
    /// Reconnect attempts exhausted; the session is terminally down.
    GaveUp,
}

enum Command {
    Send(ClientFrame),
    Subscribe(Vec<MessageType>),
    Unsubscribe(Vec<MessageType>),
    Close,
}

enum SessionEnd {
    /// Transport dropped with a retry-permitted reason.
    Retry,
    /// Locally requested close.
    Closed,
    /// Server closed with a non-retryable reason (e.g. admission rejection).
    Terminal,
}

/// Handle to a supervised hub session.
pub struct PulseClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    events_tx: broadcast::Sender<ClientEvent>,
    state_rx: watch::Receiver<ClientState>,
    _supervisor: JoinHandle<()>,
}

impl PulseClient {
    /// Spawn the supervisor and start connecting. The handle is cheap to use
    /// from any task; all transport work happens in the supervisor.
    pub fn connect(config: ClientConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(256);
        let (state_tx, state_rx) = watch::channel(ClientState::Disconnected);
        let supervisor = Supervisor {
            config,
            cmd_rx,
            events: events_tx.clone(),
            state: state_tx,
            subscriptions: Vec::new(),
            offline: VecDeque::new(),
            attempts: 0,
        };
        let handle = tokio::spawn(supervisor.run());
        Self {
            cmd_tx,
            events_tx,
            state_rx,
            _supervisor: handle,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events_tx.subscribe()
    }

    pub fn state(&self) -> ClientState {
        *self.state_rx.borrow()
    }

    /// Await a specific state; used by callers that need connection barriers.
    pub async fn wait_for_state(&self, target: ClientState) {
        let mut rx = self.state_rx.clone();
        loop {
            if *rx.borrow_and_update() == target {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Send a frame now, or queue it offline when the transport is down.
    pub fn send(&self, frame: ClientFrame) {
        let _ = self.cmd_tx.send(Command::Send(frame));
    }

    /// Add types to the local subscription set and sync the hub if connected.
    pub fn subscribe(&self, types: Vec<MessageType>) {
        let _ = self.cmd_tx.send(Command::Subscribe(types));
    }

    /// Remove types from the local set and sync the hub if connected.
    pub fn unsubscribe(&self, types: Vec<MessageType>) {
        let _ = self.cmd_tx.send(Command::Unsubscribe(types));
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }
}

/// Build a client envelope with a fresh id and current timestamp.
pub fn client_frame(kind: MessageType, action: ClientAction, payload: Option<Value>) -> ClientFrame {
    ClientFrame {
        id: Uuid::new_v4().to_string(),
        kind,
        timestamp: chrono::Utc::now().timestamp_millis(),
        direction: Direction::ClientToServer,
        action,
        payload,
    }
}

fn subscription_payload(types: &[MessageType]) -> Option<Value> {
    serde_json::to_value(SubscribePayload { types: types.to_vec() }).ok()
}

fn subscribe_frame(types: &[MessageType]) -> ClientFrame {
    client_frame(
        MessageType::System,
        ClientAction::Subscribe,
        subscription_payload(types),
    )
}

fn unsubscribe_frame(types: &[MessageType]) -> ClientFrame {
    client_frame(
        MessageType::System,
        ClientAction::Unsubscribe,
        subscription_payload(types),
    )
}

struct Supervisor {
    config: ClientConfig,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<ClientEvent>,
    state: watch::Sender<ClientState>,
    subscriptions: Vec<MessageType>,
    offline: VecDeque<ClientFrame>,
    attempts: u32,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            self.set_state(ClientState::Connecting);
            match connect_async(self.config.url.as_str()).await {
                Ok((ws, _response)) => {
                    self.set_state(ClientState::Connected);
                    self.attempts = 0;
                    match self.session(ws).await {
                        SessionEnd::Retry => {}
                        SessionEnd::Closed => {
                            self.finish(false);
                            return;
                        }
                        SessionEnd::Terminal => {
                            warn!("server refused the session, not retrying");
                            self.finish(false);
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "connect failed");
                }
            }

            self.attempts += 1;
            if self.attempts > self.config.reconnect.max_attempts {
                info!(
                    attempts = self.config.reconnect.max_attempts,
                    "reconnect attempts exhausted"
                );
                self.set_state(ClientState::Disconnected);
                self.emit(ClientEvent::GaveUp);
                return;
            }
            self.set_state(ClientState::Reconnecting);
            self.emit(ClientEvent::Disconnected { retrying: true });
            let delay = self.config.reconnect.delay(self.attempts);
            debug!(attempt = self.attempts, delay_ms = delay.as_millis() as u64, "backing off");
            if self.idle_wait(delay).await.is_break() {
                self.finish(false);
                return;
            }
        }
    }

    /// One connected session. Returns how it ended.
    async fn session(&mut self, mut ws: WsStream) -> SessionEnd {
        // Offline frames flush FIFO before anything else.
        while let Some(frame) = self.offline.pop_front() {
            if send_frame(&mut ws, &frame).await.is_err() {
                self.offline.push_front(frame);
                return SessionEnd::Retry;
            }
        }
        // Deterministic resubscription: the full set in one frame.
        if !self.subscriptions.is_empty() {
            let frame = subscribe_frame(&self.subscriptions);
            if send_frame(&mut ws, &frame).await.is_err() {
                return SessionEnd::Retry;
            }
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;
        let mut last_pong = Instant::now();

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if last_pong.elapsed() > self.config.heartbeat_timeout {
                        warn!("pong overdue, dropping transport to trigger reconnect");
                        let _ = ws.close(None).await;
                        return SessionEnd::Retry;
                    }
                    let ping = client_frame(MessageType::System, ClientAction::Ping, None);
                    if send_frame(&mut ws, &ping).await.is_err() {
                        return SessionEnd::Retry;
                    }
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(Command::Close) => {
                        let _ = ws.close(None).await;
                        return SessionEnd::Closed;
                    }
                    Some(Command::Send(frame)) => {
                        if send_frame(&mut ws, &frame).await.is_err() {
                            self.queue_offline(frame);
                            return SessionEnd::Retry;
                        }
                    }
                    Some(Command::Subscribe(types)) => {
                        self.merge_subscriptions(&types);
                        if !self.subscriptions.is_empty() {
                            let frame = subscribe_frame(&self.subscriptions);
                            if send_frame(&mut ws, &frame).await.is_err() {
                                return SessionEnd::Retry;
                            }
                        }
                    }
                    Some(Command::Unsubscribe(types)) => {
                        self.subscriptions.retain(|t| !types.contains(t));
                        let frame = unsubscribe_frame(&types);
                        if send_frame(&mut ws, &frame).await.is_err() {
                            return SessionEnd::Retry;
                        }
                    }
                },
                msg = ws.next() => match msg {
                    None => return SessionEnd::Retry,
                    Some(Err(e)) => {
                        warn!(error = %e, "transport error");
                        return SessionEnd::Retry;
                    }
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => self.handle_server_frame(frame, &mut last_pong),
                            Err(e) => warn!(error = %e, "undecodable server frame"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let retryable = frame
                            .as_ref()
                            .is_none_or(|f| u16::from(f.code) != close_codes::POLICY_VIOLATION);
                        return if retryable { SessionEnd::Retry } else { SessionEnd::Terminal };
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    fn handle_server_frame(&self, frame: ServerFrame, last_pong: &mut Instant) {
        match frame.event {
            ServerEvent::Pong => {
                *last_pong = Instant::now();
            }
            ServerEvent::Connected => {
                let connection_id = frame.data["connectionId"]
                    .as_str()
                    .unwrap_or_default()
                    .to_owned();
                info!(connection_id = %connection_id, "session established");
                self.emit(ClientEvent::Connected { connection_id });
            }
            ServerEvent::Error => {
                let data = serde_json::from_value::<ErrorData>(frame.data.clone())
                    .unwrap_or_else(|_| ErrorData {
                        code: "UNKNOWN".to_owned(),
                        message: String::new(),
                    });
                warn!(code = %data.code, message = %data.message, "server error frame");
                self.emit(ClientEvent::ServerError(data));
            }
            ServerEvent::Subscribed => {
                let types = parse_ack_types(&frame.data);
                self.emit(ClientEvent::Subscribed { types });
            }
            ServerEvent::Unsubscribed => {
                let types = parse_ack_types(&frame.data);
                self.emit(ClientEvent::Unsubscribed { types });
            }
            _ => {
                self.emit(ClientEvent::Update(frame));
            }
        }
    }

    /// Drain commands while the transport is down, then resume after `delay`.
    async fn idle_wait(&mut self, delay: Duration) -> ControlFlow<()> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return ControlFlow::Continue(()),
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(Command::Close) => return ControlFlow::Break(()),
                    Some(Command::Send(frame)) => self.queue_offline(frame),
                    Some(Command::Subscribe(types)) => self.merge_subscriptions(&types),
                    Some(Command::Unsubscribe(types)) => {
                        self.subscriptions.retain(|t| !types.contains(t));
                    }
                },
            }
        }
    }

    fn merge_subscriptions(&mut self, types: &[MessageType]) {
        for t in types {
            if !t.is_reserved() && !self.subscriptions.contains(t) {
                self.subscriptions.push(*t);
            }
        }
    }

    fn queue_offline(&mut self, frame: ClientFrame) {
        if self.offline.len() == self.config.offline_queue_limit {
            warn!("offline queue full, dropping oldest frame");
            self.offline.pop_front();
        }
        self.offline.push_back(frame);
    }

    fn finish(&self, retrying: bool) {
        self.set_state(ClientState::Disconnected);
        self.emit(ClientEvent::Disconnected { retrying });
    }

    fn set_state(&self, state: ClientState) {
        let _ = self.state.send(state);
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

async fn send_frame(ws: &mut WsStream, frame: &ClientFrame) -> Result<(), ()> {
    let text = encode(frame).map_err(|_| ())?;
    ws.send(Message::Text(text.into())).await.map_err(|e| {
        warn!(error = %e, "send failed");
    })
}

fn parse_ack_types(data: &Value) -> Vec<MessageType> {
    data.get("types")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| serde_json::from_value(e.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
