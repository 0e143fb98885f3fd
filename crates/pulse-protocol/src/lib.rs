// pulse-protocol: Wire envelope types, validation, and serialization.
//
// Every WebSocket frame is a flat JSON object with `id`, `type`, `timestamp`,
// and `direction`.  Client frames carry an `action` (plus optional `payload`);
// server frames carry an `event` (plus `data`).  Inbound frames are decoded
// permissively and validated explicitly so that bad JSON, unknown
// discriminants, and missing fields map to distinct error codes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Closed enums
// ---------------------------------------------------------------------------

/// Message categories clients can subscribe to.
///
/// `error` is reserved: it is a valid frame type for server error replies but
/// clients may never subscribe to it.  `all` is a subscription-only wildcard
/// that matches every non-reserved type at fan-out time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Status,
    Stats,
    Health,
    Config,
    System,
    Error,
    All,
}

/// The types advertised in the `connected` greeting.  Excludes the reserved
/// `error` type and the `all` wildcard.
pub const SUPPORTED_TYPES: [MessageType; 5] = [
    MessageType::Status,
    MessageType::Stats,
    MessageType::Health,
    MessageType::Config,
    MessageType::System,
];

impl MessageType {
    /// Reserved types may appear on server frames but are never subscribable.
    pub fn is_reserved(self) -> bool {
        matches!(self, MessageType::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Status => "status",
            MessageType::Stats => "stats",
            MessageType::Health => "health",
            MessageType::Config => "config",
            MessageType::System => "system",
            MessageType::Error => "error",
            MessageType::All => "all",
        }
    }
}

/// Intents a client may express.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAction {
    Subscribe,
    Unsubscribe,
    Ping,
    GetHistory,
    Ack,
}

/// Events the server may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerEvent {
    Connected,
    Disconnected,
    Subscribed,
    Unsubscribed,
    StatusUpdate,
    StatsUpdate,
    HealthAlert,
    HealthRecovery,
    Pong,
    HistoryData,
    BatchUpdate,
    Error,
}

/// Frame direction.  Inbound frames may omit it; the server treats a missing
/// direction as client-to-server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    #[serde(rename = "client-to-server")]
    ClientToServer,
    #[serde(rename = "server-to-client")]
    ServerToClient,
}

/// Broadcast priority.  Ordering is `Low < Normal < High`, which the
/// scheduler relies on for queue admission under pressure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

// ---------------------------------------------------------------------------
// Frozen error codes and close codes
// ---------------------------------------------------------------------------

/// Frozen error codes carried in `error` frame data.
pub mod error_codes {
    pub const PARSE_ERROR: &str = "PARSE_ERROR";
    pub const INVALID_TYPE: &str = "INVALID_TYPE";
    pub const INVALID_ACTION: &str = "INVALID_ACTION";
    pub const MAX_CONNECTIONS_EXCEEDED: &str = "MAX_CONNECTIONS_EXCEEDED";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const HEARTBEAT_TIMEOUT: &str = "HEARTBEAT_TIMEOUT";
    pub const QUEUE_OVERFLOW: &str = "QUEUE_OVERFLOW";
    pub const SUBSCRIPTION_INVALID: &str = "SUBSCRIPTION_INVALID";
}

/// WebSocket close codes used by the hub.
pub mod close_codes {
    /// Admission rejection (caps exceeded).
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Heartbeat timeout sweep.
    pub const GOING_AWAY: u16 = 1001;

    pub const HEARTBEAT_TIMEOUT_REASON: &str = "Heartbeat timeout";
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// A validated client-to-server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub timestamp: i64,
    #[serde(default)]
    pub direction: Direction,
    pub action: ClientAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// A server-to-client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub timestamp: i64,
    pub direction: Direction,
    pub event: ServerEvent,
    pub data: Value,
}

/// A permissively decoded inbound frame, prior to validation.
///
/// Every field is optional and loosely typed so that [`decode`] only fails on
/// malformed JSON; [`RawFrame::validate_client`] produces the field-level
/// errors.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFrame {
    pub id: Option<Value>,
    #[serde(rename = "type")]
    pub kind: Option<Value>,
    pub timestamp: Option<Value>,
    pub direction: Option<Value>,
    pub action: Option<Value>,
    pub payload: Option<Value>,
}

// ---------------------------------------------------------------------------
// Codec errors
// ---------------------------------------------------------------------------

/// Frame-level decode/validation failures.
///
/// | Variant             | Wire code            |
/// |---------------------|----------------------|
/// | Parse               | PARSE_ERROR          |
/// | MissingField        | PARSE_ERROR          |
/// | InvalidTimestamp    | PARSE_ERROR          |
/// | InvalidType         | INVALID_TYPE         |
/// | InvalidAction       | INVALID_ACTION       |
/// | SubscriptionInvalid | SUBSCRIPTION_INVALID |
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    Parse(String),
    #[error("unknown message type `{0}`")]
    InvalidType(String),
    #[error("unknown client action `{0}`")]
    InvalidAction(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("timestamp must be an integer millisecond value")]
    InvalidTimestamp,
    #[error("subscription contains no valid types")]
    SubscriptionInvalid,
}

impl FrameError {
    /// The frozen wire code to carry in the `error` reply.
    pub fn code(&self) -> &'static str {
        match self {
            FrameError::Parse(_) | FrameError::MissingField(_) | FrameError::InvalidTimestamp => {
                error_codes::PARSE_ERROR
            }
            FrameError::InvalidType(_) => error_codes::INVALID_TYPE,
            FrameError::InvalidAction(_) => error_codes::INVALID_ACTION,
            FrameError::SubscriptionInvalid => error_codes::SUBSCRIPTION_INVALID,
        }
    }
}

// ---------------------------------------------------------------------------
// Codec operations
// ---------------------------------------------------------------------------

/// Decode inbound frame text.  Fails closed on malformed JSON; never panics.
pub fn decode(text: &str) -> Result<RawFrame, FrameError> {
    serde_json::from_str(text).map_err(|e| FrameError::Parse(e.to_string()))
}

/// Serialize an outbound frame to wire text.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, FrameError> {
    serde_json::to_string(frame).map_err(|e| FrameError::Parse(e.to_string()))
}

impl RawFrame {
    /// Validate an inbound frame against the client contract.
    ///
    /// Checks each field in a fixed order so the reply names the first failed
    /// field.  A missing `direction` is accepted as client-to-server.
    pub fn validate_client(&self) -> Result<ClientFrame, FrameError> {
        let id = match &self.id {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => return Err(FrameError::MissingField("id")),
        };
        let kind = match &self.kind {
            None => return Err(FrameError::MissingField("type")),
            Some(Value::String(s)) => serde_json::from_value::<MessageType>(Value::String(s.clone()))
                .map_err(|_| FrameError::InvalidType(s.clone()))?,
            Some(other) => return Err(FrameError::InvalidType(other.to_string())),
        };
        let timestamp = match &self.timestamp {
            None => return Err(FrameError::MissingField("timestamp")),
            Some(v) => v.as_i64().ok_or(FrameError::InvalidTimestamp)?,
        };
        let action = match &self.action {
            None => return Err(FrameError::MissingField("action")),
            Some(Value::String(s)) => serde_json::from_value::<ClientAction>(Value::String(s.clone()))
                .map_err(|_| FrameError::InvalidAction(s.clone()))?,
            Some(other) => return Err(FrameError::InvalidAction(other.to_string())),
        };
        let direction = self
            .direction
            .as_ref()
            .and_then(|v| serde_json::from_value::<Direction>(v.clone()).ok())
            .unwrap_or_default();

        Ok(ClientFrame {
            id,
            kind,
            timestamp,
            direction,
            action,
            payload: self.payload.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// `subscribe` / `unsubscribe` payload: `{ "types": [...] }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub types: Vec<MessageType>,
}

/// Extract the subscription set from a `subscribe` payload.
///
/// Unknown entries and the reserved `error` type are silently dropped; the
/// remaining list is deduplicated in request order.  An absent, malformed, or
/// post-filter-empty list is a `SubscriptionInvalid` error.
pub fn parse_subscription(payload: Option<&Value>) -> Result<Vec<MessageType>, FrameError> {
    let entries = payload
        .and_then(|p| p.get("types"))
        .and_then(Value::as_array)
        .ok_or(FrameError::SubscriptionInvalid)?;

    let mut types = Vec::new();
    for entry in entries {
        let Ok(t) = serde_json::from_value::<MessageType>(entry.clone()) else {
            continue;
        };
        if !t.is_reserved() && !types.contains(&t) {
            types.push(t);
        }
    }
    if types.is_empty() {
        return Err(FrameError::SubscriptionInvalid);
    }
    Ok(types)
}

/// `get_history` payload: `{ "type": ..., "limit": ... }`.
///
/// `limit` is clamped to `[1, max]`; `default` applies when absent.
pub fn parse_history_request(
    payload: Option<&Value>,
    default: usize,
    max: usize,
) -> Result<(MessageType, usize), FrameError> {
    let kind = payload
        .and_then(|p| p.get("type"))
        .cloned()
        .ok_or(FrameError::MissingField("type"))?;
    let kind = serde_json::from_value::<MessageType>(kind.clone())
        .map_err(|_| FrameError::InvalidType(kind.to_string()))?;
    if kind.is_reserved() {
        return Err(FrameError::InvalidType(kind.as_str().to_owned()));
    }
    let limit = payload
        .and_then(|p| p.get("limit"))
        .and_then(Value::as_u64)
        .map_or(default, |l| usize::try_from(l).unwrap_or(max));
    Ok((kind, limit.clamp(1, max)))
}

// ---------------------------------------------------------------------------
// Server frame data documents (frozen schema)
// ---------------------------------------------------------------------------

/// Data for the `connected` greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedData {
    pub connection_id: String,
    pub server_time: i64,
    pub supported_types: Vec<MessageType>,
    pub heartbeat_interval: u64,
    pub max_reconnect_attempts: u32,
}

/// Data for `error` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: String,
    pub message: String,
}

/// Data for `pong` replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongData {
    pub server_time: i64,
}

/// Data for `subscribed` / `unsubscribed` acknowledgements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub types: Vec<MessageType>,
}

/// One coalesced event inside a `batch_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub event: ServerEvent,
    pub data: Value,
    pub timestamp: i64,
}

/// Data for `batch_update` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchData {
    pub events: Vec<BatchEntry>,
}

/// Data for `history_data` replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryData {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub limit: usize,
    pub items: Vec<Value>,
    pub total: usize,
}
