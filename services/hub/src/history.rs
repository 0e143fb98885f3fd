//! Bounded in-memory history of recently broadcast events.
//!
//! The scheduler records every drained task here; `get_history` and the REST
//! surface read it back through the [`HistoryProvider`] seam. Nothing is
//! persisted across restarts.

use pulse_protocol::{MessageType, ServerEvent};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

/// A page of history items, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct HistorySlice {
    pub items: Vec<Value>,
    /// Total retained items for the type, independent of `limit`.
    pub total: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history backend unavailable: {0}")]
    Unavailable(String),
}

/// The router's view of history. Implementations may block or fail; callers
/// contain failures and answer the client with `INTERNAL_ERROR`.
pub trait HistoryProvider: Send + Sync {
    fn fetch(&self, kind: MessageType, limit: usize) -> Result<HistorySlice, HistoryError>;
}

/// Per-type ring buffer of broadcast events.
pub struct InMemoryHistory {
    capacity: usize,
    buffers: RwLock<HashMap<MessageType, VecDeque<Value>>>,
}

impl InMemoryHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffers: RwLock::new(HashMap::new()),
        }
    }

    /// Record one broadcast event. Oldest entries fall off at capacity.
    pub fn record(&self, kind: MessageType, event: ServerEvent, data: &Value, timestamp: i64) {
        let mut buffers = self.buffers.write().expect("history lock poisoned");
        let buffer = buffers.entry(kind).or_default();
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(json!({
            "event": event,
            "data": data,
            "timestamp": timestamp,
        }));
    }
}

impl HistoryProvider for InMemoryHistory {
    fn fetch(&self, kind: MessageType, limit: usize) -> Result<HistorySlice, HistoryError> {
        let buffers = self.buffers.read().expect("history lock poisoned");
        let Some(buffer) = buffers.get(&kind) else {
            return Ok(HistorySlice { items: Vec::new(), total: 0 });
        };
        let items: Vec<Value> = buffer.iter().rev().take(limit).cloned().collect();
        Ok(HistorySlice { items, total: buffer.len() })
    }
}
