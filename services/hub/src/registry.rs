//! Connection registry: live sessions, subscriptions, heartbeats, caps.
//!
//! The registry exclusively owns connection records and both lookup indices
//! (by connection id and by identity). Sockets are never touched here; each
//! connection carries the sender half of its outbound mailbox, and the
//! connection's writer task is the only place that writes to the socket.

use pulse_protocol::{close_codes, MessageType};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Server-assigned connection id, unique for the process lifetime.
pub type ConnectionId = String;

/// Commands delivered to a connection's writer task through its mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized envelope, written as one text frame.
    Frame(String),
    /// Reply to a transport-level ping.
    Pong(Vec<u8>),
    /// Close the socket with the given code and reason, then stop writing.
    Close { code: u16, reason: String },
}

/// One accepted session.
struct Connection {
    identity: String,
    mailbox: mpsc::Sender<Outbound>,
    subscriptions: HashSet<MessageType>,
    connected_at: chrono::DateTime<chrono::Utc>,
    last_heartbeat: Instant,
    alive: bool,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, Connection>,
    by_identity: HashMap<String, HashSet<ConnectionId>>,
}

/// Registry-level stats for the read-only HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistryStats {
    pub total: usize,
    pub unique_identities: usize,
    pub average_subscriptions: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("server connection limit reached")]
    TotalCapacity,
    #[error("connection limit for this identity reached")]
    IdentityCapacity,
}

pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
    max_total: usize,
    max_per_identity: usize,
}

impl ConnectionRegistry {
    pub fn new(max_total: usize, max_per_identity: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            max_total,
            max_per_identity,
        }
    }

    /// Admit a session: global cap first, then the per-identity cap, then
    /// insert into both indices with a fresh id and empty subscriptions.
    pub async fn register(
        &self,
        identity: &str,
        mailbox: mpsc::Sender<Outbound>,
    ) -> Result<ConnectionId, AdmissionError> {
        let mut inner = self.inner.write().await;
        if inner.connections.len() >= self.max_total {
            return Err(AdmissionError::TotalCapacity);
        }
        let per_identity = inner.by_identity.get(identity).map_or(0, HashSet::len);
        if per_identity >= self.max_per_identity {
            return Err(AdmissionError::IdentityCapacity);
        }

        let id = Uuid::new_v4().to_string();
        inner.connections.insert(
            id.clone(),
            Connection {
                identity: identity.to_owned(),
                mailbox,
                subscriptions: HashSet::new(),
                connected_at: chrono::Utc::now(),
                last_heartbeat: Instant::now(),
                alive: true,
            },
        );
        inner
            .by_identity
            .entry(identity.to_owned())
            .or_default()
            .insert(id.clone());
        debug!(connection_id = %id, identity = %identity, "connection registered");
        Ok(id)
    }

    /// Remove a session from both indices. Safe to call twice.
    pub async fn unregister(&self, id: &ConnectionId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.remove(id) else {
            return false;
        };
        if let Some(ids) = inner.by_identity.get_mut(&conn.identity) {
            ids.remove(id);
            if ids.is_empty() {
                inner.by_identity.remove(&conn.identity);
            }
        }
        debug!(connection_id = %id, identity = %conn.identity, "connection unregistered");
        true
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.read().await.connections.contains_key(id)
    }

    /// The outbound mailbox for a connection, if it is still registered.
    pub async fn mailbox(&self, id: &ConnectionId) -> Option<mpsc::Sender<Outbound>> {
        self.inner
            .read()
            .await
            .connections
            .get(id)
            .map(|c| c.mailbox.clone())
    }

    pub async fn identity(&self, id: &ConnectionId) -> Option<String> {
        self.inner
            .read()
            .await
            .connections
            .get(id)
            .map(|c| c.identity.clone())
    }

    pub async fn connected_at(&self, id: &ConnectionId) -> Option<chrono::DateTime<chrono::Utc>> {
        self.inner
            .read()
            .await
            .connections
            .get(id)
            .map(|c| c.connected_at)
    }

    pub async fn by_identity(&self, identity: &str) -> Vec<ConnectionId> {
        self.inner
            .read()
            .await
            .by_identity
            .get(identity)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every connection whose subscription set contains `kind` or the `all`
    /// wildcard, paired with its mailbox. The wildcard never matches reserved
    /// types. The snapshot is stable for the duration of one fan-out.
    pub async fn by_subscription(
        &self,
        kind: MessageType,
    ) -> Vec<(ConnectionId, mpsc::Sender<Outbound>)> {
        let wildcard_applies = !kind.is_reserved();
        let inner = self.inner.read().await;
        let mut matched: Vec<(ConnectionId, mpsc::Sender<Outbound>)> = inner
            .connections
            .iter()
            .filter(|(_, c)| {
                c.subscriptions.contains(&kind)
                    || (wildcard_applies && c.subscriptions.contains(&MessageType::All))
            })
            .map(|(id, c)| (id.clone(), c.mailbox.clone()))
            .collect();
        matched.sort_by(|(a, _), (b, _)| a.cmp(b));
        matched
    }

    /// Replace a connection's subscription set (last-write-wins). Reserved
    /// types are dropped so the invariant holds even for unfiltered callers.
    pub async fn set_subscriptions(&self, id: &ConnectionId, types: &[MessageType]) -> bool {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get_mut(id) else {
            return false;
        };
        conn.subscriptions = types.iter().copied().filter(|t| !t.is_reserved()).collect();
        true
    }

    pub async fn add_subscription(&self, id: &ConnectionId, kind: MessageType) -> bool {
        if kind.is_reserved() {
            return false;
        }
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get_mut(id) else {
            return false;
        };
        conn.subscriptions.insert(kind)
    }

    pub async fn remove_subscription(&self, id: &ConnectionId, kind: MessageType) -> bool {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get_mut(id) else {
            return false;
        };
        conn.subscriptions.remove(&kind)
    }

    pub async fn subscriptions(&self, id: &ConnectionId) -> Option<Vec<MessageType>> {
        let inner = self.inner.read().await;
        inner.connections.get(id).map(|c| {
            let mut types: Vec<MessageType> = c.subscriptions.iter().copied().collect();
            types.sort();
            types
        })
    }

    /// Record a heartbeat for a connection.
    pub async fn touch(&self, id: &ConnectionId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get_mut(id) else {
            return false;
        };
        conn.last_heartbeat = Instant::now();
        true
    }

    /// Evict every connection whose last heartbeat is older than `timeout`.
    ///
    /// Each timed-out session is marked dead, asked (best-effort) to close
    /// with 1001 "Heartbeat timeout", and unregistered. Returns the evicted
    /// ids.
    pub async fn sweep_timed_out(&self, timeout: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let expired: Vec<ConnectionId> = inner
            .connections
            .iter()
            .filter(|(_, c)| now.duration_since(c.last_heartbeat) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(conn) = inner.connections.get_mut(id) {
                conn.alive = false;
                if conn
                    .mailbox
                    .try_send(Outbound::Close {
                        code: close_codes::GOING_AWAY,
                        reason: close_codes::HEARTBEAT_TIMEOUT_REASON.to_owned(),
                    })
                    .is_err()
                {
                    warn!(connection_id = %id, "close notification undeliverable during sweep");
                }
            }
            if let Some(conn) = inner.connections.remove(id) {
                if let Some(ids) = inner.by_identity.get_mut(&conn.identity) {
                    ids.remove(id);
                    if ids.is_empty() {
                        inner.by_identity.remove(&conn.identity);
                    }
                }
                info!(connection_id = %id, identity = %conn.identity, "heartbeat timeout, connection swept");
            }
        }
        expired
    }

    pub async fn total(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        let total = inner.connections.len();
        let subscription_entries: usize = inner
            .connections
            .values()
            .map(|c| c.subscriptions.len())
            .sum();
        #[allow(clippy::cast_precision_loss)]
        let average_subscriptions = if total == 0 {
            0.0
        } else {
            subscription_entries as f64 / total as f64
        };
        RegistryStats {
            total,
            unique_identities: inner.by_identity.len(),
            average_subscriptions,
        }
    }
}
