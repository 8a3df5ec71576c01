//! Connection registry and per-connection state (component C8, registry half).
//!
//! The registry maps `connection_id -> handle`; the owning worker is the
//! single writer for its own entry and for the socket itself. Readers
//! (broker fan-out, dispatcher lookups) only ever take a handle and push
//! onto its mailbox — they never reach into another worker's state.

use dashmap::DashMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::core::now_s;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    OpenUnauthenticated,
    OpenAuthenticated,
    Closing,
    Closed,
}

/// Per-subscriber mailbox capacity; bounds memory per connection
/// independent of how many topics it subscribes to.
pub const MAILBOX_CAPACITY: usize = 256;

/// A message queued for delivery to one connection's worker.
pub enum Delivery {
    /// A fully-formed outbound JSON envelope, serialized to a text frame by the worker.
    Envelope(serde_json::Value),
    /// Ask the worker to close with a code and reason.
    Close(u16, String),
}

pub type DeliverySender = mpsc::Sender<Delivery>;
pub type DeliveryReceiver = mpsc::Receiver<Delivery>;

/// Shared, cheaply cloned handle the broker and dispatcher use to reach a
/// connection's worker without blocking on it.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub connection_id: String,
    sender: DeliverySender,
    last_activity_ms: Arc<AtomicU64>,
}

impl ConnectionHandle {
    /// Best-effort send: a full mailbox drops the message rather than
    /// blocking the caller. Returns whether the message was enqueued.
    pub fn try_deliver(&self, delivery: Delivery) -> bool {
        self.sender.try_send(delivery).is_ok()
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(now_s() * 1000, Ordering::Relaxed);
    }

    pub fn last_activity_s(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed) / 1000
    }
}

pub struct ConnectionRecord {
    pub connection_id: String,
    pub state: ConnectionState,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub subscriptions: HashSet<String>,
    pub metadata: HashMap<String, String>,
}

pub struct ConnectionRegistry {
    records: DashMap<String, ConnectionRecord>,
    handles: DashMap<String, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            handles: DashMap::new(),
        }
    }

    /// Register a new connection, creating its mailbox. Returns the handle
    /// for the broker/dispatcher and the receiver the worker owns.
    pub fn register(&self, connection_id: String, metadata: HashMap<String, String>) -> (ConnectionHandle, DeliveryReceiver) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let handle = ConnectionHandle {
            connection_id: connection_id.clone(),
            sender: tx,
            last_activity_ms: Arc::new(AtomicU64::new(now_s() * 1000)),
        };
        self.handles.insert(connection_id.clone(), handle.clone());
        self.records.insert(
            connection_id.clone(),
            ConnectionRecord {
                connection_id,
                state: ConnectionState::Handshaking,
                user_id: None,
                session_id: None,
                subscriptions: HashSet::new(),
                metadata,
            },
        );
        (handle, rx)
    }

    pub fn set_state(&self, connection_id: &str, state: ConnectionState) {
        if let Some(mut rec) = self.records.get_mut(connection_id) {
            rec.state = state;
        }
    }

    pub fn bind_session(&self, connection_id: &str, user_id: &str, session_id: &str) {
        if let Some(mut rec) = self.records.get_mut(connection_id) {
            rec.user_id = Some(user_id.to_string());
            rec.session_id = Some(session_id.to_string());
            rec.state = ConnectionState::OpenAuthenticated;
        }
    }

    pub fn is_authenticated(&self, connection_id: &str) -> bool {
        self.records
            .get(connection_id)
            .map(|r| r.state == ConnectionState::OpenAuthenticated)
            .unwrap_or(false)
    }

    pub fn user_id(&self, connection_id: &str) -> Option<String> {
        self.records.get(connection_id).and_then(|r| r.user_id.clone())
    }

    pub fn session_id(&self, connection_id: &str) -> Option<String> {
        self.records.get(connection_id).and_then(|r| r.session_id.clone())
    }

    pub fn add_subscription(&self, connection_id: &str, topic: &str) {
        if let Some(mut rec) = self.records.get_mut(connection_id) {
            rec.subscriptions.insert(topic.to_string());
        }
    }

    pub fn remove_subscription(&self, connection_id: &str, topic: &str) {
        if let Some(mut rec) = self.records.get_mut(connection_id) {
            rec.subscriptions.remove(topic);
        }
    }

    pub fn handle(&self, connection_id: &str) -> Option<ConnectionHandle> {
        self.handles.get(connection_id).map(|h| h.clone())
    }

    pub fn deregister(&self, connection_id: &str) {
        self.records.remove(connection_id);
        self.handles.remove(connection_id);
    }

    pub fn current_connections(&self) -> usize {
        self.records.len()
    }

    pub fn all_handles(&self) -> Vec<ConnectionHandle> {
        self.handles.iter().map(|h| h.clone()).collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
