//! Connected edge nodes
//!
//! One entry per node id. Registering a node that already has a session
//! cancels the old session; the old session's cleanup then finds a newer
//! session id and leaves the entry alone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::message::Message;
use crate::pki::EdgeIdentity;

/// Registration failures
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegisterError {
    /// `nodeLimit` edges are already connected
    #[error("node limit of {0} reached")]
    NodeLimitReached(usize),
}

/// Handles a session needs from its registry entry
#[derive(Clone)]
pub struct SessionHandle {
    /// Distinguishes this session from earlier ones of the same node
    pub session_id: u64,
    /// Cancelled when the session must stop
    pub cancel: CancellationToken,
    /// Signalled on every keepalive from the edge
    pub keepalive: Arc<Notify>,
}

struct NodeSession {
    handle: SessionHandle,
    project_id: String,
}

struct AckWaiter {
    node: String,
    tx: oneshot::Sender<Message>,
}

/// Registry of connected edge nodes
pub struct NodeRegistry {
    sessions: DashMap<String, NodeSession>,
    acks: DashMap<String, AckWaiter>,
    next_session: AtomicU64,
    connection_tx: broadcast::Sender<String>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (connection_tx, _) = broadcast::channel(64);
        Self {
            sessions: DashMap::new(),
            acks: DashMap::new(),
            next_session: AtomicU64::new(1),
            connection_tx,
        }
    }

    /// Register a new session for `identity`, replacing any existing one
    ///
    /// `parent` is the token the session's token derives from.
    pub fn register(
        &self,
        identity: &EdgeIdentity,
        node_limit: usize,
        parent: &CancellationToken,
    ) -> Result<SessionHandle, RegisterError> {
        let node = &identity.node_id;
        if !self.sessions.contains_key(node) && self.sessions.len() >= node_limit {
            return Err(RegisterError::NodeLimitReached(node_limit));
        }

        let handle = SessionHandle {
            session_id: self.next_session.fetch_add(1, Ordering::Relaxed),
            cancel: parent.child_token(),
            keepalive: Arc::new(Notify::new()),
        };
        let previous = self.sessions.insert(
            node.clone(),
            NodeSession {
                handle: handle.clone(),
                project_id: identity.project_id.clone(),
            },
        );
        if let Some(previous) = previous {
            info!(node = %node, "Replacing existing connection");
            previous.handle.cancel.cancel();
        }

        let _ = self.connection_tx.send(node.clone());
        Ok(handle)
    }

    /// Remove `node` if `session_id` is still its current session
    pub fn unregister(&self, node: &str, session_id: u64) -> bool {
        self.sessions
            .remove_if(node, |_, s| s.handle.session_id == session_id)
            .is_some()
    }

    /// Whether `node` has an active session
    pub fn is_connected(&self, node: &str) -> bool {
        self.sessions.contains_key(node)
    }

    /// Project id of a connected node
    pub fn project_of(&self, node: &str) -> Option<String> {
        self.sessions.get(node).map(|s| s.project_id.clone())
    }

    /// Number of connected nodes
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no node is connected
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of connected nodes
    pub fn list(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Record a keepalive from `node`
    pub fn keepalive(&self, node: &str) {
        if let Some(session) = self.sessions.get(node) {
            session.handle.keepalive.notify_one();
        }
    }

    /// Register a waiter for the response to message `id` from `node`
    pub fn add_waiter(&self, node: &str, id: &str) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.acks.insert(
            id.to_string(),
            AckWaiter {
                node: node.to_string(),
                tx,
            },
        );
        rx
    }

    /// Drop the waiter for message `id`
    pub fn remove_waiter(&self, id: &str) {
        self.acks.remove(id);
    }

    /// Hand a response from `node` to its waiter
    ///
    /// Returns false when nobody waits for it. A response arriving from a
    /// different node than the request went to is not delivered.
    pub fn deliver(&self, node: &str, response: Message) -> bool {
        match self
            .acks
            .remove_if(&response.parent_id, |_, waiter| waiter.node == node)
        {
            Some((_, waiter)) => {
                if waiter.tx.send(response).is_err() {
                    debug!(node = %node, "Response waiter already gone");
                }
                true
            }
            None => false,
        }
    }

    /// Subscribe to node ids as they connect
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.connection_tx.subscribe()
    }

    /// Wait until `node` is connected or `timeout` elapses
    pub async fn wait_for_connection(&self, node: &str, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        if self.is_connected(node) {
            return true;
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return false,
                received = rx.recv() => match received {
                    Ok(id) if id == node => return true,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.is_connected(node) {
                            return true;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                },
            }
        }
    }
}
