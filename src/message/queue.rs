//! Per-node outbound message queues
//!
//! Each node has two FIFO queues: `single` for individual messages and `list`
//! for full snapshots. Producers push without blocking; exactly one write loop
//! per queue consumes it, which is enforced by handing out the receiver behind
//! an async mutex.
//!
//! The last snapshot per kind is kept in a store pool and replayed onto the list
//! queue when the node reconnects. Queues of a disconnected node survive until
//! [`MessageQueue::purge_expired`] sees it gone for longer than the grace period.
//! A node that has never connected counts as disconnected from the first
//! message queued for it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::debug;

use super::Message;

/// Exclusive handle to a node's queue receiver
pub type SharedReceiver = Arc<Mutex<mpsc::UnboundedReceiver<Message>>>;

struct NodeQueue {
    tx: mpsc::UnboundedSender<Message>,
    rx: SharedReceiver,
}

impl NodeQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

/// Queues for every known node
#[derive(Default)]
pub struct MessageQueue {
    single: DashMap<String, NodeQueue>,
    list: DashMap<String, NodeQueue>,
    store_pool: DashMap<String, BTreeMap<String, Message>>,
    connected: DashSet<String>,
    disconnected: DashMap<String, Instant>,
}

impl MessageQueue {
    /// Empty queue set
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the purge clock for a node that is not connected; an already
    /// running clock is left alone
    fn track(&self, node: &str) {
        if !self.connected.contains(node) {
            self.disconnected
                .entry(node.to_string())
                .or_insert_with(Instant::now);
        }
    }

    fn push(map: &DashMap<String, NodeQueue>, node: &str, msg: Message) {
        let queue = map.entry(node.to_string()).or_insert_with(NodeQueue::new);
        // The receiver lives in the same entry, so the channel cannot be closed.
        let _ = queue.tx.send(msg);
    }

    fn receiver(map: &DashMap<String, NodeQueue>, node: &str) -> SharedReceiver {
        map.entry(node.to_string())
            .or_insert_with(NodeQueue::new)
            .rx
            .clone()
    }

    /// Queue a single message for `node`
    pub fn publish(&self, node: &str, msg: Message) {
        self.track(node);
        Self::push(&self.single, node, msg);
    }

    /// Record `msg` as the latest `kind` snapshot for `node` and queue it
    pub fn publish_list(&self, node: &str, kind: &str, msg: Message) {
        self.store_pool
            .entry(node.to_string())
            .or_default()
            .insert(kind.to_string(), msg.clone());
        self.track(node);
        Self::push(&self.list, node, msg);
    }

    /// Receiver of `node`'s single queue
    pub fn single_receiver(&self, node: &str) -> SharedReceiver {
        Self::receiver(&self.single, node)
    }

    /// Receiver of `node`'s list queue
    pub fn list_receiver(&self, node: &str) -> SharedReceiver {
        Self::receiver(&self.list, node)
    }

    /// Latest snapshot of `kind` for `node`
    pub fn snapshot(&self, node: &str, kind: &str) -> Option<Message> {
        self.store_pool.get(node)?.get(kind).cloned()
    }

    /// Replace whatever is pending on `node`'s list queue with the stored snapshots
    ///
    /// Called when a node connects; the pending entries are superseded by the
    /// snapshots anyway.
    pub async fn replay(&self, node: &str) -> usize {
        let rx = self.list_receiver(node);
        let mut rx = rx.lock().await;
        while rx.try_recv().is_ok() {}
        drop(rx);

        let snapshots: Vec<Message> = self
            .store_pool
            .get(node)
            .map(|pool| pool.values().cloned().collect())
            .unwrap_or_default();
        let count = snapshots.len();
        for msg in snapshots {
            Self::push(&self.list, node, msg);
        }
        debug!(node = %node, count, "Replayed list snapshots");
        count
    }

    /// Note that `node` has an active connection
    pub fn mark_connected(&self, node: &str) {
        self.connected.insert(node.to_string());
        self.disconnected.remove(node);
    }

    /// Note that `node` lost its connection
    pub fn mark_disconnected(&self, node: &str) {
        self.connected.remove(node);
        self.disconnected.insert(node.to_string(), Instant::now());
    }

    /// Drop every queue and snapshot of `node`
    pub fn purge(&self, node: &str) {
        self.single.remove(node);
        self.list.remove(node);
        self.store_pool.remove(node);
        self.disconnected.remove(node);
    }

    /// Purge nodes disconnected for longer than `grace`, returning their ids
    pub fn purge_expired(&self, grace: Duration) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .disconnected
            .iter()
            .filter(|e| now.duration_since(*e.value()) > grace)
            .map(|e| e.key().clone())
            .collect();
        for node in &expired {
            self.purge(node);
        }
        expired
    }

    /// Whether any queue or snapshot exists for `node`
    pub fn contains(&self, node: &str) -> bool {
        self.single.contains_key(node)
            || self.list.contains_key(node)
            || self.store_pool.contains_key(node)
    }
}
