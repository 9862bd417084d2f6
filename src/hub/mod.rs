//! Edge tunnel server
//!
//! Edges connect over WebSocket or QUIC with a client certificate signed by the
//! gateway CA. The certificate CN is the node id. Every connection runs the same
//! session:
//!
//! - a keepalive check that closes the session when no keepalive arrives
//!   within `keepaliveInterval`
//! - two write loops draining the node's single and list queues, each write
//!   bounded by `writeTimeout`
//! - a read loop that records keepalives, completes pending synchronous sends
//!   and dispatches everything else through the [`GroupBus`]
//!
//! All loops stop on the session's cancellation token, which is cancelled by
//! any loop that fails, by a replacing connection, or by process shutdown.

pub mod bus;
pub mod quic;
pub mod registry;
pub mod transport;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CloudHubConfig;
use crate::message::queue::SharedReceiver;
use crate::message::{Message, MessageQueue};
use crate::pki::EdgeIdentity;
use crate::Error;

pub use bus::{GroupBus, MessageHandler};
pub use registry::{NodeRegistry, RegisterError, SessionHandle};
pub use transport::{MessageReader, MessageWriter, TransportError};

type SharedWriter = Arc<Mutex<Box<dyn MessageWriter>>>;

/// Session timing and limits
#[derive(Clone, Debug)]
pub struct HubSettings {
    /// Close a session after this long without a keepalive
    pub keepalive_interval: Duration,
    /// Upper bound for a single write
    pub write_timeout: Duration,
    /// Maximum concurrently connected edges
    pub node_limit: usize,
}

impl From<&CloudHubConfig> for HubSettings {
    fn from(config: &CloudHubConfig) -> Self {
        Self {
            keepalive_interval: config.keepalive_interval(),
            write_timeout: config.write_timeout(),
            node_limit: config.node_limit,
        }
    }
}

/// Sending messages to edge nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Queue `msg` for `node` without waiting
    fn publish(&self, node: &str, msg: Message);

    /// Queue a `kind` snapshot for `node`, replayed when it reconnects
    fn publish_list(&self, node: &str, kind: &str, msg: Message);

    /// Send `msg` to `node` and wait up to `timeout` for its response
    async fn send_sync(&self, node: &str, msg: Message, timeout: Duration)
        -> Result<Message, Error>;
}

/// The tunnel server state shared by all listeners
pub struct CloudHub {
    settings: HubSettings,
    registry: NodeRegistry,
    queue: Arc<MessageQueue>,
    bus: Arc<GroupBus>,
    cancel: CancellationToken,
}

impl CloudHub {
    /// Create a hub; `cancel` stops every session when cancelled
    pub fn new(
        settings: HubSettings,
        queue: Arc<MessageQueue>,
        bus: Arc<GroupBus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            registry: NodeRegistry::new(),
            queue,
            bus,
            cancel,
        }
    }

    /// Connected node registry
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Outbound queues
    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// Run one edge session to completion
    ///
    /// Returns once the connection is closed for any reason. Rejected
    /// connections (node limit) return an error after closing the writer.
    pub async fn serve_connection(
        self: &Arc<Self>,
        identity: EdgeIdentity,
        mut reader: Box<dyn MessageReader>,
        mut writer: Box<dyn MessageWriter>,
    ) -> Result<(), Error> {
        let node = identity.node_id.clone();

        let session = match self
            .registry
            .register(&identity, self.settings.node_limit, &self.cancel)
        {
            Ok(session) => session,
            Err(e) => {
                warn!(node = %node, error = %e, "Rejecting connection");
                writer.close().await;
                return Err(Error::transport(e.to_string()));
            }
        };
        info!(node = %node, project = %identity.project_id, "Edge connected");

        self.queue.mark_connected(&node);
        self.queue.replay(&node).await;

        let writer: SharedWriter = Arc::new(Mutex::new(writer));

        let keepalive = tokio::spawn(keepalive_check_loop(
            node.clone(),
            session.clone(),
            self.settings.keepalive_interval,
        ));
        let single = tokio::spawn(write_loop(
            node.clone(),
            "single",
            self.queue.single_receiver(&node),
            writer.clone(),
            session.cancel.clone(),
            self.settings.write_timeout,
        ));
        let list = tokio::spawn(write_loop(
            node.clone(),
            "list",
            self.queue.list_receiver(&node),
            writer.clone(),
            session.cancel.clone(),
            self.settings.write_timeout,
        ));

        self.read_loop(&node, reader.as_mut(), &session.cancel).await;

        session.cancel.cancel();
        let _ = tokio::join!(keepalive, single, list);
        writer.lock().await.close().await;

        if self.registry.unregister(&node, session.session_id) {
            self.queue.mark_disconnected(&node);
            info!(node = %node, "Edge disconnected");
        } else {
            debug!(node = %node, "Superseded session closed");
        }
        Ok(())
    }

    /// Periodically purge queues of nodes disconnected longer than `grace`
    pub async fn run_queue_purge(self: Arc<Self>, grace: Duration, cancel: CancellationToken) {
        let period = (grace / 4).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    for node in self.queue.purge_expired(grace) {
                        info!(node = %node, "Purged queues of disconnected edge");
                    }
                }
            }
        }
    }

    async fn read_loop(&self, node: &str, reader: &mut dyn MessageReader, cancel: &CancellationToken) {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => return,
                read = reader.read_message() => match read {
                    Ok(Some(msg)) => msg,
                    Ok(None) => {
                        debug!(node = %node, "Connection closed by edge");
                        cancel.cancel();
                        return;
                    }
                    Err(e) => {
                        warn!(node = %node, error = %e, "Read failed, closing connection");
                        cancel.cancel();
                        return;
                    }
                },
            };

            if msg.is_keepalive() {
                self.registry.keepalive(node);
                continue;
            }

            if msg.is_response() && self.registry.deliver(node, msg.clone()) {
                continue;
            }

            if let Some(reply) = self.bus.dispatch(node, msg).await {
                self.queue.publish(node, reply);
            }
        }
    }
}

async fn keepalive_check_loop(node: String, session: SessionHandle, interval: Duration) {
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => return,
            _ = session.keepalive.notified() => continue,
            _ = tokio::time::sleep(interval) => {
                warn!(node = %node, interval_secs = interval.as_secs(), "Keepalive timeout, closing connection");
                session.cancel.cancel();
                return;
            }
        }
    }
}

async fn write_loop(
    node: String,
    channel: &'static str,
    receiver: SharedReceiver,
    writer: SharedWriter,
    cancel: CancellationToken,
    write_timeout: Duration,
) {
    let mut rx = tokio::select! {
        _ = cancel.cancelled() => return,
        rx = receiver.lock() => rx,
    };

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => return,
            },
        };

        let result = tokio::time::timeout(write_timeout, async {
            writer.lock().await.write_message(&msg).await
        })
        .await
        .unwrap_or(Err(TransportError::Timeout));

        if let Err(e) = result {
            warn!(node = %node, channel, message = %msg.id, error = %e, "Write failed, closing connection");
            cancel.cancel();
            return;
        }
    }
}

#[async_trait]
impl MessageSender for CloudHub {
    fn publish(&self, node: &str, msg: Message) {
        self.queue.publish(node, msg);
    }

    fn publish_list(&self, node: &str, kind: &str, msg: Message) {
        self.queue.publish_list(node, kind, msg);
    }

    async fn send_sync(
        &self,
        node: &str,
        msg: Message,
        timeout: Duration,
    ) -> Result<Message, Error> {
        if !self.registry.is_connected(node) {
            return Err(Error::transport(format!("node {} is not connected", node)));
        }

        let id = msg.id.clone();
        let rx = self.registry.add_waiter(node, &id);
        self.queue.publish(node, msg);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::transport(format!(
                "response channel for message {} closed",
                id
            ))),
            Err(_) => {
                self.registry.remove_waiter(&id);
                Err(Error::timeout(format!(
                    "no response for message {} within {}s",
                    id,
                    timeout.as_secs()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::transport::{channel_transport, ChannelPeer};
    use super::*;
    use crate::message::{Operation, GROUP_CLOUDMESH, GROUP_HUB};
    use std::sync::Mutex as StdMutex;

    fn settings() -> HubSettings {
        HubSettings {
            keepalive_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            node_limit: 10,
        }
    }

    fn identity(node: &str) -> EdgeIdentity {
        EdgeIdentity {
            node_id: node.to_string(),
            project_id: "default".to_string(),
        }
    }

    fn hub_with(settings: HubSettings, bus: GroupBus) -> Arc<CloudHub> {
        Arc::new(CloudHub::new(
            settings,
            Arc::new(MessageQueue::new()),
            Arc::new(bus),
            CancellationToken::new(),
        ))
    }

    fn connect(
        hub: &Arc<CloudHub>,
        node: &str,
    ) -> (tokio::task::JoinHandle<Result<(), Error>>, ChannelPeer) {
        let (reader, writer, peer) = channel_transport();
        let hub = hub.clone();
        let identity = identity(node);
        let task = tokio::spawn(async move {
            hub.serve_connection(identity, Box::new(reader), Box::new(writer))
                .await
        });
        (task, peer)
    }

    fn data(resource: &str) -> Message {
        Message::new("cloudgateway", GROUP_HUB, resource, Operation::Insert, serde_json::Value::Null)
    }

    struct Echo(StdMutex<Vec<String>>);

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, node: &str, msg: Message) -> Option<Message> {
            self.0.lock().unwrap().push(node.to_string());
            Some(msg.reply("cloudgateway", serde_json::json!("ack")))
        }
    }

    #[tokio::test]
    async fn queued_messages_are_written_in_order() {
        let hub = hub_with(settings(), GroupBus::new());
        for i in 0..3 {
            hub.publish("edge-a", data(&format!("site/edge-a/{}", i)));
        }

        let (_task, mut peer) = connect(&hub, "edge-a");
        for i in 0..3 {
            let msg = peer.inbox.recv().await.unwrap();
            assert_eq!(msg.router.resource, format!("site/edge-a/{}", i));
        }
    }

    #[tokio::test]
    async fn list_snapshots_are_replayed_on_connect() {
        let hub = hub_with(settings(), GroupBus::new());
        hub.publish_list("edge-a", "directives", data("site/edge-a/directives"));

        let (_task, mut peer) = connect(&hub, "edge-a");
        let msg = peer.inbox.recv().await.unwrap();
        assert_eq!(msg.router.resource, "site/edge-a/directives");
    }

    #[tokio::test]
    async fn inbound_messages_go_through_the_bus() {
        let bus = GroupBus::new();
        let echo = Arc::new(Echo(StdMutex::new(Vec::new())));
        bus.register(GROUP_CLOUDMESH, echo.clone());
        let hub = hub_with(settings(), bus);

        let (_task, mut peer) = connect(&hub, "edge-a");
        let request = Message::new("edge-a", GROUP_CLOUDMESH, "site/cloud/x", Operation::Insert, serde_json::Value::Null);
        peer.outbox.send(request.clone()).unwrap();

        let reply = peer.inbox.recv().await.unwrap();
        assert_eq!(reply.parent_id, request.id);
        assert_eq!(*echo.0.lock().unwrap(), vec!["edge-a"]);
    }

    #[tokio::test]
    async fn send_sync_returns_the_edge_response() {
        let hub = hub_with(settings(), GroupBus::new());
        let (_task, mut peer) = connect(&hub, "edge-a");
        assert!(hub.registry().wait_for_connection("edge-a", Duration::from_secs(5)).await);

        let edge = tokio::spawn(async move {
            let request = peer.inbox.recv().await.unwrap();
            peer.outbox
                .send(request.reply("edge-a", serde_json::json!({"statusCode": 200})))
                .unwrap();
            peer
        });

        let reply = hub
            .send_sync("edge-a", data("site/edge-a/web:80"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply.content["statusCode"], 200);
        let _peer = edge.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn send_sync_times_out_without_response() {
        let hub = hub_with(settings(), GroupBus::new());
        let (_task, _peer) = connect(&hub, "edge-a");
        assert!(hub.registry().wait_for_connection("edge-a", Duration::from_secs(5)).await);

        let err = hub
            .send_sync("edge-a", data("site/edge-a/web:80"), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn send_sync_to_unknown_node_fails_fast() {
        let hub = hub_with(settings(), GroupBus::new());
        let err = hub
            .send_sync("ghost", data("site/ghost/x:1"), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not connected"));
    }

    #[tokio::test]
    async fn node_limit_rejects_excess_connections() {
        let mut limited = settings();
        limited.node_limit = 1;
        let hub = hub_with(limited, GroupBus::new());

        let (_task, _peer) = connect(&hub, "edge-a");
        assert!(hub.registry().wait_for_connection("edge-a", Duration::from_secs(5)).await);

        let (task, mut peer) = connect(&hub, "edge-b");
        assert!(task.await.unwrap().is_err());
        assert!(peer.inbox.recv().await.is_none());
        assert!(!hub.registry().is_connected("edge-b"));
    }

    #[tokio::test]
    async fn edge_close_unregisters_and_keeps_queue() {
        let hub = hub_with(settings(), GroupBus::new());
        let (task, peer) = connect(&hub, "edge-a");
        assert!(hub.registry().wait_for_connection("edge-a", Duration::from_secs(5)).await);

        drop(peer);
        task.await.unwrap().unwrap();

        assert!(!hub.registry().is_connected("edge-a"));
        hub.publish("edge-a", data("site/edge-a/later"));
        assert!(hub.queue().contains("edge-a"));
    }

    // ==========================================================================
    // Story Tests: Edge Liveness
    // ==========================================================================

    /// Story: An edge that stops sending keepalives is disconnected
    ///
    /// Keepalives reset the timer; once they stop, the session closes within
    /// one interval and the node leaves the registry.
    #[tokio::test(start_paused = true)]
    async fn story_keepalive_loss_closes_the_session() {
        let hub = hub_with(settings(), GroupBus::new());
        let (task, mut peer) = connect(&hub, "edge-a");
        assert!(hub.registry().wait_for_connection("edge-a", Duration::from_secs(5)).await);

        // Keepalives every 20s keep the session up past the 30s interval
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            peer.outbox.send(Message::keepalive("edge-a")).unwrap();
        }
        assert!(hub.registry().is_connected("edge-a"));

        // Silence: the session closes within the interval
        tokio::time::sleep(Duration::from_secs(31)).await;
        task.await.unwrap().unwrap();
        assert!(!hub.registry().is_connected("edge-a"));
        assert!(peer.inbox.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn queue_purge_drops_long_disconnected_nodes() {
        let hub = hub_with(settings(), GroupBus::new());
        hub.queue().publish("edge-gone", data("site/edge-gone/x"));
        hub.queue().mark_disconnected("edge-gone");
        let cancel = CancellationToken::new();
        let sweeper = tokio::spawn(
            hub.clone()
                .run_queue_purge(Duration::from_secs(60), cancel.clone()),
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(hub.queue().contains("edge-gone"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!hub.queue().contains("edge-gone"));

        cancel.cancel();
        sweeper.await.unwrap();
    }

    /// Story: A reconnecting edge replaces its old connection
    #[tokio::test]
    async fn story_reconnect_replaces_old_connection() {
        let hub = hub_with(settings(), GroupBus::new());

        let (old_task, _old_peer) = connect(&hub, "edge-a");
        assert!(hub.registry().wait_for_connection("edge-a", Duration::from_secs(5)).await);

        let (_new_task, mut new_peer) = connect(&hub, "edge-a");
        old_task.await.unwrap().unwrap();

        // The new session still owns the node and drains its queue
        assert!(hub.registry().is_connected("edge-a"));
        hub.publish("edge-a", data("site/edge-a/after"));
        let msg = new_peer.inbox.recv().await.unwrap();
        assert_eq!(msg.router.resource, "site/edge-a/after");
    }
}
