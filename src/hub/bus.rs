//! Dispatch of inbound edge messages to in-process consumers by group

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::message::Message;

/// Consumer of one message group
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle a message from `node`; a returned message is sent back to it
    async fn handle(&self, node: &str, msg: Message) -> Option<Message>;
}

/// Group name to handler map
#[derive(Default)]
pub struct GroupBus {
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
}

impl GroupBus {
    /// Empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages of `group` to `handler`, replacing any previous handler
    pub fn register(&self, group: &str, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(group.to_string(), handler);
    }

    /// Hand `msg` to its group's handler; messages for unknown groups are dropped
    pub async fn dispatch(&self, node: &str, msg: Message) -> Option<Message> {
        let handler = self.handlers.get(&msg.router.group).map(|h| h.clone());
        match handler {
            Some(handler) => handler.handle(node, msg).await,
            None => {
                debug!(node = %node, group = %msg.router.group, "No consumer for message group");
                None
            }
        }
    }
}
