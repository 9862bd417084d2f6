//! Routing directives to the site that programs them
//!
//! Directives for the cloud site go to the local [`Programmer`]. Directives
//! for an edge site are queued for that site's node as `cloudmesh` messages;
//! after every change the site's full directive set is published on the list
//! channel so a reconnecting edge receives the current state.
//!
//! Two exposes may plan the same directive. The dispatcher tracks which
//! owners hold each directive and only withdraws it when the last owner
//! releases it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Directive, DirectiveOp, Programmer};
use crate::hub::{MessageHandler, MessageSender};
use crate::message::{Message, Operation, Resource, GROUP_CLOUDMESH, SOURCE_CLOUDGATEWAY};
use crate::Error;

/// List-channel kind carrying a site's directive set
pub const DIRECTIVES_KIND: &str = "directives";

/// Resource suffix of a single directive message
pub const DIRECTIVE_RESOURCE: &str = "directive";

/// Destination for directives produced by reconciliation
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DirectiveSink: Send + Sync {
    /// Apply `directive` on behalf of `owner`, or release `owner`'s claim
    /// on it; the directive is withdrawn once no owner holds it
    async fn dispatch(&self, owner: &str, op: DirectiveOp, directive: &Directive)
        -> Result<(), Error>;
}

/// Dispatches to the local programmer or through the tunnel
pub struct TunnelDispatcher {
    cloud_site: String,
    programmer: Arc<Programmer>,
    sender: Arc<dyn MessageSender>,
    snapshots: DashMap<String, BTreeSet<Directive>>,
    /// Claims per directive; held across programming so apply and withdraw
    /// of one directive never interleave
    owners: Mutex<HashMap<Directive, BTreeSet<String>>>,
}

impl TunnelDispatcher {
    /// Create a dispatcher; directives for `cloud_site` are programmed locally
    pub fn new(
        cloud_site: impl Into<String>,
        programmer: Arc<Programmer>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            cloud_site: cloud_site.into(),
            programmer,
            sender,
            snapshots: DashMap::new(),
            owners: Mutex::new(HashMap::new()),
        }
    }

    /// Owners currently holding `directive`
    pub async fn owners(&self, directive: &Directive) -> Vec<String> {
        self.owners
            .lock()
            .await
            .get(directive)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Directives currently held for `site`
    pub fn snapshot(&self, site: &str) -> Vec<Directive> {
        self.snapshots
            .get(site)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record(&self, op: DirectiveOp, directive: &Directive) -> Vec<Directive> {
        let mut set = self.snapshots.entry(directive.site.clone()).or_default();
        match op {
            DirectiveOp::Apply => {
                set.insert(directive.clone());
            }
            DirectiveOp::Remove => {
                set.remove(directive);
            }
        }
        set.iter().cloned().collect()
    }
}

#[async_trait]
impl DirectiveSink for TunnelDispatcher {
    async fn dispatch(
        &self,
        owner: &str,
        op: DirectiveOp,
        directive: &Directive,
    ) -> Result<(), Error> {
        let mut owners = self.owners.lock().await;
        match op {
            DirectiveOp::Apply => {
                owners
                    .entry(directive.clone())
                    .or_default()
                    .insert(owner.to_string());
            }
            DirectiveOp::Remove => {
                // Unknown directives are withdrawn; claims are not persisted
                // across restarts
                if let Some(holders) = owners.get_mut(directive) {
                    holders.remove(owner);
                    if !holders.is_empty() {
                        debug!(
                            directive = %directive,
                            owner = %owner,
                            remaining = holders.len(),
                            "Directive still claimed, keeping it"
                        );
                        return Ok(());
                    }
                    owners.remove(directive);
                }
            }
        }
        self.forward(op, directive).await
    }
}

impl TunnelDispatcher {
    async fn forward(&self, op: DirectiveOp, directive: &Directive) -> Result<(), Error> {
        if directive.site == self.cloud_site {
            return Ok(self.programmer.program(op, directive).await?);
        }

        let site = directive.site.as_str();
        let operation = match op {
            DirectiveOp::Apply => Operation::Insert,
            DirectiveOp::Remove => Operation::Delete,
        };
        let msg = Message::new(
            SOURCE_CLOUDGATEWAY,
            GROUP_CLOUDMESH,
            Resource::for_site(site, DIRECTIVE_RESOURCE),
            operation,
            serde_json::to_value(directive)?,
        );
        debug!(site = %site, directive = %directive, ?op, "Queueing directive for edge");
        self.sender.publish(site, msg);

        let snapshot = self.record(op, directive);
        let list = Message::new(
            SOURCE_CLOUDGATEWAY,
            GROUP_CLOUDMESH,
            Resource::for_site(site, DIRECTIVES_KIND),
            Operation::Insert,
            serde_json::to_value(&snapshot)?,
        );
        self.sender.publish_list(site, DIRECTIVES_KIND, list);
        Ok(())
    }
}

/// `cloudmesh` group consumer programming directives pushed by edges
pub struct CloudMeshHandler {
    cloud_site: String,
    programmer: Arc<Programmer>,
}

impl CloudMeshHandler {
    /// Accept directives addressed to `cloud_site`
    pub fn new(cloud_site: impl Into<String>, programmer: Arc<Programmer>) -> Self {
        Self {
            cloud_site: cloud_site.into(),
            programmer,
        }
    }

    async fn program(&self, msg: &Message) -> Result<(), Error> {
        let op = match msg.router.operation {
            Operation::Insert => DirectiveOp::Apply,
            Operation::Delete => DirectiveOp::Remove,
            ref other => {
                return Err(Error::validation(format!(
                    "unsupported cloudmesh operation {}",
                    other
                )))
            }
        };
        let directive: Directive = serde_json::from_value(msg.content.clone())?;
        if directive.site != self.cloud_site {
            return Err(Error::validation(format!(
                "directive for site {} cannot be programmed on {}",
                directive.site, self.cloud_site
            )));
        }
        Ok(self.programmer.program(op, &directive).await?)
    }
}

#[async_trait]
impl MessageHandler for CloudMeshHandler {
    async fn handle(&self, node: &str, msg: Message) -> Option<Message> {
        let content = match self.program(&msg).await {
            Ok(()) => json!({"status": "ok"}),
            Err(e) => {
                warn!(node = %node, message = %msg.id, error = %e, "Rejected directive from edge");
                json!({"error": e.to_string()})
            }
        };
        Some(msg.reply(SOURCE_CLOUDGATEWAY, content))
    }
}
