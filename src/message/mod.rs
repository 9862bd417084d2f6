//! Tunnel message envelope
//!
//! Every frame on the tunnel carries one [`Message`], encoded as JSON:
//!
//! ```json
//! {"id":"…","parentId":"","timestamp":1700000000000,
//!  "router":{"source":"cloudgateway","group":"hub","resource":"site/edge-a/web:80","operation":"GET"},
//!  "content":{…}}
//! ```
//!
//! A message with a non-empty `parentId` is a response to the message with
//! that id.

pub mod queue;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Error;

pub use queue::MessageQueue;

/// Source name stamped on messages originating in the gateway
pub const SOURCE_CLOUDGATEWAY: &str = "cloudgateway";
/// Group for forwarded service traffic
pub const GROUP_HUB: &str = "hub";
/// Group for data-plane directives
pub const GROUP_CLOUDMESH: &str = "cloudmesh";
/// Group for tunnel control messages
pub const GROUP_CONTROL: &str = "control";

/// Message operation
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    /// Request expecting a response
    Request,
    /// Response to a request
    Response,
    /// Create or update
    Insert,
    /// Remove
    Delete,
    /// Liveness signal
    Keepalive,
    /// Anything else, e.g. an HTTP method from the forwarder
    Other(String),
}

impl Operation {
    /// Wire name
    pub fn as_str(&self) -> &str {
        match self {
            Operation::Request => "request",
            Operation::Response => "response",
            Operation::Insert => "insert",
            Operation::Delete => "delete",
            Operation::Keepalive => "keepalive",
            Operation::Other(op) => op,
        }
    }
}

impl From<String> for Operation {
    fn from(s: String) -> Self {
        match s.as_str() {
            "request" => Operation::Request,
            "response" => Operation::Response,
            "insert" => Operation::Insert,
            "delete" => Operation::Delete,
            "keepalive" => Operation::Keepalive,
            _ => Operation::Other(s),
        }
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing header
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Router {
    /// Sending module
    pub source: String,
    /// Consumer group on the receiving side
    pub group: String,
    /// Slash-delimited resource id
    pub resource: String,
    /// What to do with the resource
    pub operation: Operation,
}

/// Tunnel envelope
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique id
    pub id: String,
    /// Id of the request this message answers, empty otherwise
    #[serde(default)]
    pub parent_id: String,
    /// Creation time in milliseconds since the epoch
    #[serde(default)]
    pub timestamp: i64,
    /// Routing header
    pub router: Router,
    /// Payload
    #[serde(default)]
    pub content: serde_json::Value,
}

impl Message {
    /// Build a new message with a fresh id
    pub fn new(
        source: impl Into<String>,
        group: impl Into<String>,
        resource: impl Into<String>,
        operation: Operation,
        content: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: String::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            router: Router {
                source: source.into(),
                group: group.into(),
                resource: resource.into(),
                operation,
            },
            content,
        }
    }

    /// Keepalive from `source`
    pub fn keepalive(source: impl Into<String>) -> Self {
        Self::new(
            source,
            GROUP_CONTROL,
            "",
            Operation::Keepalive,
            serde_json::Value::Null,
        )
    }

    /// Response to this message
    pub fn reply(&self, source: impl Into<String>, content: serde_json::Value) -> Self {
        let mut reply = Self::new(
            source,
            self.router.group.clone(),
            self.router.resource.clone(),
            Operation::Response,
            content,
        );
        reply.parent_id = self.id.clone();
        reply
    }

    /// Whether this answers an earlier request
    pub fn is_response(&self) -> bool {
        !self.parent_id.is_empty()
    }

    /// Whether this is a keepalive
    pub fn is_keepalive(&self) -> bool {
        self.router.operation == Operation::Keepalive
    }

    /// Serialize to the JSON wire form
    pub fn encode(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the JSON wire form
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// First segment of a resource id
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceScope {
    /// `site/<site>/…`
    Site,
    /// `server/…`
    Server,
    /// `client/…`
    Client,
}

/// A parsed resource id
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resource {
    /// Leading segment
    pub scope: ResourceScope,
    /// Remaining segments
    pub segments: Vec<String>,
}

impl Resource {
    /// Parse a slash-delimited resource id
    pub fn parse(resource: &str) -> Result<Self, Error> {
        let mut parts = resource.split('/');
        let scope = match parts.next() {
            Some("site") => ResourceScope::Site,
            Some("server") => ResourceScope::Server,
            Some("client") => ResourceScope::Client,
            _ => {
                return Err(Error::validation(format!(
                    "resource '{}' must start with site, server or client",
                    resource
                )))
            }
        };
        let segments: Vec<String> = parts.map(str::to_string).collect();
        if scope == ResourceScope::Site && segments.first().map_or(true, |s| s.is_empty()) {
            return Err(Error::validation(format!(
                "resource '{}' names no site",
                resource
            )));
        }
        Ok(Self { scope, segments })
    }

    /// `site/<site>/<rest>`
    pub fn for_site(site: &str, rest: &str) -> String {
        format!("site/{}/{}", site, rest)
    }

    /// Site name for `site/…` resources
    pub fn site(&self) -> Option<&str> {
        match self.scope {
            ResourceScope::Site => self.segments.first().map(String::as_str),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_uses_camel_case_and_string_operation() {
        let mut msg = Message::new(
            SOURCE_CLOUDGATEWAY,
            GROUP_HUB,
            "site/edge-a/web:80",
            Operation::Other("GET".to_string()),
            serde_json::json!({"body": ""}),
        );
        msg.parent_id = "p1".to_string();

        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["parentId"], "p1");
        assert_eq!(json["router"]["operation"], "GET");
        assert_eq!(json["router"]["group"], "hub");
    }

    #[test]
    fn known_operations_parse_to_variants() {
        let raw = br#"{"id":"1","router":{"source":"edge","group":"control","resource":"","operation":"keepalive"}}"#;
        let msg = Message::decode(raw).unwrap();

        assert!(msg.is_keepalive());
        assert!(!msg.is_response());
        assert_eq!(msg.content, serde_json::Value::Null);
    }

    #[test]
    fn reply_links_to_request() {
        let request = Message::new("cloudgateway", GROUP_HUB, "site/a/s:80", Operation::Request, serde_json::Value::Null);
        let reply = request.reply("edge-a", serde_json::json!({"statusCode": 200}));

        assert_eq!(reply.parent_id, request.id);
        assert_eq!(reply.router.operation, Operation::Response);
        assert!(reply.is_response());
        assert_ne!(reply.id, request.id);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(Message::decode(b"{"), Err(Error::Serialization(_))));
    }

    #[test]
    fn site_resource_parses() {
        let resource = Resource::parse("site/edge-a/web:8080").unwrap();
        assert_eq!(resource.scope, ResourceScope::Site);
        assert_eq!(resource.site(), Some("edge-a"));
        assert_eq!(resource.segments, vec!["edge-a", "web:8080"]);
    }

    #[test]
    fn server_and_client_resources_have_no_site() {
        assert_eq!(Resource::parse("server/x").unwrap().site(), None);
        assert_eq!(Resource::parse("client/y").unwrap().scope, ResourceScope::Client);
    }

    #[test]
    fn unknown_scope_and_empty_site_are_rejected() {
        assert!(Resource::parse("pod/x").is_err());
        assert!(Resource::parse("site").is_err());
        assert!(Resource::parse("site//svc").is_err());
    }

    #[test]
    fn for_site_builds_parseable_resource() {
        let id = Resource::for_site("edge-b", "api:443");
        assert_eq!(id, "site/edge-b/api:443");
        assert_eq!(Resource::parse(&id).unwrap().site(), Some("edge-b"));
    }
}
