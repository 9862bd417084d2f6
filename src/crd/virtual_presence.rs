//! VirtualPresence resource
//!
//! Records one allocated virtual presence address. The allocator is rebuilt
//! from these objects at startup.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// An address allocated from a gateway's range to one owner
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cloudgateway",
    version = "v1",
    kind = "VirtualPresence",
    plural = "virtualpresences",
    namespaced,
    printcolumn = r#"{"name":"IP","type":"string","jsonPath":".spec.virtualIp"}"#,
    printcolumn = r#"{"name":"Gateway","type":"string","jsonPath":".spec.gatewayName"}"#,
    printcolumn = r#"{"name":"Owner","type":"string","jsonPath":".spec.ownerName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualPresenceSpec {
    /// Allocated address
    pub virtual_ip: String,

    /// Gateway whose range the address belongs to
    pub gateway_name: String,

    /// Kind of the owning resource
    pub owner_kind: String,

    /// Name of the owning resource
    pub owner_name: String,
}

impl VirtualPresence {
    /// Object name of the allocation held by `owner_kind`/`owner_name`
    ///
    /// An owner holds at most one address, so the name does not depend on it.
    pub fn object_name(owner_kind: &str, owner_name: &str) -> String {
        format!("{}-{}", owner_kind.to_lowercase(), owner_name)
    }

    /// Allocator owner key of this allocation
    pub fn owner(&self) -> String {
        owner_key(
            &self.spec.owner_kind,
            self.metadata.namespace.as_deref().unwrap_or_default(),
            &self.spec.owner_name,
        )
    }
}

/// Allocation owner key, `<kind>/<namespace>/<name>`
pub fn owner_key(kind: &str, namespace: &str, name: &str) -> String {
    format!("{}/{}/{}", kind, namespace, name)
}
