//! EPolicy resource

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Allow-list of servers permitted to reach an exposed service
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cloudgateway",
    version = "v1",
    kind = "EPolicy",
    plural = "epolicies",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EPolicySpec {
    /// Names of allowed `EServer` objects
    #[serde(default)]
    pub e_servers: Vec<String>,
}

impl EPolicySpec {
    /// Whether `server` is on the allow-list
    pub fn allows(&self, server: &str) -> bool {
        self.e_servers.iter().any(|s| s == server)
    }
}
