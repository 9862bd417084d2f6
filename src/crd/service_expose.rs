//! ServiceExpose resource

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::dataplane::Directive;

/// Exposes one `EService` to the servers allowed by a set of policies
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cloudgateway",
    version = "v1",
    kind = "ServiceExpose",
    plural = "serviceexposes",
    status = "ServiceExposeStatus",
    namespaced,
    printcolumn = r#"{"name":"Service","type":"string","jsonPath":".spec.eServiceName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExposeSpec {
    /// Name of the exposed `EService`
    pub e_service_name: String,

    /// Name the forwarder resolves to this service
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dns_name: String,

    /// Sites whose servers may use the service; empty allows every site
    #[serde(default)]
    pub e_sites: Vec<String>,

    /// Names of `EPolicy` objects listing allowed servers
    #[serde(default)]
    pub e_policies: Vec<String>,
}

impl ServiceExposeSpec {
    /// Whether servers on `site` may use the service
    pub fn admits_site(&self, site: &str) -> bool {
        self.e_sites.is_empty() || self.e_sites.iter().any(|s| s == site)
    }
}

/// ServiceExpose lifecycle phase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExposePhase {
    /// Not yet reconciled
    #[default]
    Pending,
    /// Directives are programmed
    Active,
    /// A referenced resource is missing or not ready
    Error,
}

impl std::fmt::Display for ExposePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Active => write!(f, "Active"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Status for a ServiceExpose
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExposeStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ExposePhase,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Directives programmed for this object, removed on teardown
    #[serde(default)]
    pub applied_directives: Vec<Directive>,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ServiceExposeStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: ExposePhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Set the applied directives and return self for chaining
    pub fn directives(mut self, directives: Vec<Directive>) -> Self {
        self.applied_directives = directives;
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }

    /// Set the observed generation and return self for chaining
    pub fn observed(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Same outcome as `other`, ignoring condition transition times
    pub fn is_equivalent(&self, other: &Self) -> bool {
        let conditions = |s: &Self| {
            s.conditions
                .iter()
                .map(|c| (c.type_.clone(), c.status.clone(), c.reason.clone(), c.message.clone()))
                .collect::<Vec<_>>()
        };
        self.phase == other.phase
            && self.message == other.message
            && self.applied_directives == other.applied_directives
            && self.observed_generation == other.observed_generation
            && conditions(self) == conditions(other)
    }
}
