//! Custom Resource Definitions for CloudGateway
//!
//! All resources are namespaced and live in group `cloudgateway`, version `v1`.

mod endpoint;
mod policy;
mod service_expose;
mod site;
mod types;
mod virtual_presence;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

pub use endpoint::{EServer, EServerSpec, EService, EServiceSpec, PresenceHolder};
pub use policy::{EPolicy, EPolicySpec};
pub use service_expose::{ExposePhase, ServiceExpose, ServiceExposeSpec, ServiceExposeStatus};
pub use site::{EGateway, EGatewaySpec, ESite, ESiteSpec};
pub use types::{parse_ipv4, Condition, ConditionStatus, LifecyclePhase, LifecycleStatus};
pub use virtual_presence::{owner_key, VirtualPresence, VirtualPresenceSpec};

/// API group of every CloudGateway resource
pub const GROUP: &str = "cloudgateway";

/// API version of every CloudGateway resource
pub const VERSION: &str = "v1";

/// Definitions of all CloudGateway resources
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        ESite::crd(),
        EGateway::crd(),
        EService::crd(),
        EServer::crd(),
        EPolicy::crd(),
        ServiceExpose::crd(),
        VirtualPresence::crd(),
    ]
}

/// All definitions as a multi-document YAML stream
pub fn crd_manifests() -> Result<String, crate::Error> {
    let docs = all_crds()
        .iter()
        .map(|crd| {
            serde_yaml::to_string(crd)
                .map_err(|e| crate::Error::serialization(format!("failed to serialize CRD: {}", e)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(docs.join("---\n"))
}
