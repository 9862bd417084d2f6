//! EService and EServer resources
//!
//! Both carry a real address on their site and a `virtualPresenceIp`
//! assigned by the controller from the site gateway's range.

use std::net::Ipv4Addr;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{parse_ipv4, LifecycleStatus};

fn default_protocol() -> String {
    "tcp".to_string()
}

/// A service reachable on an edge or the cloud site
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cloudgateway",
    version = "v1",
    kind = "EService",
    plural = "eservices",
    status = "LifecycleStatus",
    namespaced,
    printcolumn = r#"{"name":"Site","type":"string","jsonPath":".spec.eSiteName"}"#,
    printcolumn = r#"{"name":"VIP","type":"string","jsonPath":".spec.virtualPresenceIp"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EServiceSpec {
    /// Transport protocol
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Service port
    pub port: u16,

    /// Real address on its site
    pub ip: String,

    /// Site hosting the service
    pub e_site_name: String,

    /// Assigned virtual presence address, empty until assigned
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub virtual_presence_ip: String,
}

/// A client host allowed to reach services through policies
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cloudgateway",
    version = "v1",
    kind = "EServer",
    plural = "eservers",
    status = "LifecycleStatus",
    namespaced,
    printcolumn = r#"{"name":"Site","type":"string","jsonPath":".spec.eSiteName"}"#,
    printcolumn = r#"{"name":"VIP","type":"string","jsonPath":".spec.virtualPresenceIp"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EServerSpec {
    /// Server name on its site
    #[serde(default)]
    pub e_server_name: String,

    /// Real address on its site
    pub ip: String,

    /// Site hosting the server
    pub e_site_name: String,

    /// Assigned virtual presence address, empty until assigned
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub virtual_presence_ip: String,
}

/// Resources that receive a virtual presence address
pub trait PresenceHolder {
    /// Kind recorded as the allocation owner
    const OWNER_KIND: &'static str;

    /// Site the resource lives on
    fn site(&self) -> &str;

    /// Real address
    fn real_ip(&self) -> &str;

    /// Assigned virtual presence address, empty until assigned
    fn virtual_presence_ip(&self) -> &str;

    /// Parsed real address
    fn parsed_real_ip(&self) -> Result<Ipv4Addr, crate::Error> {
        parse_ipv4("ip", self.real_ip())
    }

    /// Parsed virtual presence address, `None` until assigned
    fn parsed_virtual_presence_ip(&self) -> Result<Option<Ipv4Addr>, crate::Error> {
        match self.virtual_presence_ip() {
            "" => Ok(None),
            vip => parse_ipv4("virtualPresenceIp", vip).map(Some),
        }
    }
}

impl PresenceHolder for EService {
    const OWNER_KIND: &'static str = "EService";

    fn site(&self) -> &str {
        &self.spec.e_site_name
    }

    fn real_ip(&self) -> &str {
        &self.spec.ip
    }

    fn virtual_presence_ip(&self) -> &str {
        &self.spec.virtual_presence_ip
    }
}

impl PresenceHolder for EServer {
    const OWNER_KIND: &'static str = "EServer";

    fn site(&self) -> &str {
        &self.spec.e_site_name
    }

    fn real_ip(&self) -> &str {
        &self.spec.ip
    }

    fn virtual_presence_ip(&self) -> &str {
        &self.spec.virtual_presence_ip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_defaults_protocol_and_empty_vip() {
        let yaml = r#"
port: 8080
ip: 192.168.1.5
eSiteName: cloud
"#;
        let spec: EServiceSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.protocol, "tcp");
        assert!(spec.virtual_presence_ip.is_empty());

        let service = EService::new("web", spec);
        assert_eq!(service.parsed_virtual_presence_ip().unwrap(), None);
        assert_eq!(
            service.parsed_real_ip().unwrap(),
            Ipv4Addr::new(192, 168, 1, 5)
        );
    }

    #[test]
    fn server_reports_assigned_vip() {
        let server = EServer::new(
            "db-client",
            EServerSpec {
                e_server_name: "db-client".to_string(),
                ip: "192.168.2.7".to_string(),
                e_site_name: "edge-a".to_string(),
                virtual_presence_ip: "10.10.0.2".to_string(),
            },
        );
        assert_eq!(server.site(), "edge-a");
        assert_eq!(
            server.parsed_virtual_presence_ip().unwrap(),
            Some(Ipv4Addr::new(10, 10, 0, 2))
        );
        assert_eq!(EServer::OWNER_KIND, "EServer");
    }
}
