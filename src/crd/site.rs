//! ESite and EGateway resources

use ipnet::Ipv4Net;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{parse_ipv4, LifecycleStatus};

/// A logical edge location
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cloudgateway",
    version = "v1",
    kind = "ESite",
    plural = "esites",
    namespaced,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ESiteSpec {
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The gateway of a site and the range its virtual presences come from
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cloudgateway",
    version = "v1",
    kind = "EGateway",
    plural = "egateways",
    status = "LifecycleStatus",
    namespaced,
    printcolumn = r#"{"name":"Site","type":"string","jsonPath":".spec.eSiteName"}"#,
    printcolumn = r#"{"name":"CIDR","type":"string","jsonPath":".spec.virtualPresenceCIDR"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EGatewaySpec {
    /// Gateway address
    pub ip: String,

    /// Range virtual presence addresses are allocated from
    #[serde(rename = "virtualPresenceCIDR")]
    pub virtual_presence_cidr: String,

    /// Site the gateway serves
    pub e_site_name: String,
}

impl EGatewaySpec {
    /// Parsed virtual presence range
    pub fn cidr(&self) -> Result<Ipv4Net, crate::Error> {
        self.virtual_presence_cidr.trim().parse().map_err(|_| {
            crate::Error::validation(format!(
                "virtualPresenceCIDR '{}' is not an IPv4 CIDR",
                self.virtual_presence_cidr
            ))
        })
    }

    /// Check the address, range and site name
    pub fn validate(&self) -> Result<(), crate::Error> {
        parse_ipv4("ip", &self.ip)?;
        self.cidr()?;
        if self.e_site_name.is_empty() {
            return Err(crate::Error::validation("eSiteName must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_yaml_uses_wire_field_names() {
        let yaml = r#"
ip: 192.168.0.1
virtualPresenceCIDR: 10.20.0.0/24
eSiteName: edge-a
"#;
        let spec: EGatewaySpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.e_site_name, "edge-a");
        assert_eq!(spec.cidr().unwrap().prefix_len(), 24);
        assert!(spec.validate().is_ok());

        let back = serde_json::to_value(&spec).unwrap();
        assert_eq!(back["virtualPresenceCIDR"], "10.20.0.0/24");
    }

    #[test]
    fn gateway_validation_rejects_bad_fields() {
        let spec = EGatewaySpec {
            ip: "192.168.0.1".to_string(),
            virtual_presence_cidr: "10.20.0.0/99".to_string(),
            e_site_name: "edge-a".to_string(),
        };
        assert!(spec.validate().is_err());

        let spec = EGatewaySpec {
            ip: "gateway".to_string(),
            virtual_presence_cidr: "10.20.0.0/24".to_string(),
            e_site_name: "edge-a".to_string(),
        };
        assert!(spec.validate().is_err());
    }
}
