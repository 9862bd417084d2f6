//! Gateway configuration file
//!
//! The configuration is a YAML document with a `kubeAPIConfig` section and a
//! `modules` map. Every field has a default, so an empty file yields a working
//! single-node setup. The loaded value is validated once at startup and then
//! shared read-only.
//!
//! ```yaml
//! kubeAPIConfig:
//!   kubeConfig: /root/.kube/config
//! modules:
//!   cloudHub:
//!     keepaliveInterval: 30
//!     advertiseAddress: ["10.0.0.1"]
//!     websocket:
//!       port: 10000
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cloudgateway/config/cloudgateway.yaml";

/// Default kubeconfig location
pub const DEFAULT_KUBECONFIG_PATH: &str = "/root/.kube/config";

/// Default port for the WebSocket tunnel listener
pub const DEFAULT_WEBSOCKET_PORT: u16 = 10000;

/// Default port for the QUIC tunnel listener
pub const DEFAULT_QUIC_PORT: u16 = 10001;

/// Default port for the HTTPS bootstrap server
pub const DEFAULT_HTTPS_PORT: u16 = 10002;

/// Default port for the TAP stream listener
pub const DEFAULT_STREAM_PORT: u16 = 10004;

/// Default port for the local HTTP forwarder
pub const DEFAULT_FORWARDER_PORT: u16 = 10080;

/// Top-level gateway configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudGatewayConfig {
    /// How to reach the Kubernetes API server
    #[serde(rename = "kubeAPIConfig")]
    pub kube_api_config: KubeApiConfig,
    /// Per-module settings
    pub modules: Modules,
}

/// Kubernetes API server connection settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct KubeApiConfig {
    /// API server URL, overrides the kubeconfig cluster server when set
    pub master: String,
    /// Absolute path to a kubeconfig file
    pub kube_config: String,
}

impl Default for KubeApiConfig {
    fn default() -> Self {
        Self {
            master: String::new(),
            kube_config: DEFAULT_KUBECONFIG_PATH.to_string(),
        }
    }
}

/// Module settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Modules {
    /// Certificate endpoint and tunnel server
    #[serde(alias = "CloudHub")]
    pub cloud_hub: CloudHubConfig,
    /// ServiceExpose, EService and EServer controllers
    #[serde(alias = "ServiceExpose")]
    pub service_expose: ServiceExposeConfig,
    /// TAP tunnel and data-plane programmer
    #[serde(alias = "CloudMesh")]
    pub cloud_mesh: CloudMeshConfig,
    /// Local HTTP forwarder
    #[serde(alias = "CloudService")]
    pub cloud_service: CloudServiceConfig,
}

/// CloudHub module settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudHubConfig {
    /// Whether the hub runs at all
    pub enable: bool,
    /// Seconds without a keepalive before an edge connection is closed
    pub keepalive_interval: u64,
    /// Maximum number of concurrently connected edges
    pub node_limit: usize,
    /// CA certificate file (PEM)
    #[serde(rename = "tlsCAFile")]
    pub tls_ca_file: PathBuf,
    /// CA private key file (PEM)
    #[serde(rename = "tlsCAKeyFile")]
    pub tls_ca_key_file: PathBuf,
    /// Server certificate file (PEM)
    pub tls_cert_file: PathBuf,
    /// Server private key file (PEM)
    pub tls_private_key_file: PathBuf,
    /// Seconds a single tunnel write may take
    pub write_timeout: u64,
    /// Addresses edges use to reach the hub, used as server certificate SANs
    pub advertise_address: Vec<String>,
    /// Validity of signed edge certificates, in days
    pub edge_cert_signing_duration: u64,
    /// Interval between join token refreshes, in hours
    pub token_refresh_duration: u64,
    /// Seconds a disconnected node keeps its queued messages
    pub node_queue_grace_period: u64,
    /// Namespace holding the CA, server and token secrets
    pub secret_namespace: String,
    /// QUIC transport
    #[serde(alias = "Quic")]
    pub quic: QuicConfig,
    /// WebSocket transport
    #[serde(alias = "WebSocket")]
    pub websocket: ListenerConfig,
    /// HTTPS bootstrap server
    #[serde(alias = "HTTPS")]
    pub https: ListenerConfig,
}

impl Default for CloudHubConfig {
    fn default() -> Self {
        Self {
            enable: true,
            keepalive_interval: 30,
            node_limit: 1000,
            tls_ca_file: PathBuf::from("/etc/cloudgateway/ca/rootCA.crt"),
            tls_ca_key_file: PathBuf::from("/etc/cloudgateway/ca/rootCA.key"),
            tls_cert_file: PathBuf::from("/etc/cloudgateway/certs/server.crt"),
            tls_private_key_file: PathBuf::from("/etc/cloudgateway/certs/server.key"),
            write_timeout: 30,
            advertise_address: vec!["127.0.0.1".to_string()],
            edge_cert_signing_duration: 365,
            token_refresh_duration: 12,
            node_queue_grace_period: 300,
            secret_namespace: "cloudgateway".to_string(),
            quic: QuicConfig::default(),
            websocket: ListenerConfig::enabled_on(DEFAULT_WEBSOCKET_PORT),
            https: ListenerConfig::enabled_on(DEFAULT_HTTPS_PORT),
        }
    }
}

impl CloudHubConfig {
    /// Keepalive interval as a duration
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval)
    }

    /// Write timeout as a duration
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }

    /// Token refresh interval as a duration
    pub fn token_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.token_refresh_duration * 3600)
    }

    /// Grace period for disconnected node queues
    pub fn node_queue_grace_period(&self) -> Duration {
        Duration::from_secs(self.node_queue_grace_period)
    }

    /// Advertise addresses parsed as IPs
    pub fn advertise_ips(&self) -> Result<Vec<IpAddr>, Error> {
        self.advertise_address
            .iter()
            .map(|addr| {
                addr.parse::<IpAddr>().map_err(|_| {
                    Error::configuration(format!("advertise address '{}' is not an IP", addr))
                })
            })
            .collect()
    }
}

/// A plain listener toggle
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ListenerConfig {
    /// Whether the listener is started
    pub enable: bool,
    /// Bind address
    pub address: IpAddr,
    /// Bind port
    pub port: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::enabled_on(0)
    }
}

impl ListenerConfig {
    /// An enabled listener on all interfaces at `port`
    pub fn enabled_on(port: u16) -> Self {
        Self {
            enable: true,
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
        }
    }

    /// Socket address to bind
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.address, self.port)
    }
}

/// QUIC listener settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct QuicConfig {
    /// Whether the listener is started
    pub enable: bool,
    /// Bind address
    pub address: IpAddr,
    /// Bind port
    pub port: u16,
    /// Concurrent bidirectional streams allowed per connection
    pub max_incoming_streams: u32,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            enable: false,
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_QUIC_PORT,
            max_incoming_streams: 10000,
        }
    }
}

impl QuicConfig {
    /// Socket address to bind
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.address, self.port)
    }
}

/// ServiceExpose controller settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceExposeConfig {
    /// Whether the controllers run
    pub enable: bool,
    /// Concurrent reconciles per controller
    pub threadiness: u16,
    /// Site name that denotes this cloud; directives for it are applied locally
    pub cloud_site_name: String,
}

impl Default for ServiceExposeConfig {
    fn default() -> Self {
        Self {
            enable: true,
            threadiness: 1,
            cloud_site_name: "cloud".to_string(),
        }
    }
}

/// TAP tunnel and data-plane settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudMeshConfig {
    /// Whether the `/stream` listener runs
    pub enable: bool,
    /// `/stream` listener
    pub listener: ListenerConfig,
    /// TAP interface name
    pub tap_name: String,
    /// TAP interface address, the next hop for host routes
    pub tap_ip: Ipv4Addr,
    /// TAP interface netmask
    pub tap_netmask: Ipv4Addr,
    /// TAP interface MTU
    pub mtu: u16,
    /// Record rules and routes in memory instead of touching the host
    pub dry_run: bool,
}

impl Default for CloudMeshConfig {
    fn default() -> Self {
        Self {
            enable: false,
            listener: ListenerConfig::enabled_on(DEFAULT_STREAM_PORT),
            tap_name: crate::DEFAULT_TAP_NAME.to_string(),
            tap_ip: crate::DEFAULT_TAP_IP,
            tap_netmask: crate::DEFAULT_TAP_NETMASK,
            mtu: 1500,
            dry_run: false,
        }
    }
}

/// Local HTTP forwarder settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudServiceConfig {
    /// Whether the forwarder runs
    pub enable: bool,
    /// Port on 127.0.0.1
    pub port: u16,
}

impl Default for CloudServiceConfig {
    fn default() -> Self {
        Self {
            enable: false,
            port: DEFAULT_FORWARDER_PORT,
        }
    }
}

impl CloudGatewayConfig {
    /// Read, parse and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(content: &str) -> Result<Self, Error> {
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| Error::configuration(format!("failed to parse config: {}", e)))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as YAML
    pub fn to_yaml(&self) -> Result<String, Error> {
        serde_yaml::to_string(self).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Check the configuration for values the gateway cannot start with
    pub fn validate(&self) -> Result<(), Error> {
        let api = &self.kube_api_config;
        if api.master.is_empty() && api.kube_config.is_empty() {
            return Err(Error::configuration(
                "either kubeAPIConfig.master or kubeAPIConfig.kubeConfig must be set",
            ));
        }
        if !api.kube_config.is_empty() && !Path::new(&api.kube_config).is_absolute() {
            return Err(Error::configuration(format!(
                "kubeConfig path '{}' must be absolute",
                api.kube_config
            )));
        }

        let hub = &self.modules.cloud_hub;
        if hub.enable {
            if hub.keepalive_interval == 0 {
                return Err(Error::configuration("keepaliveInterval must be positive"));
            }
            if hub.write_timeout == 0 {
                return Err(Error::configuration("writeTimeout must be positive"));
            }
            if hub.edge_cert_signing_duration == 0 {
                return Err(Error::configuration(
                    "edgeCertSigningDuration must be positive",
                ));
            }
            if hub.token_refresh_duration == 0 {
                return Err(Error::configuration("tokenRefreshDuration must be positive"));
            }
            if hub.node_limit == 0 {
                return Err(Error::configuration("nodeLimit must be positive"));
            }
            hub.advertise_ips()?;
        }

        if self.modules.service_expose.enable && self.modules.service_expose.threadiness == 0 {
            return Err(Error::configuration("threadiness must be positive"));
        }

        Ok(())
    }
}
