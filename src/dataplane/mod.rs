//! Data-plane programming for virtual presence
//!
//! A [`Directive`] is one NAT rule or one host route on one site. The
//! [`Programmer`] realizes directives on the local host through a
//! [`RuleTable`] and a [`RouteTable`]; directives for edge sites travel
//! through the tunnel (see [`dispatch`]).
//!
//! Rules and routes are identified by their content, so applying a directive
//! twice is a no-op and removing it restores the previous state.

pub mod dispatch;
pub mod iptables;
pub mod route;

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub use dispatch::{CloudMeshHandler, DirectiveSink, TunnelDispatcher, DIRECTIVES_KIND};
pub use iptables::{IptablesRuleTable, MemoryRuleTable};
pub use route::{IpRouteTable, MemoryRouteTable};
#[cfg(test)]
pub use dispatch::MockDirectiveSink;

/// iptables table holding every rule installed here
pub const NAT_TABLE: &str = "nat";

/// Data-plane failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataPlaneError {
    /// The route is already installed
    #[error("route already exists: {0}")]
    RouteExists(String),

    /// The route is not installed
    #[error("route not found: {0}")]
    RouteNotFound(String),

    /// An external command failed
    #[error("{command} failed: {stderr}")]
    Command {
        /// Command line
        command: String,
        /// Captured standard error
        stderr: String,
    },

    /// The command could not be started
    #[error("failed to run {0}")]
    Spawn(String),

    /// The directive is not programmable
    #[error("invalid directive: {0}")]
    Invalid(String),
}

impl From<DataPlaneError> for crate::Error {
    fn from(e: DataPlaneError) -> Self {
        crate::Error::data_plane(e.to_string())
    }
}

/// Address translation direction
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum NatKind {
    /// Rewrite the source address on the way out
    Snat,
    /// Rewrite the destination address on the way in
    Dnat,
}

impl NatKind {
    /// Chain of the `nat` table the rule lives in
    pub fn chain(&self) -> &'static str {
        match self {
            Self::Snat => "POSTROUTING",
            Self::Dnat => "PREROUTING",
        }
    }
}

impl fmt::Display for NatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Snat => write!(f, "SNAT"),
            Self::Dnat => write!(f, "DNAT"),
        }
    }
}

/// One SNAT or DNAT rule
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub struct NatRule {
    /// SNAT or DNAT
    pub kind: NatKind,
    /// Matched protocol
    pub protocol: String,
    /// Matched source address
    pub source: Ipv4Addr,
    /// Matched destination address
    pub destination: Ipv4Addr,
    /// New source (SNAT) or destination (DNAT)
    pub translated: Ipv4Addr,
}

impl NatRule {
    /// `-s <server VIP> -d <service VIP> -j DNAT --to-destination <service IP>`
    pub fn dnat(source: Ipv4Addr, destination: Ipv4Addr, to_destination: Ipv4Addr) -> Self {
        Self {
            kind: NatKind::Dnat,
            protocol: "tcp".to_string(),
            source,
            destination,
            translated: to_destination,
        }
    }

    /// `-s <server IP> -d <service VIP> -j SNAT --to-source <server VIP>`
    pub fn snat(source: Ipv4Addr, destination: Ipv4Addr, to_source: Ipv4Addr) -> Self {
        Self {
            kind: NatKind::Snat,
            protocol: "tcp".to_string(),
            source,
            destination,
            translated: to_source,
        }
    }

    /// Match `protocol` instead of tcp
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Chain of the `nat` table the rule lives in
    pub fn chain(&self) -> &'static str {
        self.kind.chain()
    }

    /// Rule as iptables arguments
    pub fn rule_spec(&self) -> Vec<String> {
        let target = match self.kind {
            NatKind::Snat => "--to-source",
            NatKind::Dnat => "--to-destination",
        };
        vec![
            "-p".to_string(),
            self.protocol.clone(),
            "-s".to_string(),
            self.source.to_string(),
            "-d".to_string(),
            self.destination.to_string(),
            "-j".to_string(),
            self.kind.to_string(),
            target.to_string(),
            self.translated.to_string(),
        ]
    }
}

/// A `/32` host route through the tap device
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub struct HostRoute {
    /// Routed host address
    pub destination: Ipv4Addr,
    /// Next hop
    pub via: Ipv4Addr,
}

impl HostRoute {
    /// Destination in CIDR notation
    pub fn cidr(&self) -> String {
        format!("{}/32", self.destination)
    }
}

impl fmt::Display for HostRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.cidr(), self.via)
    }
}

/// One programming step on one site
///
/// Exactly one of `nat` and `route` is set.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Directive {
    /// Site the directive is programmed on
    pub site: String,
    /// NAT rule to install
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat: Option<NatRule>,
    /// Host route to install
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<HostRoute>,
}

impl Directive {
    /// NAT directive for `site`
    pub fn nat(site: impl Into<String>, rule: NatRule) -> Self {
        Self {
            site: site.into(),
            nat: Some(rule),
            route: None,
        }
    }

    /// Route directive for `site`
    pub fn route(site: impl Into<String>, route: HostRoute) -> Self {
        Self {
            site: site.into(),
            nat: None,
            route: Some(route),
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.nat, &self.route) {
            (Some(rule), _) => write!(f, "{}: {} {}", self.site, rule.chain(), rule.rule_spec().join(" ")),
            (None, Some(route)) => write!(f, "{}: route {}", self.site, route),
            (None, None) => write!(f, "{}: empty", self.site),
        }
    }
}

/// Whether a directive is installed or withdrawn
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectiveOp {
    /// Install
    Apply,
    /// Withdraw
    Remove,
}

/// Packet-filter rule storage (iptables)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RuleTable: Send + Sync {
    /// Append `spec` to `chain` unless an identical rule exists
    async fn ensure_rule(&self, table: &str, chain: &str, spec: &[String])
        -> Result<(), DataPlaneError>;

    /// Delete `spec` from `chain`; a missing rule is not an error
    async fn delete_rule(&self, table: &str, chain: &str, spec: &[String])
        -> Result<(), DataPlaneError>;
}

/// Kernel routing table
///
/// Implementations report duplicates and misses as
/// [`DataPlaneError::RouteExists`] and [`DataPlaneError::RouteNotFound`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RouteTable: Send + Sync {
    /// Install `route`
    async fn add_route(&self, route: &HostRoute) -> Result<(), DataPlaneError>;

    /// Remove `route`
    async fn delete_route(&self, route: &HostRoute) -> Result<(), DataPlaneError>;
}

/// Programs directives on the local host
pub struct Programmer {
    rules: Arc<dyn RuleTable>,
    routes: Arc<dyn RouteTable>,
}

impl Programmer {
    /// Create a programmer over the given backends
    pub fn new(rules: Arc<dyn RuleTable>, routes: Arc<dyn RouteTable>) -> Self {
        Self { rules, routes }
    }

    /// System iptables and `ip route`
    pub fn system() -> Self {
        Self::new(
            Arc::new(IptablesRuleTable::default()),
            Arc::new(IpRouteTable::default()),
        )
    }

    /// In-memory recording tables
    pub fn dry_run() -> Self {
        Self::new(
            Arc::new(MemoryRuleTable::default()),
            Arc::new(MemoryRouteTable::default()),
        )
    }

    /// Apply or remove `directive`
    pub async fn program(&self, op: DirectiveOp, directive: &Directive) -> Result<(), DataPlaneError> {
        match op {
            DirectiveOp::Apply => self.apply(directive).await,
            DirectiveOp::Remove => self.remove(directive).await,
        }
    }

    /// Install `directive`; installing an existing rule or route succeeds
    pub async fn apply(&self, directive: &Directive) -> Result<(), DataPlaneError> {
        if let Some(rule) = &directive.nat {
            self.rules
                .ensure_rule(NAT_TABLE, rule.chain(), &rule.rule_spec())
                .await?;
            debug!(chain = rule.chain(), rule = ?rule.rule_spec(), "Ensured NAT rule");
        }
        if let Some(route) = &directive.route {
            match self.routes.add_route(route).await {
                Ok(()) => info!(route = %route, "Installed host route"),
                Err(DataPlaneError::RouteExists(_)) => {
                    debug!(route = %route, "Host route already present")
                }
                Err(e) => return Err(e),
            }
        }
        if directive.nat.is_none() && directive.route.is_none() {
            return Err(DataPlaneError::Invalid(directive.to_string()));
        }
        Ok(())
    }

    /// Withdraw `directive`; withdrawing a missing rule or route succeeds
    pub async fn remove(&self, directive: &Directive) -> Result<(), DataPlaneError> {
        if let Some(rule) = &directive.nat {
            self.rules
                .delete_rule(NAT_TABLE, rule.chain(), &rule.rule_spec())
                .await?;
            debug!(chain = rule.chain(), rule = ?rule.rule_spec(), "Deleted NAT rule");
        }
        if let Some(route) = &directive.route {
            match self.routes.delete_route(route).await {
                Ok(()) => info!(route = %route, "Removed host route"),
                Err(DataPlaneError::RouteNotFound(_)) => {
                    debug!(route = %route, "Host route already absent")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn dnat() -> Directive {
        Directive::nat(
            "cloud",
            NatRule::dnat(ip("10.10.0.2"), ip("10.20.0.2"), ip("192.168.1.5")),
        )
    }

    fn host_route() -> Directive {
        Directive::route(
            "cloud",
            HostRoute {
                destination: ip("10.10.0.2"),
                via: ip("169.254.96.1"),
            },
        )
    }

    #[test]
    fn dnat_rule_spec_matches_iptables_syntax() {
        let rule = NatRule::dnat(ip("10.10.0.2"), ip("10.20.0.2"), ip("192.168.1.5"));
        assert_eq!(rule.chain(), "PREROUTING");
        assert_eq!(
            rule.rule_spec().join(" "),
            "-p tcp -s 10.10.0.2 -d 10.20.0.2 -j DNAT --to-destination 192.168.1.5"
        );
    }

    #[test]
    fn snat_rule_spec_matches_iptables_syntax() {
        let rule = NatRule::snat(ip("192.168.2.7"), ip("10.20.0.2"), ip("10.10.0.2"));
        assert_eq!(rule.chain(), "POSTROUTING");
        assert_eq!(
            rule.rule_spec().join(" "),
            "-p tcp -s 192.168.2.7 -d 10.20.0.2 -j SNAT --to-source 10.10.0.2"
        );
    }

    #[test]
    fn directive_serializes_camel_case_without_empty_fields() {
        let json = serde_json::to_value(host_route()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "site": "cloud",
                "route": {"destination": "10.10.0.2", "via": "169.254.96.1"}
            })
        );
        let back: Directive = serde_json::from_value(json).unwrap();
        assert_eq!(back, host_route());
    }

    #[tokio::test]
    async fn existing_route_counts_as_installed() {
        let mut routes = MockRouteTable::new();
        routes
            .expect_add_route()
            .returning(|r| Err(DataPlaneError::RouteExists(r.cidr())));
        let programmer = Programmer::new(Arc::new(MockRuleTable::new()), Arc::new(routes));

        assert!(programmer.apply(&host_route()).await.is_ok());
    }

    #[tokio::test]
    async fn missing_route_counts_as_removed() {
        let mut routes = MockRouteTable::new();
        routes
            .expect_delete_route()
            .returning(|r| Err(DataPlaneError::RouteNotFound(r.cidr())));
        let programmer = Programmer::new(Arc::new(MockRuleTable::new()), Arc::new(routes));

        assert!(programmer.remove(&host_route()).await.is_ok());
    }

    #[tokio::test]
    async fn other_route_errors_are_reported() {
        let mut routes = MockRouteTable::new();
        routes.expect_add_route().returning(|_| {
            Err(DataPlaneError::Command {
                command: "ip route add".to_string(),
                stderr: "Network is unreachable".to_string(),
            })
        });
        let programmer = Programmer::new(Arc::new(MockRuleTable::new()), Arc::new(routes));

        assert!(matches!(
            programmer.apply(&host_route()).await,
            Err(DataPlaneError::Command { .. })
        ));
    }

    #[tokio::test]
    async fn nat_directives_go_to_the_nat_table() {
        let mut rules = MockRuleTable::new();
        rules
            .expect_ensure_rule()
            .withf(|table, chain, spec| {
                table == "nat" && chain == "PREROUTING" && spec.contains(&"DNAT".to_string())
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let programmer = Programmer::new(Arc::new(rules), Arc::new(MockRouteTable::new()));

        programmer.apply(&dnat()).await.unwrap();
    }

    #[tokio::test]
    async fn empty_directive_is_rejected() {
        let programmer = Programmer::dry_run();
        let empty = Directive {
            site: "cloud".to_string(),
            nat: None,
            route: None,
        };
        assert!(matches!(
            programmer.apply(&empty).await,
            Err(DataPlaneError::Invalid(_))
        ));
    }
}
