//! CloudGateway - cloud side of an edge-to-cloud service mesh
//!
//! CloudGateway runs in the cloud cluster and connects edge sites to it.
//! Edge nodes enroll over an HTTPS bootstrap endpoint, hold a persistent
//! tunnel to the hub, and reach cloud services through virtual presence
//! addresses programmed into the local data plane.
//!
//! # Architecture
//!
//! - Edges join with a token and receive a certificate signed by the gateway CA
//! - Every edge keeps one outbound tunnel (WebSocket or QUIC) to the hub
//! - Reconcilers turn exposure CRDs into NAT and route directives
//! - Directives for remote sites travel over the tunnel; local ones are
//!   applied with iptables and `ip route`
//!
//! # Modules
//!
//! - [`config`] - YAML configuration file and defaults
//! - [`pki`] - CA, server and edge certificates, join tokens, secret storage
//! - [`tls`] - rustls server configs and peer certificate plumbing
//! - [`bootstrap`] - `/ca.crt`, `/edge.crt` and `/healthz` enrollment endpoint
//! - [`message`] - Hub message model and per-node send queues
//! - [`hub`] - Edge tunnel hub over WebSocket and QUIC, plus the group bus
//! - [`crd`] - Custom Resource Definitions (ServiceExpose, EService, EServer, ...)
//! - [`allocator`] - Virtual presence IP pools per gateway
//! - [`controller`] - Reconcilers for the exposure CRDs
//! - [`dataplane`] - NAT and route programming, local or via the tunnel
//! - [`tap`] - Raw L2 frame stream between edges and the TAP device
//! - [`forwarder`] - HTTP requests forwarded to edge services over the hub
//! - [`retry`] - Exponential backoff helpers
//! - [`error`] - Error types for the gateway

#![deny(missing_docs)]

pub mod allocator;
pub mod bootstrap;
pub mod config;
pub mod controller;
pub mod crd;
pub mod dataplane;
pub mod error;
pub mod forwarder;
pub mod hub;
pub mod message;
pub mod pki;
pub mod retry;
pub mod tap;
pub mod tls;

use std::net::Ipv4Addr;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default address of the TAP interface
///
/// Routes towards virtual presence addresses point at this address, so
/// reconcilers and the TAP device must agree on it.
pub const DEFAULT_TAP_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 96, 1);

/// Default netmask of the TAP interface
pub const DEFAULT_TAP_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Default TAP interface name
pub const DEFAULT_TAP_NAME: &str = "cgtap0";
