//! Directive planning for a ServiceExpose
//!
//! For every allowed (server, service) pair the service site translates
//! traffic from the server's virtual presence to the real service, and the
//! server site rewrites the server's source to its virtual presence. Each
//! side routes the peer's virtual presence into the tunnel.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use kube::ResourceExt;

use crate::crd::{EServer, EService, PresenceHolder};
use crate::dataplane::{Directive, HostRoute, NatRule};
use crate::Error;

/// Ordered, duplicate-free directive set
pub type Plan = BTreeSet<Directive>;

/// Directives realizing access from `servers` to `service`
///
/// Servers sharing a site share the route towards the service's virtual
/// presence, so the plan is a set.
pub fn plan(service: &EService, servers: &[EServer], tap_ip: Ipv4Addr) -> Result<Plan, Error> {
    let service_site = service.site();
    let service_ip = service.parsed_real_ip()?;
    let service_vip = require_vip(service, "EService")?;
    let protocol = protocol_of(service)?;

    let mut plan = Plan::new();
    for server in servers {
        let server_site = server.site();
        let server_ip = server.parsed_real_ip()?;
        let server_vip = require_vip(server, "EServer")?;

        plan.insert(Directive::nat(
            service_site,
            NatRule::dnat(server_vip, service_vip, service_ip).with_protocol(&protocol),
        ));
        plan.insert(Directive::route(
            service_site,
            HostRoute {
                destination: server_vip,
                via: tap_ip,
            },
        ));
        plan.insert(Directive::nat(
            server_site,
            NatRule::snat(server_ip, service_vip, server_vip).with_protocol(&protocol),
        ));
        plan.insert(Directive::route(
            server_site,
            HostRoute {
                destination: service_vip,
                via: tap_ip,
            },
        ));
    }
    Ok(plan)
}

/// iptables protocol match for the service, defaulting to tcp
fn protocol_of(service: &EService) -> Result<String, Error> {
    let protocol = service.spec.protocol.trim().to_ascii_lowercase();
    match protocol.as_str() {
        "" => Ok("tcp".to_string()),
        "tcp" | "udp" | "sctp" => Ok(protocol),
        other => Err(Error::validation(format!(
            "EService {} has unsupported protocol {}",
            service.name_any(),
            other
        ))),
    }
}

fn require_vip<H: PresenceHolder>(holder: &H, kind: &str) -> Result<Ipv4Addr, Error> {
    holder.parsed_virtual_presence_ip()?.ok_or_else(|| {
        Error::resolution(format!("{} has no virtual presence yet", kind))
    })
}

/// Split a transition from `previous` to `next` into (apply, remove)
///
/// Directives kept by both sides are re-applied, which is a no-op on the
/// data plane and repairs drift.
pub fn diff(previous: &[Directive], next: &Plan) -> (Vec<Directive>, Vec<Directive>) {
    let apply = next.iter().cloned().collect();
    let remove = previous
        .iter()
        .filter(|d| !next.contains(*d))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    (apply, remove)
}
