//! Watch mappers re-triggering dependents of a changed object
//!
//! Each takes the current cache contents of the dependent kind, as returned
//! by a controller's reflector store.

use std::sync::Arc;

use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};

use crate::crd::{EGateway, EPolicy, EServer, EService, PresenceHolder, ServiceExpose};

fn same_namespace<A: ResourceExt, B: ResourceExt>(a: &A, b: &B) -> bool {
    a.namespace() == b.namespace()
}

/// Exposes publishing `service`
pub fn exposes_for_service(
    exposes: &[Arc<ServiceExpose>],
    service: &EService,
) -> Vec<ObjectRef<ServiceExpose>> {
    let name = service.name_any();
    exposes
        .iter()
        .filter(|e| same_namespace(e.as_ref(), service) && e.spec.e_service_name == name)
        .map(|e| ObjectRef::from_obj(e.as_ref()))
        .collect()
}

/// Exposes gated by `policy`
pub fn exposes_for_policy(
    exposes: &[Arc<ServiceExpose>],
    policy: &EPolicy,
) -> Vec<ObjectRef<ServiceExpose>> {
    let name = policy.name_any();
    exposes
        .iter()
        .filter(|e| same_namespace(e.as_ref(), policy) && e.spec.e_policies.contains(&name))
        .map(|e| ObjectRef::from_obj(e.as_ref()))
        .collect()
}

/// Exposes that may allow `server`
///
/// Policies are not cached here, so every expose of the namespace is
/// re-checked; unaffected ones settle without writes.
pub fn exposes_for_server(
    exposes: &[Arc<ServiceExpose>],
    server: &EServer,
) -> Vec<ObjectRef<ServiceExpose>> {
    exposes
        .iter()
        .filter(|e| same_namespace(e.as_ref(), server))
        .map(|e| ObjectRef::from_obj(e.as_ref()))
        .collect()
}

/// Holders on the site `gateway` serves
pub fn holders_for_gateway<K>(holders: &[Arc<K>], gateway: &EGateway) -> Vec<ObjectRef<K>>
where
    K: PresenceHolder + Resource<DynamicType = ()>,
{
    holders
        .iter()
        .filter(|h| {
            same_namespace(h.as_ref(), gateway) && h.site() == gateway.spec.e_site_name
        })
        .map(|h| ObjectRef::from_obj(h.as_ref()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EGatewaySpec, EPolicySpec, EServerSpec, EServiceSpec, ServiceExposeSpec};

    fn in_ns<K: Resource>(mut obj: K, ns: &str) -> K {
        obj.meta_mut().namespace = Some(ns.to_string());
        obj
    }

    fn expose(name: &str, ns: &str, service: &str, policies: &[&str]) -> Arc<ServiceExpose> {
        Arc::new(in_ns(
            ServiceExpose::new(
                name,
                ServiceExposeSpec {
                    e_service_name: service.to_string(),
                    dns_name: String::new(),
                    e_sites: vec![],
                    e_policies: policies.iter().map(|p| p.to_string()).collect(),
                },
            ),
            ns,
        ))
    }

    fn names<K: Resource>(refs: Vec<ObjectRef<K>>) -> Vec<String> {
        refs.into_iter().map(|r| r.name).collect()
    }

    fn cache() -> Vec<Arc<ServiceExpose>> {
        vec![
            expose("web", "default", "web", &["clients"]),
            expose("api", "default", "api", &["clients", "admins"]),
            expose("web-other", "other", "web", &["clients"]),
        ]
    }

    #[test]
    fn service_changes_reach_exposes_naming_it() {
        let service = in_ns(
            EService::new(
                "web",
                EServiceSpec {
                    protocol: "tcp".to_string(),
                    port: 80,
                    ip: "192.168.1.10".to_string(),
                    e_site_name: "cloud".to_string(),
                    virtual_presence_ip: String::new(),
                },
            ),
            "default",
        );
        assert_eq!(names(exposes_for_service(&cache(), &service)), vec!["web"]);
    }

    #[test]
    fn policy_changes_reach_exposes_gated_by_it() {
        let policy = in_ns(EPolicy::new("admins", EPolicySpec::default()), "default");
        assert_eq!(names(exposes_for_policy(&cache(), &policy)), vec!["api"]);

        let policy = in_ns(EPolicy::new("clients", EPolicySpec::default()), "other");
        assert_eq!(names(exposes_for_policy(&cache(), &policy)), vec!["web-other"]);
    }

    #[test]
    fn server_changes_reach_every_expose_of_the_namespace() {
        let server = in_ns(
            EServer::new(
                "client",
                EServerSpec {
                    e_server_name: "client".to_string(),
                    ip: "192.168.2.7".to_string(),
                    e_site_name: "edge-a".to_string(),
                    virtual_presence_ip: String::new(),
                },
            ),
            "default",
        );
        assert_eq!(
            names(exposes_for_server(&cache(), &server)),
            vec!["web", "api"]
        );
    }

    #[test]
    fn gateway_changes_reach_holders_on_its_site() {
        let server = |name: &str, site: &str| {
            Arc::new(in_ns(
                EServer::new(
                    name,
                    EServerSpec {
                        e_server_name: name.to_string(),
                        ip: "192.168.2.7".to_string(),
                        e_site_name: site.to_string(),
                        virtual_presence_ip: String::new(),
                    },
                ),
                "default",
            ))
        };
        let holders = vec![server("a", "edge-a"), server("b", "edge-b")];
        let gateway = in_ns(
            EGateway::new(
                "gw-edge-a",
                EGatewaySpec {
                    ip: "192.168.0.1".to_string(),
                    virtual_presence_cidr: "10.20.0.0/24".to_string(),
                    e_site_name: "edge-a".to_string(),
                },
            ),
            "default",
        );

        assert_eq!(names(holders_for_gateway(&holders, &gateway)), vec!["a"]);
    }
}
