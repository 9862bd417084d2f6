//! Virtual presence assignment for EService and EServer, gateway registration
//!
//! A holder gets the lowest free address of the gateway serving its site. The
//! allocation is persisted as a `VirtualPresence` object and written to
//! `spec.virtualPresenceIp`; the finalizer releases it on delete.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use super::{has_finalizer, is_deleting, Context, ObjectKind, FINALIZER};
use crate::crd::{
    owner_key, EGateway, EServer, EService, LifecyclePhase, LifecycleStatus, PresenceHolder,
    VirtualPresence, VirtualPresenceSpec,
};
use crate::Error;

/// Reconcile an EService
#[instrument(skip(service, ctx), fields(service = %service.name_any()))]
pub async fn reconcile_service(service: Arc<EService>, ctx: Arc<Context>) -> Result<Action, Error> {
    let status = service.status.clone();
    reconcile_holder(service.as_ref(), ObjectKind::EService, status, &ctx).await
}

/// Reconcile an EServer
#[instrument(skip(server, ctx), fields(server = %server.name_any()))]
pub async fn reconcile_server(server: Arc<EServer>, ctx: Arc<Context>) -> Result<Action, Error> {
    let status = server.status.clone();
    reconcile_holder(server.as_ref(), ObjectKind::EServer, status, &ctx).await
}

async fn reconcile_holder<K>(
    obj: &K,
    kind: ObjectKind,
    current: Option<LifecycleStatus>,
    ctx: &Context,
) -> Result<Action, Error>
where
    K: PresenceHolder + ResourceExt,
{
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    let owner = owner_key(K::OWNER_KIND, &namespace, &name);
    let presence_name = VirtualPresence::object_name(K::OWNER_KIND, &name);

    if is_deleting(obj) {
        if has_finalizer(obj) {
            ctx.kube
                .delete_virtual_presence(&namespace, &presence_name)
                .await?;
            if let Some((gateway, ip)) = ctx.allocator.release_owner(&owner) {
                info!(gateway = %gateway, %ip, "Released virtual presence");
            }
            ctx.kube
                .remove_finalizer(kind, &namespace, &name, FINALIZER)
                .await?;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(obj) {
        ctx.kube
            .add_finalizer(kind, &namespace, &name, FINALIZER)
            .await?;
    }

    let pending = |msg: String| LifecycleStatus::with_phase(LifecyclePhase::Pending).message(msg);

    if let Err(e) = obj.parsed_real_ip() {
        write_status(ctx, kind, &namespace, &name, current, pending(e.to_string())).await?;
        return Ok(Action::await_change());
    }

    let gateways = ctx.kube.list_gateways(&namespace).await?;
    let Some(gateway) = gateways
        .iter()
        .find(|g| g.spec.e_site_name == obj.site() && !is_deleting(*g))
    else {
        let msg = format!("no EGateway serves site {}", obj.site());
        write_status(ctx, kind, &namespace, &name, current, pending(msg)).await?;
        return Ok(Action::await_change());
    };
    let gateway_name = gateway.name_any();

    let registered = gateway
        .spec
        .cidr()
        .and_then(|cidr| Ok(ctx.allocator.add_gateway(&gateway_name, cidr)?));
    if let Err(e) = registered {
        let msg = format!("EGateway {} is unusable: {}", gateway_name, e);
        write_status(ctx, kind, &namespace, &name, current, pending(msg)).await?;
        return Ok(Action::await_change());
    }

    // The site may have moved to another gateway
    if ctx.allocator.lookup(&gateway_name, &owner).is_none() {
        ctx.allocator.release_owner(&owner);
    }

    let assigned = match obj.parsed_virtual_presence_ip() {
        Ok(Some(ip)) => match ctx.allocator.reserve(&gateway_name, ip, &owner) {
            Ok(()) => Ok(ip),
            Err(e) => {
                warn!(%ip, error = %e, "Assigned address is unusable, allocating a new one");
                ctx.allocator.request(&gateway_name, &owner)
            }
        },
        Ok(None) | Err(_) => ctx.allocator.request(&gateway_name, &owner),
    };
    let ip = match assigned {
        Ok(ip) => ip,
        Err(e) => {
            let msg = e.to_string();
            write_status(ctx, kind, &namespace, &name, current, pending(msg)).await?;
            return Err(e.into());
        }
    };

    let mut presence = VirtualPresence::new(
        &presence_name,
        VirtualPresenceSpec {
            virtual_ip: ip.to_string(),
            gateway_name: gateway_name.clone(),
            owner_kind: K::OWNER_KIND.to_string(),
            owner_name: name.clone(),
        },
    );
    presence.metadata.namespace = Some(namespace.clone());
    ctx.kube
        .apply_virtual_presence(&namespace, &presence)
        .await?;

    let vip = ip.to_string();
    if obj.virtual_presence_ip() != vip {
        ctx.kube
            .set_virtual_presence_ip(kind, &namespace, &name, &vip)
            .await?;
        info!(gateway = %gateway_name, %ip, "Assigned virtual presence");
    }

    let running = LifecycleStatus::with_phase(LifecyclePhase::Running);
    write_status(ctx, kind, &namespace, &name, current, running).await?;
    Ok(Action::await_change())
}

/// Reconcile an EGateway: register its range with the allocator
#[instrument(skip(gateway, ctx), fields(gateway = %gateway.name_any()))]
pub async fn reconcile_gateway(gateway: Arc<EGateway>, ctx: Arc<Context>) -> Result<Action, Error> {
    if is_deleting(gateway.as_ref()) {
        return Ok(Action::await_change());
    }
    let namespace = gateway.namespace().unwrap_or_default();
    let name = gateway.name_any();

    let status = match gateway
        .spec
        .cidr()
        .and_then(|cidr| Ok(ctx.allocator.add_gateway(&name, cidr)?))
    {
        Ok(()) => LifecycleStatus::with_phase(LifecyclePhase::Running),
        Err(e) => {
            warn!(error = %e, "Gateway range rejected");
            LifecycleStatus::with_phase(LifecyclePhase::Pending).message(e.to_string())
        }
    };
    write_status(
        &ctx,
        ObjectKind::EGateway,
        &namespace,
        &name,
        gateway.status.clone(),
        status,
    )
    .await?;
    Ok(Action::await_change())
}

/// Patch status unless it already matches; unchanged writes would re-trigger
async fn write_status(
    ctx: &Context,
    kind: ObjectKind,
    namespace: &str,
    name: &str,
    current: Option<LifecycleStatus>,
    desired: LifecycleStatus,
) -> Result<(), Error> {
    if current.as_ref() == Some(&desired) {
        return Ok(());
    }
    ctx.kube
        .patch_lifecycle_status(kind, namespace, name, &desired)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::VirtualPresenceAllocator;
    use crate::controller::MockKubeClient;
    use crate::crd::{EGatewaySpec, EServerSpec, EServiceSpec};
    use crate::dataplane::MockDirectiveSink;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::sync::Mutex;

    fn gateway(name: &str, site: &str, cidr: &str) -> EGateway {
        let mut gateway = EGateway::new(
            name,
            EGatewaySpec {
                ip: "192.168.0.1".to_string(),
                virtual_presence_cidr: cidr.to_string(),
                e_site_name: site.to_string(),
            },
        );
        gateway.metadata.namespace = Some("default".to_string());
        gateway
    }

    fn service(vip: &str) -> EService {
        let mut service = EService::new(
            "web",
            EServiceSpec {
                protocol: "tcp".to_string(),
                port: 80,
                ip: "192.168.1.10".to_string(),
                e_site_name: "edge-a".to_string(),
                virtual_presence_ip: vip.to_string(),
            },
        );
        service.metadata.namespace = Some("default".to_string());
        service.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        service
    }

    fn server() -> EServer {
        let mut server = EServer::new(
            "client",
            EServerSpec {
                e_server_name: "client".to_string(),
                ip: "192.168.2.7".to_string(),
                e_site_name: "edge-a".to_string(),
                virtual_presence_ip: String::new(),
            },
        );
        server.metadata.namespace = Some("default".to_string());
        server.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        server
    }

    fn ctx(kube: MockKubeClient, allocator: Arc<VirtualPresenceAllocator>) -> Arc<Context> {
        Arc::new(Context::for_testing(
            Arc::new(kube),
            Arc::new(MockDirectiveSink::new()),
            allocator,
        ))
    }

    fn capture_statuses(kube: &mut MockKubeClient) -> Arc<Mutex<Vec<(ObjectKind, LifecycleStatus)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        kube.expect_patch_lifecycle_status()
            .returning(move |kind, _, _, status| {
                log.lock().unwrap().push((kind, status.clone()));
                Ok(())
            });
        seen
    }

    /// Story: a service and a server on one site get distinct addresses,
    /// and deleting the service frees its address for the next owner
    #[tokio::test]
    async fn story_assign_and_release_virtual_presence() {
        let allocator = Arc::new(VirtualPresenceAllocator::new());
        let assigned = Arc::new(Mutex::new(Vec::<(ObjectKind, String)>::new()));
        let presences = Arc::new(Mutex::new(Vec::<VirtualPresence>::new()));

        let mut kube = MockKubeClient::new();
        kube.expect_list_gateways()
            .returning(|_| Ok(vec![gateway("gw-edge-a", "edge-a", "10.20.0.0/24")]));
        let log = presences.clone();
        kube.expect_apply_virtual_presence().returning(move |_, p| {
            log.lock().unwrap().push(p.clone());
            Ok(())
        });
        let log = assigned.clone();
        kube.expect_set_virtual_presence_ip()
            .returning(move |kind, _, _, ip| {
                log.lock().unwrap().push((kind, ip.to_string()));
                Ok(())
            });
        kube.expect_delete_virtual_presence()
            .withf(|ns, name| ns == "default" && name == "eservice-web")
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_remove_finalizer()
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let statuses = capture_statuses(&mut kube);
        let ctx = ctx(kube, allocator.clone());

        // Chapter 1: the service takes the lowest address
        reconcile_service(Arc::new(service("")), ctx.clone()).await.unwrap();
        // Chapter 2: the server takes the next one
        reconcile_server(Arc::new(server()), ctx.clone()).await.unwrap();

        assert_eq!(
            *assigned.lock().unwrap(),
            vec![
                (ObjectKind::EService, "10.20.0.1".to_string()),
                (ObjectKind::EServer, "10.20.0.2".to_string()),
            ]
        );
        {
            let presences = presences.lock().unwrap();
            assert_eq!(presences[0].name_any(), "eservice-web");
            assert_eq!(presences[0].spec.gateway_name, "gw-edge-a");
            assert_eq!(presences[1].spec.owner_kind, "EServer");
        }
        assert!(statuses
            .lock()
            .unwrap()
            .iter()
            .all(|(_, s)| s.phase == LifecyclePhase::Running));

        // Chapter 3: deleting the service frees 10.20.0.1
        let mut deleting = service("10.20.0.1");
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        reconcile_service(Arc::new(deleting), ctx.clone()).await.unwrap();

        assert_eq!(
            allocator.request("gw-edge-a", "EService/default/other").unwrap(),
            "10.20.0.1".parse::<std::net::Ipv4Addr>().unwrap()
        );
    }

    #[tokio::test]
    async fn assigned_address_is_kept_without_rewriting_spec() {
        let allocator = Arc::new(VirtualPresenceAllocator::new());
        let mut kube = MockKubeClient::new();
        kube.expect_list_gateways()
            .returning(|_| Ok(vec![gateway("gw-edge-a", "edge-a", "10.20.0.0/24")]));
        kube.expect_apply_virtual_presence().returning(|_, _| Ok(()));
        kube.expect_set_virtual_presence_ip().never();
        let mut obj = service("10.20.0.42");
        obj.status = Some(LifecycleStatus::with_phase(LifecyclePhase::Running));
        kube.expect_patch_lifecycle_status().never();

        reconcile_service(Arc::new(obj), ctx(kube, allocator.clone()))
            .await
            .unwrap();

        assert_eq!(
            allocator.lookup("gw-edge-a", "EService/default/web"),
            Some("10.20.0.42".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn conflicting_address_is_replaced() {
        let allocator = Arc::new(VirtualPresenceAllocator::new());
        allocator
            .add_gateway("gw-edge-a", "10.20.0.0/24".parse().unwrap())
            .unwrap();
        allocator
            .reserve("gw-edge-a", "10.20.0.1".parse().unwrap(), "EServer/default/other")
            .unwrap();

        let mut kube = MockKubeClient::new();
        kube.expect_list_gateways()
            .returning(|_| Ok(vec![gateway("gw-edge-a", "edge-a", "10.20.0.0/24")]));
        kube.expect_apply_virtual_presence().returning(|_, _| Ok(()));
        kube.expect_set_virtual_presence_ip()
            .withf(|_, _, _, ip| ip == "10.20.0.2")
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        capture_statuses(&mut kube);

        reconcile_service(Arc::new(service("10.20.0.1")), ctx(kube, allocator))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_gateway_leaves_holder_pending() {
        let mut kube = MockKubeClient::new();
        kube.expect_list_gateways().returning(|_| Ok(vec![]));
        kube.expect_set_virtual_presence_ip().never();
        let statuses = capture_statuses(&mut kube);

        let action = reconcile_server(
            Arc::new(server()),
            ctx(kube, Arc::new(VirtualPresenceAllocator::new())),
        )
        .await
        .unwrap();

        assert_eq!(action, Action::await_change());
        let statuses = statuses.lock().unwrap();
        assert_eq!(statuses[0].1.phase, LifecyclePhase::Pending);
        assert_eq!(
            statuses[0].1.message.as_deref(),
            Some("no EGateway serves site edge-a")
        );
    }

    #[tokio::test]
    async fn exhausted_range_is_retried() {
        let allocator = Arc::new(VirtualPresenceAllocator::new());
        allocator
            .add_gateway("gw-edge-a", "10.20.0.0/32".parse().unwrap())
            .unwrap();
        allocator.request("gw-edge-a", "EService/default/first").unwrap();

        let mut kube = MockKubeClient::new();
        kube.expect_list_gateways()
            .returning(|_| Ok(vec![gateway("gw-edge-a", "edge-a", "10.20.0.0/32")]));
        let statuses = capture_statuses(&mut kube);

        let result = reconcile_server(Arc::new(server()), ctx(kube, allocator)).await;

        assert!(matches!(result, Err(Error::Allocation(_))));
        assert_eq!(statuses.lock().unwrap()[0].1.phase, LifecyclePhase::Pending);
    }

    #[tokio::test]
    async fn gateway_ranges_are_registered_or_rejected() {
        let allocator = Arc::new(VirtualPresenceAllocator::new());
        let mut kube = MockKubeClient::new();
        let statuses = capture_statuses(&mut kube);
        let ctx = ctx(kube, allocator.clone());

        reconcile_gateway(Arc::new(gateway("gw-a", "edge-a", "10.20.0.0/16")), ctx.clone())
            .await
            .unwrap();
        reconcile_gateway(Arc::new(gateway("gw-b", "edge-b", "10.20.5.0/24")), ctx.clone())
            .await
            .unwrap();

        assert!(allocator.has_gateway("gw-a"));
        assert!(!allocator.has_gateway("gw-b"));
        let statuses = statuses.lock().unwrap();
        assert_eq!(statuses[0], (ObjectKind::EGateway, LifecycleStatus::with_phase(LifecyclePhase::Running)));
        assert_eq!(statuses[1].1.phase, LifecyclePhase::Pending);
        assert!(statuses[1].1.message.as_ref().unwrap().contains("overlaps"));
    }
}
