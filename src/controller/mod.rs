//! Controllers for the CloudGateway resources
//!
//! `ServiceExpose` objects are turned into data-plane directives; `EService`
//! and `EServer` objects receive a virtual presence address from the gateway
//! of their site; `EGateway` ranges are registered with the allocator.
//!
//! All writes go through [`KubeClient`] as patches so reconcilers never
//! mutate cached objects.

mod plan;
mod presence;
mod service_expose;
mod watch;

use std::fmt::Debug;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, warn};

#[cfg(test)]
use mockall::automock;

use crate::allocator::VirtualPresenceAllocator;
use crate::crd::{
    EGateway, EPolicy, EServer, EService, LifecycleStatus, ServiceExpose, ServiceExposeStatus,
    VirtualPresence,
};
use crate::dataplane::DirectiveSink;
use crate::retry::KeyedBackoff;
use crate::Error;

pub use plan::{diff, plan, Plan};
pub use presence::{reconcile_gateway, reconcile_server, reconcile_service};
pub use service_expose::reconcile as reconcile_expose;
pub use watch::{exposes_for_policy, exposes_for_server, exposes_for_service, holders_for_gateway};

/// Field manager used for every write
pub const FIELD_MANAGER: &str = "cloudgateway";

/// Finalizer guarding teardown of exposes and virtual presences
pub const FINALIZER: &str = "cloudgateway/cleanup";

/// Kinds the controllers write to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    /// `ServiceExpose`
    ServiceExpose,
    /// `EService`
    EService,
    /// `EServer`
    EServer,
    /// `EGateway`
    EGateway,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServiceExpose => write!(f, "ServiceExpose"),
            Self::EService => write!(f, "EService"),
            Self::EServer => write!(f, "EServer"),
            Self::EGateway => write!(f, "EGateway"),
        }
    }
}

/// Store operations needed by the controllers
///
/// Mocked in tests; [`KubeClientImpl`] talks to the apiserver.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch an `EService`, `None` if it does not exist
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<EService>, Error>;

    /// Fetch an `EServer`, `None` if it does not exist
    async fn get_server(&self, namespace: &str, name: &str) -> Result<Option<EServer>, Error>;

    /// Fetch an `EPolicy`, `None` if it does not exist
    async fn get_policy(&self, namespace: &str, name: &str) -> Result<Option<EPolicy>, Error>;

    /// List the gateways of a namespace
    async fn list_gateways(&self, namespace: &str) -> Result<Vec<EGateway>, Error>;

    /// Replace the status of a `ServiceExpose`
    async fn patch_expose_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ServiceExposeStatus,
    ) -> Result<(), Error>;

    /// Replace the status of an `EService`, `EServer` or `EGateway`
    async fn patch_lifecycle_status(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
        status: &LifecycleStatus,
    ) -> Result<(), Error>;

    /// Set `spec.virtualPresenceIp` of an `EService` or `EServer`
    async fn set_virtual_presence_ip(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
        ip: &str,
    ) -> Result<(), Error>;

    /// Create or update a `VirtualPresence`
    async fn apply_virtual_presence(
        &self,
        namespace: &str,
        presence: &VirtualPresence,
    ) -> Result<(), Error>;

    /// Delete a `VirtualPresence`; a missing object is not an error
    async fn delete_virtual_presence(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Add a finalizer unless present
    async fn add_finalizer(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Remove a finalizer if present
    async fn remove_finalizer(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;
}

/// [`KubeClient`] backed by the apiserver
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn merge<K>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
        status: bool,
    ) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api = self.api::<K>(namespace);
        let params = PatchParams::apply(FIELD_MANAGER);
        if status {
            api.patch_status(name, &params, &Patch::Merge(patch)).await?;
        } else {
            api.patch(name, &params, &Patch::Merge(patch)).await?;
        }
        Ok(())
    }

    async fn merge_kind(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
        status: bool,
    ) -> Result<(), Error> {
        match kind {
            ObjectKind::ServiceExpose => {
                self.merge::<ServiceExpose>(namespace, name, patch, status).await
            }
            ObjectKind::EService => self.merge::<EService>(namespace, name, patch, status).await,
            ObjectKind::EServer => self.merge::<EServer>(namespace, name, patch, status).await,
            ObjectKind::EGateway => self.merge::<EGateway>(namespace, name, patch, status).await,
        }
    }

    async fn finalizers(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Vec<String>>, Error> {
        let meta = match kind {
            ObjectKind::ServiceExpose => self
                .get::<ServiceExpose>(namespace, name)
                .await?
                .map(|o| o.finalizers().to_vec()),
            ObjectKind::EService => self
                .get::<EService>(namespace, name)
                .await?
                .map(|o| o.finalizers().to_vec()),
            ObjectKind::EServer => self
                .get::<EServer>(namespace, name)
                .await?
                .map(|o| o.finalizers().to_vec()),
            ObjectKind::EGateway => self
                .get::<EGateway>(namespace, name)
                .await?
                .map(|o| o.finalizers().to_vec()),
        };
        Ok(meta)
    }

    async fn write_finalizers(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        self.merge_kind(kind, namespace, name, &patch, false).await
    }
}

fn status_patch<S: Serialize>(status: &S) -> serde_json::Value {
    serde_json::json!({ "status": status })
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<EService>, Error> {
        self.get(namespace, name).await
    }

    async fn get_server(&self, namespace: &str, name: &str) -> Result<Option<EServer>, Error> {
        self.get(namespace, name).await
    }

    async fn get_policy(&self, namespace: &str, name: &str) -> Result<Option<EPolicy>, Error> {
        self.get(namespace, name).await
    }

    async fn list_gateways(&self, namespace: &str) -> Result<Vec<EGateway>, Error> {
        let list = self
            .api::<EGateway>(namespace)
            .list(&Default::default())
            .await?;
        Ok(list.items)
    }

    async fn patch_expose_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ServiceExposeStatus,
    ) -> Result<(), Error> {
        self.merge::<ServiceExpose>(namespace, name, &status_patch(status), true)
            .await
    }

    async fn patch_lifecycle_status(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
        status: &LifecycleStatus,
    ) -> Result<(), Error> {
        self.merge_kind(kind, namespace, name, &status_patch(status), true)
            .await
    }

    async fn set_virtual_presence_ip(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
        ip: &str,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "spec": {
                "virtualPresenceIp": ip
            }
        });
        self.merge_kind(kind, namespace, name, &patch, false).await
    }

    async fn apply_virtual_presence(
        &self,
        namespace: &str,
        presence: &VirtualPresence,
    ) -> Result<(), Error> {
        let name = presence.name_any();
        self.api::<VirtualPresence>(namespace)
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(presence),
            )
            .await?;
        Ok(())
    }

    async fn delete_virtual_presence(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self
            .api::<VirtualPresence>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn add_finalizer(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let Some(mut finalizers) = self.finalizers(kind, namespace, name).await? else {
            return Ok(());
        };
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.write_finalizers(kind, namespace, name, finalizers).await
    }

    async fn remove_finalizer(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let Some(finalizers) = self.finalizers(kind, namespace, name).await? else {
            return Ok(());
        };
        if !finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        let remaining = finalizers.into_iter().filter(|f| f != finalizer).collect();
        self.write_finalizers(kind, namespace, name, remaining).await
    }
}

/// Shared state of all controllers
pub struct Context {
    /// Store access (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Virtual presence allocator
    pub allocator: Arc<VirtualPresenceAllocator>,
    /// Where planned directives go
    pub sink: Arc<dyn DirectiveSink>,
    /// Next hop of host routes
    pub tap_ip: Ipv4Addr,
    /// Per-object failure tracking for requeue delays
    pub backoff: KeyedBackoff,
}

impl Context {
    /// Create a builder; the directive sink is required
    pub fn builder(client: Client, sink: Arc<dyn DirectiveSink>) -> ContextBuilder {
        ContextBuilder::new(client, sink)
    }

    /// Create a context for testing with a mock store
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        sink: Arc<dyn DirectiveSink>,
        allocator: Arc<VirtualPresenceAllocator>,
    ) -> Self {
        Self {
            kube,
            allocator,
            sink,
            tap_ip: crate::DEFAULT_TAP_IP,
            backoff: KeyedBackoff::default(),
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    sink: Arc<dyn DirectiveSink>,
    kube: Option<Arc<dyn KubeClient>>,
    allocator: Option<Arc<VirtualPresenceAllocator>>,
    tap_ip: Ipv4Addr,
}

impl ContextBuilder {
    fn new(client: Client, sink: Arc<dyn DirectiveSink>) -> Self {
        Self {
            client,
            sink,
            kube: None,
            allocator: None,
            tap_ip: crate::DEFAULT_TAP_IP,
        }
    }

    /// Override the store client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Use an allocator rebuilt from stored objects
    pub fn allocator(mut self, allocator: Arc<VirtualPresenceAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Set the next hop of host routes
    pub fn tap_ip(mut self, tap_ip: Ipv4Addr) -> Self {
        self.tap_ip = tap_ip;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            allocator: self.allocator.unwrap_or_default(),
            sink: self.sink,
            tap_ip: self.tap_ip,
            backoff: KeyedBackoff::default(),
        }
    }
}

/// Backoff key of an object, `<kind>/<namespace>/<name>`
pub(crate) fn object_key<K: ResourceExt>(kind: ObjectKind, obj: &K) -> String {
    format!(
        "{}/{}/{}",
        kind,
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

fn requeue_after_failure<K: ResourceExt>(
    kind: ObjectKind,
    obj: &K,
    error: &Error,
    ctx: &Context,
) -> Action {
    let key = object_key(kind, obj);
    if !error.is_retryable() {
        warn!(?error, object = %key, "reconciliation failed permanently");
        ctx.backoff.reset(&key);
        return Action::await_change();
    }
    let delay = ctx.backoff.next_delay(&key);
    error!(
        ?error,
        object = %key,
        failures = ctx.backoff.failures(&key),
        retry_in = ?delay,
        "reconciliation failed"
    );
    Action::requeue(delay)
}

/// Error policy of the `ServiceExpose` controller
pub fn expose_error_policy(obj: Arc<ServiceExpose>, error: &Error, ctx: Arc<Context>) -> Action {
    requeue_after_failure(ObjectKind::ServiceExpose, obj.as_ref(), error, &ctx)
}

/// Error policy of the `EService` controller
pub fn service_error_policy(obj: Arc<EService>, error: &Error, ctx: Arc<Context>) -> Action {
    requeue_after_failure(ObjectKind::EService, obj.as_ref(), error, &ctx)
}

/// Error policy of the `EServer` controller
pub fn server_error_policy(obj: Arc<EServer>, error: &Error, ctx: Arc<Context>) -> Action {
    requeue_after_failure(ObjectKind::EServer, obj.as_ref(), error, &ctx)
}

/// Error policy of the `EGateway` controller
pub fn gateway_error_policy(obj: Arc<EGateway>, error: &Error, ctx: Arc<Context>) -> Action {
    requeue_after_failure(ObjectKind::EGateway, obj.as_ref(), error, &ctx)
}

pub(crate) fn has_finalizer<K: ResourceExt>(obj: &K) -> bool {
    obj.finalizers().iter().any(|f| f == FINALIZER)
}

pub(crate) fn is_deleting<K: ResourceExt>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}
