//! ServiceExpose reconciliation
//!
//! Resolve the referenced service and the servers allowed by the referenced
//! policies, check that every one of them has a virtual presence, plan the
//! directives, dispatch the difference to the previous plan and record the
//! result in status. Deletion dispatches the inverse of what was recorded.

use std::collections::BTreeSet;
use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::plan::{diff, plan};
use super::{has_finalizer, is_deleting, object_key, Context, ObjectKind, FINALIZER};
use crate::crd::{
    Condition, ConditionStatus, EServer, EService, ExposePhase, PresenceHolder, ServiceExpose,
    ServiceExposeStatus,
};
use crate::dataplane::{Directive, DirectiveOp};
use crate::Error;

/// Reconcile a ServiceExpose
#[instrument(skip(expose, ctx), fields(expose = %expose.name_any()))]
pub async fn reconcile(expose: Arc<ServiceExpose>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = expose.namespace().unwrap_or_default();
    let name = expose.name_any();
    let key = object_key(ObjectKind::ServiceExpose, expose.as_ref());
    let applied = expose
        .status
        .as_ref()
        .map(|s| s.applied_directives.clone())
        .unwrap_or_default();

    if is_deleting(expose.as_ref()) {
        if has_finalizer(expose.as_ref()) {
            teardown(&key, &applied, &ctx).await;
            ctx.kube
                .remove_finalizer(ObjectKind::ServiceExpose, &namespace, &name, FINALIZER)
                .await?;
            info!(directives = applied.len(), "Tore down ServiceExpose");
        }
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    }

    if !has_finalizer(expose.as_ref()) {
        ctx.kube
            .add_finalizer(ObjectKind::ServiceExpose, &namespace, &name, FINALIZER)
            .await?;
    }

    let (service, servers) = match resolve(&expose, &namespace, &ctx).await {
        Ok(resolved) => resolved,
        Err(Error::Resolution(msg)) | Err(Error::Validation(msg)) => {
            return record_unresolved(&expose, &namespace, applied, msg, &ctx).await;
        }
        Err(e) => return Err(e),
    };

    if let Some(msg) = unready(&service, &servers) {
        return record_unresolved(&expose, &namespace, applied, msg, &ctx).await;
    }

    let planned = match plan(&service, &servers, ctx.tap_ip) {
        Ok(planned) => planned,
        Err(Error::Resolution(msg)) | Err(Error::Validation(msg)) => {
            return record_unresolved(&expose, &namespace, applied, msg, &ctx).await;
        }
        Err(e) => return Err(e),
    };

    let (to_apply, to_remove) = diff(&applied, &planned);
    let mut recorded: BTreeSet<Directive> = planned;
    let mut failed = 0usize;

    for directive in &to_remove {
        if let Err(e) = ctx.sink.dispatch(&key, DirectiveOp::Remove, directive).await {
            warn!(directive = %directive, error = %e, "Failed to remove stale directive");
            // Keep it recorded so the next pass or teardown retries the removal
            recorded.insert(directive.clone());
            failed += 1;
        }
    }
    for directive in &to_apply {
        if let Err(e) = ctx.sink.dispatch(&key, DirectiveOp::Apply, directive).await {
            warn!(directive = %directive, error = %e, "Failed to apply directive");
            failed += 1;
        }
    }

    let mut status = ServiceExposeStatus::with_phase(ExposePhase::Active)
        .directives(recorded.into_iter().collect())
        .condition(Condition::new(
            "Ready",
            ConditionStatus::True,
            "Programmed",
            format!("{} servers may reach {}", servers.len(), service.name_any()),
        ))
        .observed(expose.metadata.generation);
    if failed > 0 {
        status = status.message(format!("{} directives failed, retrying", failed));
    }
    write_status(&expose, &namespace, &status, &ctx).await?;

    if failed > 0 {
        let delay = ctx.backoff.next_delay(&key);
        warn!(failed, retry_in = ?delay, "Data plane programming incomplete");
        return Ok(Action::requeue(delay));
    }

    ctx.backoff.reset(&key);
    info!(
        directives = status.applied_directives.len(),
        removed = to_remove.len(),
        "ServiceExpose active"
    );
    Ok(Action::await_change())
}

/// Fetch the service and the allowed servers
///
/// Missing objects are resolution errors; store failures pass through.
async fn resolve(
    expose: &ServiceExpose,
    namespace: &str,
    ctx: &Context,
) -> Result<(EService, Vec<EServer>), Error> {
    let spec = &expose.spec;
    let service = ctx
        .kube
        .get_service(namespace, &spec.e_service_name)
        .await?
        .ok_or_else(|| {
            Error::resolution(format!("EService {} not found", spec.e_service_name))
        })?;

    let mut names = BTreeSet::new();
    for policy_name in &spec.e_policies {
        let policy = ctx
            .kube
            .get_policy(namespace, policy_name)
            .await?
            .ok_or_else(|| Error::resolution(format!("EPolicy {} not found", policy_name)))?;
        names.extend(policy.spec.e_servers.iter().cloned());
    }

    let mut servers = Vec::with_capacity(names.len());
    for server_name in &names {
        let server = ctx
            .kube
            .get_server(namespace, server_name)
            .await?
            .ok_or_else(|| Error::resolution(format!("EServer {} not found", server_name)))?;
        if spec.admits_site(server.site()) {
            servers.push(server);
        } else {
            debug!(server = %server_name, site = %server.site(), "Server site not admitted");
        }
    }
    Ok((service, servers))
}

/// Name the first object still waiting for a virtual presence
fn unready(service: &EService, servers: &[EServer]) -> Option<String> {
    if service.virtual_presence_ip().is_empty() {
        return Some(format!(
            "EService {} has no virtual presence yet",
            service.name_any()
        ));
    }
    servers
        .iter()
        .find(|s| s.virtual_presence_ip().is_empty())
        .map(|s| format!("EServer {} has no virtual presence yet", s.name_any()))
}

/// Record `Error` phase without touching what is programmed
async fn record_unresolved(
    expose: &ServiceExpose,
    namespace: &str,
    applied: Vec<Directive>,
    msg: String,
    ctx: &Context,
) -> Result<Action, Error> {
    info!(reason = %msg, "ServiceExpose unresolved");
    let status = ServiceExposeStatus::with_phase(ExposePhase::Error)
        .message(msg.clone())
        .directives(applied)
        .condition(Condition::new(
            "Ready",
            ConditionStatus::False,
            "Unresolved",
            msg,
        ))
        .observed(expose.metadata.generation);
    write_status(expose, namespace, &status, ctx).await?;
    ctx.backoff
        .reset(&object_key(ObjectKind::ServiceExpose, expose));
    Ok(Action::await_change())
}

/// Patch status unless the outcome is unchanged; every write re-triggers
async fn write_status(
    expose: &ServiceExpose,
    namespace: &str,
    status: &ServiceExposeStatus,
    ctx: &Context,
) -> Result<(), Error> {
    if expose
        .status
        .as_ref()
        .is_some_and(|current| current.is_equivalent(status))
    {
        return Ok(());
    }
    ctx.kube
        .patch_expose_status(namespace, &expose.name_any(), status)
        .await
}

/// Release this expose's claim on every applied directive
async fn teardown(owner: &str, applied: &[Directive], ctx: &Context) {
    for directive in applied {
        if let Err(e) = ctx.sink.dispatch(owner, DirectiveOp::Remove, directive).await {
            warn!(directive = %directive, error = %e, "Failed to remove directive during teardown");
        }
    }
}
