use crate::{
    backoff::Backoff,
    cluster::{ClusterApi, KubeClusterApi, Managed},
    metrics::ReconcileMetrics,
    render::{render, Desired},
    workload::Workload,
    Error,
};
use chrono::{SecondsFormat, Utc};
use futures::prelude::*;
use kube::{
    runtime::{
        controller::{Action, Config as ControllerConfig, Controller},
        reflector::ObjectRef,
        watcher,
    },
    Api, Client, Resource, ResourceExt,
};
use mesh_ingress_controller_core::{
    build, NetworkConfig, Protocol, ProtocolUnsupported, CONTROLLER_NAME,
};
use mesh_ingress_controller_k8s_api::{
    labels, metav1::OwnerReference, workload::NETWORKING_CONDITION, Certificate, Condition,
    Deployment, DestinationRule, Gateway, Ingress, IngressType, Labels, ObjectMeta,
    VirtualService, WorkloadStatus,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::{sync::watch, time::Duration};
use tracing::{debug, info, info_span, instrument, warn, Instrument};

/// Converged workloads are re-checked periodically to mirror replica counts
/// and repair drift.
const RESYNC_PERIOD: Duration = Duration::from_secs(300);

/// Followers wait this long before checking whether they became leader.
const FOLLOWER_REQUEUE: Duration = Duration::from_secs(30);

/// Reasons recorded on the `Networking` condition.
mod reason {
    pub const READY: &str = "Ready";
    pub const PENDING: &str = "NetworkingPending";
    pub const NONE: &str = "NoNetworking";
    pub const REJECTED: &str = "NetworkingRejected";
}

/// State shared by every reconcile of a controller.
pub struct Context<C> {
    pub cluster: C,
    pub config: Arc<NetworkConfig>,
    /// True while this replica holds the write lease.
    pub leader: watch::Receiver<bool>,
    pub metrics: ReconcileMetrics,
    pub backoff: Backoff,
}

// === impl Context ===

impl<C> Context<C> {
    pub fn new(
        cluster: C,
        config: Arc<NetworkConfig>,
        leader: watch::Receiver<bool>,
        metrics: ReconcileMetrics,
    ) -> Self {
        Self {
            cluster,
            config,
            leader,
            metrics,
            backoff: Backoff::default(),
        }
    }

    fn is_leader(&self) -> bool {
        *self.leader.borrow()
    }
}

/// Runs the controller for workload kind `W` until the process shuts down.
pub async fn run<W>(
    client: Client,
    ctx: Arc<Context<KubeClusterApi>>,
    concurrency: u16,
    certificates: bool,
) where
    W: Workload,
{
    let kind = W::kind(&()).to_string();
    let selector = format!("{}={}", labels::MANAGED_BY_KEY, CONTROLLER_NAME);
    let owned = || watcher::Config::default().labels(&selector);

    let mut controller = Controller::new(Api::<W>::all(client.clone()), watcher::Config::default())
        .owns(Api::<VirtualService>::all(client.clone()), owned())
        .owns(Api::<Gateway>::all(client.clone()), owned())
        .owns(Api::<DestinationRule>::all(client.clone()), owned())
        .owns(Api::<Ingress>::all(client.clone()), owned());
    if certificates {
        controller = controller.owns(Api::<Certificate>::all(client), owned());
    }

    info!(%kind, concurrency, "Starting reconciler");
    controller
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .run(
            reconcile::<W, KubeClusterApi>,
            error_policy::<W, KubeClusterApi>,
            ctx,
        )
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(%obj, "Reconciled"),
                Err(error) => debug!(%error, "Reconcile failed"),
            }
        })
        .instrument(info_span!("reconciler", %kind))
        .await
}

/// Drives a workload's networking objects toward its spec.
#[instrument(skip_all, fields(
    kind = %W::kind(&()),
    namespace = ?workload.namespace(),
    name = %workload.name_any(),
))]
pub async fn reconcile<W, C>(workload: Arc<W>, ctx: Arc<Context<C>>) -> Result<Action, Error>
where
    W: Workload,
    C: ClusterApi,
{
    let kind = W::kind(&()).to_string();
    let ns = workload
        .namespace()
        .ok_or(Error::MissingObjectKey("namespace"))?;

    if workload.meta().deletion_timestamp.is_some() {
        // Managed objects are garbage collected through owner references.
        ctx.backoff.reset(&ObjectRef::from_obj(&*workload));
        return Ok(Action::await_change());
    }
    if !ctx.is_leader() {
        debug!("Not the leader; skipping");
        return Ok(Action::requeue(FOLLOWER_REQUEUE));
    }

    let generation = workload.meta().generation;
    let mut status = workload.status().cloned().unwrap_or_default();
    match converge(&*workload, &ns, &ctx).await {
        Ok(hosts) => {
            ctx.backoff.reset(&ObjectRef::from_obj(&*workload));
            let ready = if hosts.is_empty() {
                condition(true, reason::NONE, "No hosts requested".to_string(), generation)
            } else {
                condition(true, reason::READY, hosts.join(", "), generation)
            };
            status.domain = hosts.into_iter().next();
            status.set_condition(ready);
            update_status(&*workload, &ns, status, &ctx).await?;
            ctx.metrics.record(&kind, "ready");
            Ok(Action::requeue(RESYNC_PERIOD))
        }

        Err(error) if error.is_permanent() => {
            warn!(%error, "Networking rejected");
            let message = match &error {
                Error::Rejected { .. } => error.to_string(),
                _ => format!("{}: {error}", error.code()),
            };
            status.set_condition(condition(false, reason::REJECTED, message, generation));
            update_status(&*workload, &ns, status, &ctx).await?;
            ctx.metrics.record(&kind, error.code());
            Ok(Action::await_change())
        }

        Err(error) => {
            status.set_condition(condition(false, reason::PENDING, error.to_string(), generation));
            if let Err(status_error) = update_status(&*workload, &ns, status, &ctx).await {
                debug!(error = %status_error, "Failed to record pending status");
            }
            ctx.metrics.record(&kind, "transient");
            Err(error)
        }
    }
}

/// Requeues a failed reconcile with per-object exponential backoff.
pub fn error_policy<W, C>(workload: Arc<W>, error: &Error, ctx: Arc<Context<C>>) -> Action
where
    W: Workload,
    C: ClusterApi,
{
    let delay = ctx.backoff.next(&ObjectRef::from_obj(&*workload));
    warn!(
        namespace = ?workload.namespace(),
        name = %workload.name_any(),
        %error,
        ?delay,
        "Reconcile failed; retrying",
    );
    Action::requeue(delay)
}

/// Converges the cluster toward the workload's rendered objects, returning
/// the hosts it now serves.
async fn converge<W, C>(workload: &W, ns: &str, ctx: &Context<C>) -> Result<Vec<String>, Error>
where
    W: Workload,
    C: ClusterApi,
{
    let (mut params, unsupported) = workload.networking_params(&ctx.config)?;
    if let Some(error) = unsupported {
        warn!(%error, "Serving as HTTP");
    }
    let ingress_type = workload.ingress_type();
    if ingress_type == IngressType::Nginx && params.protocol == Protocol::Tcp {
        let error = ProtocolUnsupported(format!("{} via {ingress_type}", params.protocol));
        warn!(%error, "Serving as HTTP");
        params.protocol = Protocol::Http;
    }

    let owner = workload
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey("metadata.uid"))?;

    let (hosts, desired) = match build(&params, &ctx.config) {
        Some(spec) => (
            spec.hosts.clone(),
            render(&spec, ingress_type, &ctx.config, &owner),
        ),
        None => (Vec::new(), Desired::default()),
    };
    let Desired {
        certificate,
        gateway,
        virtual_service,
        destination_rule,
        ingress,
    } = desired;
    let workload_ref = &params.workload;

    // Desired objects are written before stale ones are removed so that
    // routes move off a gateway before it is deleted.
    let stale = Stale {
        certificate: certificate.is_none(),
        gateway: gateway.is_none(),
        virtual_service: virtual_service.is_none(),
        destination_rule: destination_rule.is_none(),
        ingress: ingress.is_none(),
    };
    if let Some(obj) = certificate {
        apply(ctx, obj, &owner).await?;
    }
    if let Some(obj) = gateway {
        apply(ctx, obj, &owner).await?;
    }
    if let Some(obj) = virtual_service {
        apply(ctx, obj, &owner).await?;
    }
    if let Some(obj) = destination_rule {
        apply(ctx, obj, &owner).await?;
    }
    if let Some(obj) = ingress {
        apply(ctx, obj, &owner).await?;
    }

    if stale.virtual_service {
        remove::<VirtualService, _>(ctx, ns, &workload_ref.virtual_service_name(), &owner).await?;
    }
    if stale.ingress {
        remove::<Ingress, _>(ctx, ns, &workload_ref.ingress_name(), &owner).await?;
    }
    if stale.gateway {
        remove::<Gateway, _>(ctx, ns, &workload_ref.gateway_name(), &owner).await?;
    }
    if stale.destination_rule {
        remove::<DestinationRule, _>(ctx, ns, &workload_ref.destination_rule_name(), &owner)
            .await?;
    }
    if stale.certificate {
        remove::<Certificate, _>(ctx, ns, &workload_ref.certificate_name(), &owner).await?;
    }

    Ok(hosts)
}

struct Stale {
    certificate: bool,
    gateway: bool,
    virtual_service: bool,
    destination_rule: bool,
    ingress: bool,
}

/// Creates or replaces `desired`. Unchanged objects are not written.
async fn apply<K, C>(ctx: &Context<C>, mut desired: K, owner: &OwnerReference) -> Result<(), Error>
where
    K: Managed,
    C: ClusterApi,
{
    let kind = K::kind(&());
    let ns = desired.namespace().unwrap_or_default();
    let name = desired.name_any();

    let Some(existing) = ctx.cluster.get::<K>(&ns, &name).await? else {
        ctx.cluster.create(&desired).await?;
        info!(%kind, %ns, %name, "Created");
        return Ok(());
    };

    if !is_owned(existing.meta(), owner) {
        return Err(Error::ForeignResource {
            kind: kind.to_string(),
            namespace: ns,
            name,
        });
    }
    if !differs(&existing, &desired)? {
        debug!(%kind, %ns, %name, "Unchanged");
        return Ok(());
    }

    let current = existing.meta();
    let meta = desired.meta_mut();
    meta.resource_version = current.resource_version.clone();
    meta.uid = current.uid.clone();
    meta.labels = merged(&current.labels, meta.labels.take());
    meta.annotations = merged(&current.annotations, meta.annotations.take());
    ctx.cluster.replace(&desired).await?;
    info!(%kind, %ns, %name, "Updated");
    Ok(())
}

/// Deletes a managed object that is no longer desired. Objects owned by
/// anything else, and the shared gateway, are left alone.
async fn remove<K, C>(
    ctx: &Context<C>,
    ns: &str,
    name: &str,
    owner: &OwnerReference,
) -> Result<(), Error>
where
    K: Managed,
    C: ClusterApi,
{
    let kind = K::kind(&());
    let shared = &ctx.config.shared_gateway;
    if kind == Gateway::kind(&()) && shared.namespace == ns && shared.name == name {
        return Ok(());
    }

    match ctx.cluster.get::<K>(ns, name).await? {
        Some(existing) if is_owned(existing.meta(), owner) => {
            ctx.cluster.delete::<K>(ns, name).await?;
            info!(%kind, %ns, %name, "Deleted");
        }
        Some(_) => debug!(%kind, %ns, %name, "Leaving unowned object"),
        None => {}
    }
    Ok(())
}

fn is_owned(meta: &ObjectMeta, owner: &OwnerReference) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|r| r.uid == owner.uid)
}

/// Compares everything but metadata and status. Desired labels and
/// annotations need only be present; keys added by others are kept.
fn differs<K: Managed>(existing: &K, desired: &K) -> Result<bool, Error> {
    fn body(obj: &impl serde::Serialize) -> Result<serde_json::Value, Error> {
        let mut value = serde_json::to_value(obj)?;
        if let Some(fields) = value.as_object_mut() {
            for field in ["apiVersion", "kind", "metadata", "status"] {
                fields.remove(field);
            }
        }
        Ok(value)
    }

    let (current, wanted) = (existing.meta(), desired.meta());
    let empty = BTreeMap::new();
    let labels_match = Labels::from(wanted.labels.clone())
        .is_subset_of(current.labels.as_ref().unwrap_or(&empty));
    let annotations_match = Labels::from(wanted.annotations.clone())
        .is_subset_of(current.annotations.as_ref().unwrap_or(&empty));

    Ok(!labels_match || !annotations_match || body(existing)? != body(desired)?)
}

fn merged(
    current: &Option<BTreeMap<String, String>>,
    desired: Option<BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    let mut map = current.clone().unwrap_or_default();
    map.extend(desired.unwrap_or_default());
    (!map.is_empty()).then_some(map)
}

fn condition(ok: bool, reason: &str, message: String, generation: Option<i64>) -> Condition {
    Condition {
        type_: NETWORKING_CONDITION.to_string(),
        status: if ok { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message,
        observed_generation: generation,
        last_transition_time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }
}

/// Mirrors the Deployment's available replicas and patches the status if
/// anything changed.
async fn update_status<W, C>(
    workload: &W,
    ns: &str,
    mut status: WorkloadStatus,
    ctx: &Context<C>,
) -> Result<(), Error>
where
    W: Workload,
    C: ClusterApi,
{
    match ctx
        .cluster
        .get::<Deployment>(ns, &workload.deployment_name())
        .await
    {
        Ok(Some(deployment)) => {
            status.available_replicas = Some(
                deployment
                    .status
                    .and_then(|s| s.available_replicas)
                    .unwrap_or(0),
            );
        }
        Ok(None) => status.available_replicas = None,
        Err(error) => debug!(%error, "Failed to read deployment; keeping replica count"),
    }

    if workload.status() == Some(&status) {
        return Ok(());
    }
    let name = workload.name_any();
    ctx.cluster
        .patch_status::<W>(ns, &name, serde_json::to_value(&status)?)
        .await?;
    debug!(?status, "Patched status");
    Ok(())
}
