use crate::k8s::{self, labels::MANAGED_BY_KEY, Deployment, ObjectMeta, Resource};
use anyhow::{Context, Result};
use k8s_openapi::api::coordination::v1 as coordv1;
use kubert::lease::Claim;
use mesh_ingress_controller_core::CONTROLLER_NAME;
use std::sync::Arc;
use tokio::{sync::watch, time};
use tracing::{debug, info};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const LEASE_NAME: &str = "mesh-ingress-controller-write";
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);

pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    deployment_name: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<Claim>>> {
    // The controller's Deployment owns the Lease so that it is removed with
    // the controller.
    let api = k8s::Api::<Deployment>::namespaced(runtime.client(), ns);
    let deployment = api
        .get(deployment_name)
        .await
        .with_context(|| format!("failed to get deployment {ns}/{deployment_name}"))?;
    let owner = deployment
        .controller_owner_ref(&())
        .context("controller deployment is missing a name or uid")?;

    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(ns.to_string()),
            // Specifying a resource version of "0" means that we will
            // only create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            owner_references: Some(vec![owner]),
            labels: Some(
                [(MANAGED_BY_KEY.to_string(), CONTROLLER_NAME.to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = k8s::Api::<coordv1::Lease>::namespaced(runtime.client(), ns);
    match api
        .patch(
            LEASE_NAME,
            &k8s::PatchParams {
                field_manager: Some(CONTROLLER_NAME.to_string()),
                ..Default::default()
            },
            &k8s::Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => info!(?lease, "Created Lease resource"),
        Err(k8s::Error::Api(_)) => debug!("Lease already exists, no need to create it"),
        Err(error) => {
            return Err(error.into());
        }
    };

    let params = kubert::lease::ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, LEASE_NAME)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(claims)
}

/// Tracks whether `hostname` currently holds the write lease.
///
/// Claims are re-evaluated on every update and once per grace period so that
/// an expired claim is noticed even when the lease manager publishes nothing.
pub fn leader(mut claims: watch::Receiver<Arc<Claim>>, hostname: String) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(claims.borrow().is_current_for(&hostname));
    tokio::spawn(async move {
        let mut ticks = time::interval(RENEW_GRACE_PERIOD);
        ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                res = claims.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
                _ = ticks.tick() => {}
                _ = tx.closed() => break,
            }

            let is_leader = claims.borrow_and_update().is_current_for(&hostname);
            tx.send_if_modified(|current| {
                if *current == is_leader {
                    return false;
                }
                info!(leader = is_leader, "Write lease ownership changed");
                *current = is_leader;
                true
            });
        }
        debug!("Lease claims closed");
        tx.send_replace(false);
    });
    rx
}
