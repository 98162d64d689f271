use crate::{
    error_policy, reconcile,
    testing::{AdmissionCall, AdmissionHook, FakeCluster},
    Context, Error, ReconcileMetrics,
};
use async_trait::async_trait;
use kube::runtime::{controller::Action, reflector::ObjectRef};
use mesh_ingress_controller_core::NetworkConfig;
use mesh_ingress_controller_k8s_api::{
    api::apps::v1::DeploymentStatus,
    istio::VirtualServiceSpec,
    metav1::Time,
    workload::{AppSpec, ServiceRef, NETWORKING_CONDITION},
    App, Condition, Deployment, IngressType, ObjectMeta, ResourceExt, VirtualService,
};
use pretty_assertions::{assert_eq, assert_ne};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;

const NS: &str = "ns-demo";

fn context(cluster: FakeCluster, leader: bool) -> Arc<Context<FakeCluster>> {
    let (_, rx) = watch::channel(leader);
    Arc::new(Context::new(
        cluster,
        Arc::new(NetworkConfig::new("cloud.sealos.io")),
        rx,
        ReconcileMetrics::default(),
    ))
}

fn app(hosts: &[&str]) -> App {
    let mut app = App::new(
        "demo",
        AppSpec {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            service: ServiceRef {
                name: "demo".to_string(),
                port: 3000,
            },
            ..Default::default()
        },
    );
    app.metadata.namespace = Some(NS.to_string());
    app.metadata.generation = Some(1);
    app
}

fn stored(ctx: &Context<FakeCluster>) -> App {
    ctx.cluster.get_obj::<App>(NS, "demo").expect("app must exist")
}

fn edit(ctx: &Context<FakeCluster>, f: impl FnOnce(&mut AppSpec)) {
    let mut app = stored(ctx);
    f(&mut app.spec);
    app.metadata.generation = app.metadata.generation.map(|g| g + 1);
    ctx.cluster.insert(&app);
}

async fn reconcile_stored(ctx: &Arc<Context<FakeCluster>>) -> Result<Action, Error> {
    reconcile(Arc::new(stored(ctx)), ctx.clone()).await
}

fn networking(ctx: &Context<FakeCluster>) -> Condition {
    stored(ctx)
        .status
        .and_then(|s| s.condition(NETWORKING_CONDITION).cloned())
        .expect("networking condition must be set")
}

fn names(ctx: &Context<FakeCluster>, kind: &str) -> Vec<String> {
    ctx.cluster.names(kind, NS)
}

#[tokio::test]
async fn public_hosts_use_the_shared_gateway() {
    let ctx = context(FakeCluster::new(), true);
    let app = ctx.cluster.insert(&app(&["demo.cloud.sealos.io"]));

    let action = reconcile_stored(&ctx).await.expect("reconcile must succeed");
    assert_eq!(action, Action::requeue(Duration::from_secs(300)));

    assert_eq!(names(&ctx, "Gateway"), Vec::<String>::new());
    let vs = ctx
        .cluster
        .get_obj::<VirtualService>(NS, "demo-vs")
        .expect("virtual service must exist");
    assert_eq!(vs.spec.hosts, vec!["demo.cloud.sealos.io"]);
    assert_eq!(vs.spec.gateways, vec!["istio-system/sealos-gateway"]);
    assert_eq!(vs.owner_references()[0].uid, app.uid().expect("uid"));

    let status = stored(&ctx).status.expect("status must be set");
    assert_eq!(status.domain.as_deref(), Some("demo.cloud.sealos.io"));
    let condition = networking(&ctx);
    assert_eq!(condition.status, "True");
    assert_eq!(condition.reason, "Ready");
    assert_eq!(condition.observed_generation, Some(1));
    assert_eq!(ctx.metrics.count("App", "ready"), 1);
}

#[tokio::test]
async fn converged_workloads_are_not_rewritten() {
    let ctx = context(FakeCluster::new(), true);
    ctx.cluster.insert(&app(&["demo.cloud.sealos.io"]));

    reconcile_stored(&ctx).await.expect("reconcile must succeed");
    let writes = ctx.cluster.writes();
    assert!(writes > 0);

    reconcile_stored(&ctx).await.expect("reconcile must succeed");
    assert_eq!(ctx.cluster.writes(), writes);
}

#[tokio::test]
async fn custom_domains_get_a_dedicated_gateway() {
    let ctx = context(FakeCluster::new(), true);
    ctx.cluster.insert(&app(&["demo.cloud.sealos.io"]));
    reconcile_stored(&ctx).await.expect("reconcile must succeed");

    edit(&ctx, |spec| spec.custom_domain = Some("www.example.org".to_string()));
    reconcile_stored(&ctx).await.expect("reconcile must succeed");
    assert_eq!(names(&ctx, "Gateway"), vec!["demo-gateway"]);
    let vs = ctx
        .cluster
        .get_obj::<VirtualService>(NS, "demo-vs")
        .expect("virtual service must exist");
    assert_eq!(vs.spec.gateways, vec!["ns-demo/demo-gateway"]);
    assert_eq!(vs.spec.hosts, vec!["demo.cloud.sealos.io", "www.example.org"]);

    edit(&ctx, |spec| spec.custom_domain = None);
    reconcile_stored(&ctx).await.expect("reconcile must succeed");
    assert_eq!(names(&ctx, "Gateway"), Vec::<String>::new());
    let vs = ctx
        .cluster
        .get_obj::<VirtualService>(NS, "demo-vs")
        .expect("virtual service must exist");
    assert_eq!(vs.spec.gateways, vec!["istio-system/sealos-gateway"]);
}

#[tokio::test]
async fn removing_all_hosts_removes_routing() {
    let ctx = context(FakeCluster::new(), true);
    ctx.cluster.insert(&app(&["demo.cloud.sealos.io"]));
    reconcile_stored(&ctx).await.expect("reconcile must succeed");

    edit(&ctx, |spec| spec.hosts.clear());
    reconcile_stored(&ctx).await.expect("reconcile must succeed");
    assert_eq!(names(&ctx, "VirtualService"), Vec::<String>::new());

    let status = stored(&ctx).status.expect("status must be set");
    assert_eq!(status.domain, None);
    assert_eq!(networking(&ctx).reason, "NoNetworking");
}

#[tokio::test]
async fn grpc_backends_get_a_destination_rule() {
    let ctx = context(FakeCluster::new(), true);
    let mut grpc = app(&["demo.cloud.sealos.io"]);
    grpc.spec.protocol = Some("grpc".to_string());
    ctx.cluster.insert(&grpc);

    reconcile_stored(&ctx).await.expect("reconcile must succeed");
    assert_eq!(names(&ctx, "DestinationRule"), vec!["demo-dr"]);

    edit(&ctx, |spec| spec.protocol = None);
    reconcile_stored(&ctx).await.expect("reconcile must succeed");
    assert_eq!(names(&ctx, "DestinationRule"), Vec::<String>::new());
}

#[tokio::test]
async fn switching_ingress_types_replaces_objects() {
    let ctx = context(FakeCluster::new(), true);
    let mut nginx = app(&["demo.cloud.sealos.io"]);
    nginx.spec.ingress_type = IngressType::Nginx;
    ctx.cluster.insert(&nginx);

    reconcile_stored(&ctx).await.expect("reconcile must succeed");
    assert_eq!(names(&ctx, "Ingress"), vec!["demo-ingress"]);
    assert_eq!(names(&ctx, "VirtualService"), Vec::<String>::new());

    edit(&ctx, |spec| spec.ingress_type = IngressType::Istio);
    reconcile_stored(&ctx).await.expect("reconcile must succeed");
    assert_eq!(names(&ctx, "Ingress"), Vec::<String>::new());
    assert_eq!(names(&ctx, "VirtualService"), vec!["demo-vs"]);
}

#[tokio::test]
async fn nginx_serves_tcp_as_http() {
    let ctx = context(FakeCluster::new(), true);
    let mut tcp = app(&["demo.cloud.sealos.io"]);
    tcp.spec.protocol = Some("tcp".to_string());
    tcp.spec.ingress_type = IngressType::Nginx;
    ctx.cluster.insert(&tcp);

    reconcile_stored(&ctx).await.expect("reconcile must succeed");
    assert_eq!(names(&ctx, "Ingress"), vec!["demo-ingress"]);
    assert_eq!(networking(&ctx).reason, "Ready");
}

#[tokio::test]
async fn foreign_objects_are_not_adopted() {
    let ctx = context(FakeCluster::new(), true);
    ctx.cluster.insert(&app(&["demo.cloud.sealos.io"]));
    let mut foreign = VirtualService::new("demo-vs", VirtualServiceSpec::default());
    foreign.metadata.namespace = Some(NS.to_string());
    ctx.cluster.insert(&foreign);

    let action = reconcile_stored(&ctx).await.expect("reconcile must succeed");
    assert_eq!(action, Action::await_change());

    let condition = networking(&ctx);
    assert_eq!(condition.status, "False");
    assert_eq!(condition.reason, "NetworkingRejected");
    assert!(
        condition.message.starts_with("ForeignResource: "),
        "{}",
        condition.message
    );
    let vs = ctx
        .cluster
        .get_obj::<VirtualService>(NS, "demo-vs")
        .expect("virtual service must exist");
    assert_eq!(vs.spec, VirtualServiceSpec::default());
}

struct DenyHost(&'static str);

#[async_trait]
impl AdmissionHook for DenyHost {
    async fn review(&self, call: AdmissionCall) -> Result<(), String> {
        let claims = call
            .object
            .as_ref()
            .and_then(|o| o["spec"]["hosts"].as_array().cloned())
            .unwrap_or_default()
            .iter()
            .any(|h| h == self.0);
        if claims {
            return Err(format!(
                "OwnershipConflict: host {} is owned by namespace ns-other",
                self.0
            ));
        }
        Ok(())
    }
}

#[tokio::test]
async fn admission_denials_wait_for_a_change() {
    let ctx = context(
        FakeCluster::with_admission(Arc::new(DenyHost("demo.cloud.sealos.io"))),
        true,
    );
    ctx.cluster.insert(&app(&["demo.cloud.sealos.io"]));

    let action = reconcile_stored(&ctx).await.expect("reconcile must succeed");
    assert_eq!(action, Action::await_change());
    assert_eq!(names(&ctx, "VirtualService"), Vec::<String>::new());

    let condition = networking(&ctx);
    assert_eq!(condition.status, "False");
    assert_eq!(condition.reason, "NetworkingRejected");
    assert_eq!(
        condition.message,
        "OwnershipConflict: host demo.cloud.sealos.io is owned by namespace ns-other"
    );
    assert_eq!(ctx.metrics.count("App", "OwnershipConflict"), 1);

    edit(&ctx, |spec| spec.hosts = vec!["other.cloud.sealos.io".to_string()]);
    reconcile_stored(&ctx).await.expect("reconcile must succeed");
    let condition = networking(&ctx);
    assert_eq!(condition.status, "True");
    assert_eq!(condition.reason, "Ready");
}

struct Unavailable;

#[async_trait]
impl AdmissionHook for Unavailable {
    async fn review(&self, _: AdmissionCall) -> Result<(), String> {
        Err("IndexUnavailable: ownership index has not completed its initial sync (retryable)"
            .to_string())
    }
}

#[tokio::test]
async fn retryable_denials_back_off_and_mark_pending() {
    let ctx = context(FakeCluster::with_admission(Arc::new(Unavailable)), true);
    ctx.cluster.insert(&app(&["demo.cloud.sealos.io"]));

    let app = Arc::new(stored(&ctx));
    let error = reconcile(app.clone(), ctx.clone())
        .await
        .expect_err("retryable denials must fail the reconcile");
    assert!(
        matches!(&error, Error::Rejected { code, retryable: true, .. } if code == "IndexUnavailable"),
        "{error:?}"
    );
    assert!(!error.is_permanent());

    let condition = networking(&ctx);
    assert_eq!(condition.reason, "NetworkingPending");
    assert_eq!(
        condition.message,
        "IndexUnavailable: ownership index has not completed its initial sync"
    );
    assert_ne!(error_policy(app, &error, ctx.clone()), Action::await_change());
}

#[tokio::test]
async fn deleted_workloads_forget_their_failures() {
    let ctx = context(FakeCluster::new(), true);
    ctx.cluster.insert(&app(&["demo.cloud.sealos.io"]));
    ctx.cluster.fail_next_write(503);

    let app = Arc::new(stored(&ctx));
    let error = reconcile(app.clone(), ctx.clone())
        .await
        .expect_err("reconcile must fail");
    error_policy(app.clone(), &error, ctx.clone());
    let obj = ObjectRef::from_obj(&*app);
    assert_eq!(ctx.backoff.failures(&obj), 1);

    let mut deleting = stored(&ctx);
    deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    let action = reconcile(Arc::new(deleting), ctx.clone())
        .await
        .expect("reconcile must succeed");
    assert_eq!(action, Action::await_change());
    assert_eq!(ctx.backoff.failures(&obj), 0);
}

#[tokio::test]
async fn followers_do_not_write() {
    let ctx = context(FakeCluster::new(), false);
    ctx.cluster.insert(&app(&["demo.cloud.sealos.io"]));

    let action = reconcile_stored(&ctx).await.expect("reconcile must succeed");
    assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    assert_eq!(ctx.cluster.writes(), 0);
    assert_eq!(stored(&ctx).status, None);
}

#[tokio::test]
async fn transient_failures_back_off_and_mark_pending() {
    let ctx = context(FakeCluster::new(), true);
    ctx.cluster.insert(&app(&["demo.cloud.sealos.io"]));
    ctx.cluster.fail_next_write(503);

    let app = Arc::new(stored(&ctx));
    let error = reconcile(app.clone(), ctx.clone())
        .await
        .expect_err("reconcile must fail");
    assert!(matches!(error, Error::Transient(_)), "{error}");
    assert!(!error.is_permanent());

    let condition = networking(&ctx);
    assert_eq!(condition.status, "False");
    assert_eq!(condition.reason, "NetworkingPending");

    let action = error_policy(app.clone(), &error, ctx.clone());
    assert_ne!(action, Action::await_change());
    let obj = ObjectRef::from_obj(&*app);
    assert_eq!(ctx.backoff.failures(&obj), 1);

    reconcile_stored(&ctx).await.expect("reconcile must succeed");
    assert_eq!(ctx.backoff.failures(&obj), 0);
    assert_eq!(networking(&ctx).reason, "Ready");
}

#[tokio::test]
async fn available_replicas_mirror_the_deployment() {
    let ctx = context(FakeCluster::new(), true);
    ctx.cluster.insert(&app(&["demo.cloud.sealos.io"]));
    ctx.cluster.insert(&Deployment {
        metadata: ObjectMeta {
            name: Some("demo".to_string()),
            namespace: Some(NS.to_string()),
            ..Default::default()
        },
        status: Some(DeploymentStatus {
            available_replicas: Some(2),
            ..Default::default()
        }),
        ..Default::default()
    });

    reconcile_stored(&ctx).await.expect("reconcile must succeed");
    let status = stored(&ctx).status.expect("status must be set");
    assert_eq!(status.available_replicas, Some(2));
}
