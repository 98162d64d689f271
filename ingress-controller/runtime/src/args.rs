use crate::{
    admission::{Admission, AdmissionMetrics},
    index::{IndexMetrics, OwnershipIndex},
    k8s::{Adminer, Api, App, Certificate, Client, Ingress, Resource, Terminal, VirtualService},
    lease,
    liveness::{self, ApiWatch},
    reconciler::{self, Context, KubeClusterApi, ReconcileMetrics, Workload},
    validation::{CheckCompliance, DnsResolver, HostValidator, IcpClient},
    webhook_config::{self, FailurePolicy},
};
use anyhow::{bail, Context as _, Result};
use clap::Parser;
use kube::runtime::watcher;
use mesh_ingress_controller_core::{
    DomainPattern, GatewayRef, IcpConfig, IssuerRef, NetworkConfig, DEFAULT_SHARED_GATEWAY,
    DEFAULT_TENANT_NAMESPACE_PREFIX,
};
use prometheus_client::registry::Registry;
use std::{collections::BTreeMap, path::PathBuf, sync::Arc};
use tokio::time::Duration;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "mesh-ingress-controller",
    about = "Exposes tenant workloads through Istio or nginx ingress"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "mesh_ingress=info,warn",
        env = "MESH_INGRESS_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(flatten)]
    network: NetworkArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// Disables the workload reconcilers.
    #[clap(long)]
    reconcilers_disabled: bool,

    /// The number of workloads of each kind reconciled concurrently.
    #[clap(long, default_value = "16")]
    reconcile_concurrency: u16,

    #[clap(long, default_value = "5000")]
    dns_timeout_ms: u64,

    #[clap(long, default_value = "5000")]
    icp_timeout_ms: u64,

    /// How long a replica that does not hold the write lease serves admission
    /// decisions from its watch-fed index once its watches stop confirming
    /// that they are healthy.
    #[clap(long, default_value = "300")]
    index_max_staleness_secs: u64,

    #[clap(long, default_value = "Ignore")]
    webhook_failure_policy: FailurePolicy,

    #[clap(long, default_value = "mesh-ingress-controller")]
    webhook_configuration_name: String,

    #[clap(long, default_value = "mesh-ingress-controller")]
    controller_deployment_name: String,

    #[clap(long, default_value = "mesh-ingress-system", env = "POD_NAMESPACE")]
    controller_namespace: String,
}

/// Networking configuration flags. `--network-config` takes precedence over
/// every other flag in this group.
#[derive(Debug, clap::Args)]
struct NetworkArgs {
    /// A YAML file holding the full networking configuration, typically a
    /// mounted ConfigMap.
    #[clap(long, env = "NETWORK_CONFIG")]
    network_config: Option<PathBuf>,

    #[clap(long, env = "BASE_DOMAIN")]
    base_domain: Option<String>,

    #[clap(long, env = "SHARED_GATEWAY", default_value = DEFAULT_SHARED_GATEWAY)]
    shared_gateway: GatewayRef,

    /// Comma-separated public domain patterns, e.g. `*.sealos.run`.
    #[clap(long, env = "PUBLIC_DOMAINS", value_delimiter = ',')]
    public_domains: Vec<DomainPattern>,

    #[clap(long, env = "TLS_ENABLED")]
    tls_enabled: bool,

    #[clap(long, env = "TLS_SECRET_NAME")]
    tls_secret: Option<String>,

    /// The cert-manager issuer for custom-domain certificates, written
    /// `[<kind>/]<name>`. The kind defaults to `ClusterIssuer`.
    #[clap(long, env = "CERT_ISSUER")]
    cert_issuer: Option<String>,

    #[clap(long, default_value = DEFAULT_TENANT_NAMESPACE_PREFIX)]
    tenant_namespace_prefix: String,

    /// Comma-separated `key=value` annotations added to networking resources
    /// in tenant namespaces.
    #[clap(long, value_delimiter = ',')]
    default_annotations: Vec<String>,

    #[clap(long, env = "ICP_ENABLED")]
    icp_enabled: bool,

    #[clap(long, env = "ICP_ENDPOINT")]
    icp_endpoint: Option<String>,

    #[clap(long, env = "ICP_KEY")]
    icp_key: Option<String>,

    #[clap(long, env = "TRACING_ENABLED")]
    tracing_enabled: bool,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            network,
            admission_controller_disabled,
            reconcilers_disabled,
            reconcile_concurrency,
            dns_timeout_ms,
            icp_timeout_ms,
            index_max_staleness_secs,
            webhook_failure_policy,
            webhook_configuration_name,
            controller_deployment_name,
            controller_namespace,
        } = self;

        let config = Arc::new(network.into_config()?);

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let mut prom = <Registry>::default();
        let index_metrics = IndexMetrics::register(prom.sub_registry_with_prefix("ownership_index"));
        let admission_metrics =
            AdmissionMetrics::register(prom.sub_registry_with_prefix("admission"));
        let reconcile_metrics =
            ReconcileMetrics::register(prom.sub_registry_with_prefix("reconcile"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        info!(
            base_domain = %config.base_domain,
            shared_gateway = %config.shared_gateway,
            tls = config.tls_enabled,
            icp = config.icp.enabled,
            "Loaded network configuration"
        );

        let hostname = std::env::var("HOSTNAME").context("HOSTNAME must be set")?;
        let claims = lease::init(
            &runtime,
            &controller_namespace,
            &controller_deployment_name,
            &hostname,
        )
        .await?;
        let leader = lease::leader(claims, hostname);

        // Rebuild the ownership index from every existing VirtualService and
        // Ingress before admitting writes.
        let index = OwnershipIndex::shared(index_metrics);
        let mut watches = Vec::<Box<dyn liveness::Watch>>::new();
        if api_resource_exists::<VirtualService>(&runtime.client()).await {
            let virtual_services = runtime.watch_all::<VirtualService>(watcher::Config::default());
            let task = tokio::spawn(
                kubert::index::namespaced(index.clone(), virtual_services)
                    .instrument(info_span!("virtualservices")),
            );
            watches.push(Box::new(ApiWatch::new(
                task,
                Api::<VirtualService>::all(runtime.client()),
            )));
        } else {
            warn!("virtualservices.networking.istio.io resource kind not found, skipping watches");
        }
        let ingresses = runtime.watch_all::<Ingress>(watcher::Config::default());
        let task = tokio::spawn(
            kubert::index::namespaced(index.clone(), ingresses).instrument(info_span!("ingresses")),
        );
        watches.push(Box::new(ApiWatch::new(
            task,
            Api::<Ingress>::all(runtime.client()),
        )));

        // Quiet watches deliver nothing, so followers learn that their index
        // is still current from a heartbeat.
        let max_staleness = Duration::from_secs(index_max_staleness_secs);
        liveness::spawn(
            index.clone(),
            watches,
            (max_staleness / 3).max(Duration::from_secs(1)),
        );

        if !admission_controller_disabled {
            webhook_config::apply(
                runtime.client(),
                &webhook_configuration_name,
                webhook_failure_policy,
            )
            .await;
        }

        if reconcilers_disabled {
            info!("Workload reconcilers are disabled");
        } else {
            let client = runtime.client();
            let certificates = api_resource_exists::<Certificate>(&client).await;
            if !certificates {
                warn!("certificates.cert-manager.io resource kind not found, custom domains will not get certificates");
            }
            let ctx = |client: &Client| {
                Arc::new(Context::new(
                    KubeClusterApi::new(client.clone()),
                    config.clone(),
                    leader.clone(),
                    reconcile_metrics.clone(),
                ))
            };
            spawn_reconciler::<Terminal>(&client, ctx(&client), reconcile_concurrency, certificates)
                .await;
            spawn_reconciler::<Adminer>(&client, ctx(&client), reconcile_concurrency, certificates)
                .await;
            spawn_reconciler::<App>(&client, ctx(&client), reconcile_concurrency, certificates)
                .await;
        }

        let resolver = DnsResolver::from_system_conf()?;
        let compliance = icp_client(&config.icp, Duration::from_millis(icp_timeout_ms))?;
        let validator = HostValidator::new(
            config.clone(),
            Arc::new(resolver),
            compliance,
            Duration::from_millis(dns_timeout_ms),
            Duration::from_millis(icp_timeout_ms),
        );
        let admission = Admission::new(
            index,
            config,
            validator,
            leader,
            max_staleness,
            admission_metrics,
        );
        let runtime = runtime.spawn_server(move || admission.clone());

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

// === impl NetworkArgs ===

impl NetworkArgs {
    fn into_config(self) -> Result<NetworkConfig> {
        if let Some(path) = self.network_config {
            let yaml = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config = NetworkConfig::from_yaml(&yaml)
                .with_context(|| format!("invalid network configuration in {}", path.display()))?;
            return Ok(config);
        }

        let Some(base_domain) = self.base_domain else {
            bail!("--base-domain or --network-config must be set");
        };
        let config = NetworkConfig {
            base_domain: base_domain.trim_end_matches('.').to_ascii_lowercase(),
            shared_gateway: self.shared_gateway,
            public_domains: self.public_domains,
            tls_enabled: self.tls_enabled,
            tls_secret: self.tls_secret,
            cert_issuer: self.cert_issuer.as_deref().map(parse_issuer),
            tenant_namespace_prefix: self.tenant_namespace_prefix,
            default_annotations: parse_annotations(&self.default_annotations)?,
            icp: IcpConfig {
                enabled: self.icp_enabled,
                endpoint: self.icp_endpoint,
                key: self.icp_key,
            },
            tracing_enabled: self.tracing_enabled,
        };
        config.validate()?;
        Ok(config)
    }
}

fn parse_issuer(s: &str) -> IssuerRef {
    match s.split_once('/') {
        Some((kind, name)) => IssuerRef {
            name: name.to_string(),
            kind: kind.to_string(),
        },
        None => IssuerRef {
            name: s.to_string(),
            kind: "ClusterIssuer".to_string(),
        },
    }
}

fn parse_annotations(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => bail!("invalid annotation {pair:?}: expected key=value"),
        })
        .collect()
}

fn icp_client(icp: &IcpConfig, timeout: Duration) -> Result<Option<Arc<dyn CheckCompliance>>> {
    if !icp.enabled {
        return Ok(None);
    }
    let Some(endpoint) = icp.endpoint.as_deref() else {
        bail!("ICP compliance checks are enabled but no endpoint is configured");
    };
    let client = IcpClient::new(endpoint, icp.key.clone(), timeout)?;
    Ok(Some(Arc::new(client)))
}

async fn spawn_reconciler<W: Workload>(
    client: &Client,
    ctx: Arc<Context<KubeClusterApi>>,
    concurrency: u16,
    certificates: bool,
) {
    if !api_resource_exists::<W>(client).await {
        warn!(
            kind = %W::kind(&()),
            "Workload resource kind not found, skipping reconciler"
        );
        return;
    }
    tokio::spawn(reconciler::run::<W>(client.clone(), ctx, concurrency, certificates));
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt))
}
