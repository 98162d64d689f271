use super::*;
use mesh_ingress_controller_core::{
    build, AppNetworkingParams, AppType, BackendRef, IssuerRef, WorkloadRef,
};
use pretty_assertions::assert_eq;
use std::num::NonZeroU16;

fn config() -> NetworkConfig {
    NetworkConfig::new("cloud.sealos.io")
}

fn tls_config() -> NetworkConfig {
    let mut config = config();
    config.tls_enabled = true;
    config.tls_secret = Some("wildcard-cert".to_string());
    config.cert_issuer = Some(IssuerRef {
        name: "letsencrypt".to_string(),
        kind: "ClusterIssuer".to_string(),
    });
    config
}

fn owner() -> OwnerReference {
    OwnerReference {
        api_version: "app.sealos.io/v1".to_string(),
        kind: "App".to_string(),
        name: "demo".to_string(),
        uid: "uid-demo".to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn spec(hosts: &[&str], protocol: Protocol, config: &NetworkConfig) -> NetworkingSpec {
    let params = AppNetworkingParams {
        workload: WorkloadRef::new("ns-demo", "demo", AppType::App),
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        custom_domain: None,
        backend: BackendRef {
            name: "demo".to_string(),
            port: NonZeroU16::new(8080).unwrap(),
        },
        protocol,
    };
    build(&params, config).expect("hosts were requested")
}

#[test]
fn public_hosts_route_through_the_shared_gateway() {
    let config = config();
    let desired = render(
        &spec(&["demo.cloud.sealos.io"], Protocol::Http, &config),
        IngressType::Istio,
        &config,
        &owner(),
    );

    assert!(desired.gateway.is_none());
    assert!(desired.certificate.is_none());
    assert!(desired.destination_rule.is_none());
    assert!(desired.ingress.is_none());

    let vs = desired.virtual_service.expect("must render a VirtualService");
    assert_eq!(vs.metadata.name.as_deref(), Some("demo-vs"));
    assert_eq!(vs.metadata.namespace.as_deref(), Some("ns-demo"));
    assert_eq!(vs.metadata.owner_references, Some(vec![owner()]));
    assert!(Labels::from(vs.metadata.labels.clone()).is_managed_by(CONTROLLER_NAME));
    assert_eq!(vs.spec.gateways, vec!["istio-system/sealos-gateway"]);
    assert_eq!(vs.spec.hosts, vec!["demo.cloud.sealos.io"]);

    let json = serde_json::to_value(&vs.spec.http[0]).unwrap();
    assert_eq!(json["timeout"], "300s");
    assert_eq!(json["retries"]["attempts"], 3);
    assert_eq!(json["retries"]["perTryTimeout"], "60s");
    assert_eq!(
        json["corsPolicy"]["allowOrigins"],
        serde_json::json!([{ "exact": "https://applaunchpad.cloud.sealos.io" }])
    );
    assert_eq!(json["headers"]["response"]["set"]["x-frame-options"], "SAMEORIGIN");
}

#[test]
fn dedicated_gateways_terminate_tls_per_host_class() {
    let config = tls_config();
    let desired = render(
        &spec(
            &["demo.cloud.sealos.io", "demo.example.org"],
            Protocol::Http,
            &config,
        ),
        IngressType::Istio,
        &config,
        &owner(),
    );

    let gateway = desired.gateway.expect("must render a dedicated Gateway");
    assert_eq!(gateway.metadata.name.as_deref(), Some("demo-gateway"));
    let servers = gateway
        .spec
        .servers
        .iter()
        .map(|s| {
            (
                s.port.name.as_str(),
                s.hosts.clone(),
                s.tls.as_ref().and_then(|t| t.credential_name.clone()),
            )
        })
        .collect::<Vec<_>>();
    assert_eq!(
        servers,
        vec![
            (
                "http",
                vec![
                    "demo.cloud.sealos.io".to_string(),
                    "demo.example.org".to_string()
                ],
                None
            ),
            (
                "https-public",
                vec!["demo.cloud.sealos.io".to_string()],
                Some("wildcard-cert".to_string())
            ),
            (
                "https-custom",
                vec!["demo.example.org".to_string()],
                Some("demo-cert-tls".to_string())
            ),
        ]
    );
    assert_eq!(
        gateway.spec.servers[0].tls.as_ref().and_then(|t| t.https_redirect),
        Some(true)
    );

    let vs = desired.virtual_service.unwrap();
    assert_eq!(vs.spec.gateways, vec!["ns-demo/demo-gateway"]);

    let cert = desired.certificate.expect("custom hosts need a certificate");
    assert_eq!(cert.metadata.name.as_deref(), Some("demo-cert"));
    assert_eq!(cert.spec.secret_name, "demo-cert-tls");
    assert_eq!(cert.spec.dns_names, vec!["demo.example.org"]);
    assert_eq!(cert.spec.issuer_ref.name, "letsencrypt");
}

#[test]
fn certificates_require_an_issuer() {
    let mut config = tls_config();
    config.cert_issuer = None;
    let desired = render(
        &spec(&["demo.example.org"], Protocol::Http, &config),
        IngressType::Istio,
        &config,
        &owner(),
    );
    assert!(desired.certificate.is_none());
}

#[test]
fn streaming_routes_disable_mesh_retries() {
    let config = config();
    let desired = render(
        &spec(&["demo.cloud.sealos.io"], Protocol::WebSocket, &config),
        IngressType::Istio,
        &config,
        &owner(),
    );
    let vs = desired.virtual_service.unwrap();
    assert_eq!(vs.spec.http.len(), 2);
    let json = serde_json::to_value(&vs.spec.http[0]).unwrap();
    assert_eq!(json["name"], "websocket");
    assert_eq!(json["match"][0]["headers"]["upgrade"]["exact"], "websocket");
    assert_eq!(json["timeout"], "0s");
    assert_eq!(json["retries"], serde_json::json!({ "attempts": 0 }));
}

#[test]
fn grpc_gets_a_destination_rule() {
    let config = config();
    let desired = render(
        &spec(&["api.cloud.sealos.io"], Protocol::Grpc, &config),
        IngressType::Istio,
        &config,
        &owner(),
    );
    let dr = desired.destination_rule.expect("gRPC needs a DestinationRule");
    assert_eq!(dr.metadata.name.as_deref(), Some("demo-dr"));
    assert_eq!(dr.spec.host, "demo.ns-demo.svc.cluster.local");
    let pool = dr.spec.traffic_policy.unwrap().connection_pool.unwrap();
    assert_eq!(
        pool.http.unwrap().h2_upgrade_policy.as_deref(),
        Some("UPGRADE")
    );
}

#[test]
fn tracing_adds_a_destination_rule_for_http() {
    let mut config = config();
    config.tracing_enabled = true;
    let desired = render(
        &spec(&["demo.cloud.sealos.io"], Protocol::Http, &config),
        IngressType::Istio,
        &config,
        &owner(),
    );
    let dr = desired.destination_rule.expect("tracing needs a DestinationRule");
    assert_eq!(dr.spec.traffic_policy, None);
}

#[test]
fn tcp_routes_by_port() {
    let config = config();
    let desired = render(
        &spec(&["db.example.org"], Protocol::Tcp, &config),
        IngressType::Istio,
        &config,
        &owner(),
    );
    let gateway = desired.gateway.unwrap();
    assert_eq!(gateway.spec.servers.len(), 1);
    assert_eq!(gateway.spec.servers[0].port.protocol, "TCP");
    assert_eq!(gateway.spec.servers[0].port.number, 8080);

    let vs = desired.virtual_service.unwrap();
    assert!(vs.spec.http.is_empty());
    assert_eq!(vs.spec.tcp[0].matches[0].port, Some(8080));
}

#[test]
fn nginx_renders_a_single_ingress() {
    let config = tls_config();
    let desired = render(
        &spec(
            &["demo.cloud.sealos.io", "demo.example.org"],
            Protocol::WebSocket,
            &config,
        ),
        IngressType::Nginx,
        &config,
        &owner(),
    );
    assert!(desired.virtual_service.is_none());
    assert!(desired.gateway.is_none());
    assert!(desired.certificate.is_some());

    let ingress = desired.ingress.expect("nginx renders an Ingress");
    assert_eq!(ingress.metadata.name.as_deref(), Some("demo-ingress"));
    let annotations = ingress.metadata.annotations.unwrap();
    assert_eq!(
        annotations["nginx.ingress.kubernetes.io/proxy-read-timeout"],
        "3600"
    );
    assert_eq!(
        annotations["nginx.ingress.kubernetes.io/cors-allow-origin"],
        "https://applaunchpad.cloud.sealos.io"
    );
    assert!(annotations["nginx.ingress.kubernetes.io/configuration-snippet"]
        .contains("more_set_headers \"x-content-type-options: nosniff\";"));

    let spec = ingress.spec.unwrap();
    assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));
    let hosts = spec
        .rules
        .unwrap()
        .into_iter()
        .filter_map(|r| r.host)
        .collect::<Vec<_>>();
    assert_eq!(hosts, vec!["demo.cloud.sealos.io", "demo.example.org"]);
    let tls = spec.tls.unwrap();
    assert_eq!(tls.len(), 2);
    assert_eq!(tls[1].secret_name.as_deref(), Some("demo-cert-tls"));
}
