//! Renders a [`NetworkingSpec`] into the cluster objects that implement it.

use k8s_openapi::api::networking::v1 as netv1;
use mesh_ingress_controller_core::{
    networking::{self, CorsPolicy, RouteRule},
    NetworkConfig, NetworkingSpec, Protocol, CONTROLLER_NAME,
};
use mesh_ingress_controller_k8s_api::{
    cert_manager::{self, Certificate, CertificateSpec},
    istio::{
        self, DestinationRule, DestinationRuleSpec, Gateway, GatewaySpec, HttpRoute, HttpRetry,
        VirtualService, VirtualServiceSpec,
    },
    metav1::OwnerReference,
    Ingress, IngressType, Labels, MeshDuration, ObjectMeta,
};
use std::{collections::BTreeMap, time::Duration};

const NGINX: &str = "nginx.ingress.kubernetes.io";

/// Longest idle period nginx tolerates on streaming connections.
const NGINX_STREAM_TIMEOUT: Duration = Duration::from_secs(3600);

/// Objects that should exist for a workload. `None` means any managed object
/// of that kind must be removed.
#[derive(Clone, Debug, Default)]
pub struct Desired {
    pub certificate: Option<Certificate>,
    pub gateway: Option<Gateway>,
    pub virtual_service: Option<VirtualService>,
    pub destination_rule: Option<DestinationRule>,
    pub ingress: Option<Ingress>,
}

pub fn render(
    spec: &NetworkingSpec,
    ingress_type: IngressType,
    config: &NetworkConfig,
    owner: &OwnerReference,
) -> Desired {
    let meta = |name: String| ObjectMeta {
        name: Some(name),
        namespace: Some(spec.workload.namespace.clone()),
        labels: Some(Labels::managed(CONTROLLER_NAME, &spec.workload.name).to_map()),
        owner_references: Some(vec![owner.clone()]),
        ..Default::default()
    };

    let certificate = spec
        .tls
        .as_ref()
        .and_then(|tls| tls.custom_secret.clone())
        .and_then(|secret_name| {
            let issuer = config.cert_issuer.as_ref()?;
            Some(Certificate {
                metadata: meta(spec.workload.certificate_name()),
                spec: CertificateSpec {
                    secret_name,
                    dns_names: spec.custom_hosts.clone(),
                    issuer_ref: cert_manager::ObjectReference {
                        name: issuer.name.clone(),
                        kind: Some(issuer.kind.clone()),
                        group: Some("cert-manager.io".to_string()),
                    },
                },
            })
        });

    match ingress_type {
        IngressType::Istio => Desired {
            certificate,
            gateway: (!spec.analysis.use_system_gateway).then(|| Gateway {
                metadata: meta(spec.workload.gateway_name()),
                spec: gateway_spec(spec),
            }),
            virtual_service: Some(VirtualService {
                metadata: meta(spec.workload.virtual_service_name()),
                spec: virtual_service_spec(spec),
            }),
            destination_rule: spec.needs_destination_rule.then(|| DestinationRule {
                metadata: meta(spec.workload.destination_rule_name()),
                spec: destination_rule_spec(spec),
            }),
            ingress: None,
        },
        IngressType::Nginx => Desired {
            certificate,
            ingress: Some(Ingress {
                metadata: ObjectMeta {
                    annotations: Some(nginx_annotations(spec)),
                    ..meta(spec.workload.ingress_name())
                },
                spec: Some(ingress_spec(spec)),
                status: None,
            }),
            ..Default::default()
        },
    }
}

fn gateway_spec(spec: &NetworkingSpec) -> GatewaySpec {
    let server = |number: u32, name: &str, protocol: &str, hosts: &[String]| istio::Server {
        port: istio::ServerPort {
            number,
            name: name.to_string(),
            protocol: protocol.to_string(),
        },
        hosts: hosts.to_vec(),
        tls: None,
    };

    let mut servers = Vec::new();
    if spec.protocol == Protocol::Tcp {
        let port = u32::from(spec.backend.port.get());
        servers.push(server(port, &format!("tcp-{port}"), "TCP", &spec.hosts));
    } else {
        let mut http = server(80, "http", "HTTP", &spec.hosts);
        if spec.tls.is_some() {
            http.tls = Some(istio::ServerTls {
                https_redirect: Some(true),
                ..Default::default()
            });
        }
        servers.push(http);

        let tls = spec.tls.as_ref();
        for (name, hosts, secret) in [
            (
                "https-public",
                &spec.public_hosts,
                tls.and_then(|t| t.public_secret.as_ref()),
            ),
            (
                "https-custom",
                &spec.custom_hosts,
                tls.and_then(|t| t.custom_secret.as_ref()),
            ),
        ] {
            if let (false, Some(secret)) = (hosts.is_empty(), secret) {
                let mut https = server(443, name, "HTTPS", hosts);
                https.tls = Some(istio::ServerTls {
                    mode: Some("SIMPLE".to_string()),
                    credential_name: Some(secret.clone()),
                    ..Default::default()
                });
                servers.push(https);
            }
        }
    }

    GatewaySpec {
        selector: [("istio".to_string(), "ingressgateway".to_string())]
            .into_iter()
            .collect(),
        servers,
    }
}

fn virtual_service_spec(spec: &NetworkingSpec) -> VirtualServiceSpec {
    let destination = istio::RouteDestination {
        destination: istio::Destination {
            host: spec.backend.name.clone(),
            port: Some(istio::PortSelector {
                number: u32::from(spec.backend.port.get()),
            }),
        },
        weight: None,
    };
    let gateway = &spec.analysis.gateway_reference;

    let mut vs = VirtualServiceSpec {
        hosts: spec.hosts.clone(),
        gateways: vec![format!("{}/{}", gateway.namespace, gateway.name)],
        ..Default::default()
    };

    if spec.protocol == Protocol::Tcp {
        vs.tcp = vec![istio::TcpRoute {
            matches: vec![istio::L4MatchAttributes {
                port: Some(u32::from(spec.backend.port.get())),
            }],
            route: vec![destination],
        }];
        return vs;
    }

    let retries = match &spec.retry {
        Some(retry) => HttpRetry {
            attempts: retry.attempts as i32,
            per_try_timeout: Some(retry.per_try_timeout.into()),
            retry_on: Some(retry.retry_on_header()),
        },
        // The mesh applies its own default retry policy unless told not to.
        None => HttpRetry::default(),
    };
    let headers = (!spec.response_headers.is_empty()).then(|| istio::Headers {
        response: Some(istio::HeaderOperations {
            set: spec.response_headers.clone(),
        }),
    });

    vs.http = spec
        .routes
        .iter()
        .map(|rule| HttpRoute {
            name: Some(rule.name.to_string()),
            matches: vec![http_match(rule)],
            route: vec![destination.clone()],
            timeout: Some(MeshDuration::from(spec.timeout)),
            retries: Some(retries.clone()),
            cors_policy: spec.cors.as_ref().map(cors_policy),
            headers: headers.clone(),
        })
        .collect();
    vs
}

fn http_match(rule: &RouteRule) -> istio::HttpMatchRequest {
    istio::HttpMatchRequest {
        uri: Some(istio::StringMatch::prefix(rule.uri_prefix.clone())),
        headers: rule
            .headers
            .iter()
            .map(|h| {
                let value = match &h.value {
                    networking::StringMatch::Exact(v) => istio::StringMatch::exact(v.clone()),
                    networking::StringMatch::Prefix(v) => istio::StringMatch::prefix(v.clone()),
                };
                (h.name.clone(), value)
            })
            .collect(),
    }
}

fn cors_policy(cors: &CorsPolicy) -> istio::CorsPolicy {
    istio::CorsPolicy {
        allow_origins: cors
            .allow_origins
            .iter()
            .map(|o| istio::StringMatch::exact(o.clone()))
            .collect(),
        allow_methods: cors.allow_methods.clone(),
        allow_headers: cors.allow_headers.clone(),
        max_age: Some(cors.max_age.into()),
        allow_credentials: Some(cors.allow_credentials),
    }
}

fn destination_rule_spec(spec: &NetworkingSpec) -> DestinationRuleSpec {
    let traffic_policy = (spec.protocol == Protocol::Grpc).then(|| istio::TrafficPolicy {
        connection_pool: Some(istio::ConnectionPool {
            http: Some(istio::HttpSettings {
                h2_upgrade_policy: Some("UPGRADE".to_string()),
            }),
        }),
        load_balancer: Some(istio::LoadBalancer {
            simple: Some("LEAST_REQUEST".to_string()),
        }),
    });
    DestinationRuleSpec {
        host: format!(
            "{}.{}.svc.cluster.local",
            spec.backend.name, spec.workload.namespace
        ),
        traffic_policy,
    }
}

fn ingress_spec(spec: &NetworkingSpec) -> netv1::IngressSpec {
    let backend = netv1::IngressBackend {
        service: Some(netv1::IngressServiceBackend {
            name: spec.backend.name.clone(),
            port: Some(netv1::ServiceBackendPort {
                number: Some(i32::from(spec.backend.port.get())),
                name: None,
            }),
        }),
        resource: None,
    };
    let rules = spec
        .hosts
        .iter()
        .map(|host| netv1::IngressRule {
            host: Some(host.clone()),
            http: Some(netv1::HTTPIngressRuleValue {
                paths: vec![netv1::HTTPIngressPath {
                    path: Some("/".to_string()),
                    path_type: "Prefix".to_string(),
                    backend: backend.clone(),
                }],
            }),
        })
        .collect();

    let tls = spec.tls.as_ref().map(|tls| {
        [
            (&spec.public_hosts, tls.public_secret.as_ref()),
            (&spec.custom_hosts, tls.custom_secret.as_ref()),
        ]
        .into_iter()
        .filter_map(|(hosts, secret)| {
            let secret = secret.filter(|_| !hosts.is_empty())?;
            Some(netv1::IngressTLS {
                hosts: Some(hosts.clone()),
                secret_name: Some(secret.clone()),
            })
        })
        .collect::<Vec<_>>()
    });

    netv1::IngressSpec {
        ingress_class_name: Some("nginx".to_string()),
        rules: Some(rules),
        tls: tls.filter(|t| !t.is_empty()),
        default_backend: None,
    }
}

fn nginx_annotations(spec: &NetworkingSpec) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        annotations.insert(format!("{NGINX}/{key}"), value);
    };

    let backend_protocol = if spec.protocol == Protocol::Grpc {
        "GRPC"
    } else {
        "HTTP"
    };
    set("backend-protocol", backend_protocol.to_string());

    let timeout = if spec.timeout.is_zero() {
        NGINX_STREAM_TIMEOUT
    } else {
        spec.timeout
    };
    set("proxy-read-timeout", timeout.as_secs().to_string());
    set("proxy-send-timeout", timeout.as_secs().to_string());
    set("ssl-redirect", spec.tls.is_some().to_string());

    if let Some(cors) = &spec.cors {
        set("enable-cors", "true".to_string());
        set("cors-allow-origin", cors.allow_origins.join(", "));
        set("cors-allow-methods", cors.allow_methods.join(", "));
        set("cors-allow-headers", cors.allow_headers.join(", "));
        set("cors-allow-credentials", cors.allow_credentials.to_string());
        set("cors-max-age", cors.max_age.as_secs().to_string());
    }

    if !spec.response_headers.is_empty() {
        let snippet = spec
            .response_headers
            .iter()
            .map(|(name, value)| format!("more_set_headers \"{name}: {value}\";"))
            .collect::<Vec<_>>()
            .join("\n");
        set("configuration-snippet", snippet);
    }

    annotations
}

#[cfg(test)]
mod tests;
