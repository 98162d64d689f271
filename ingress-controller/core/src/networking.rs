//! Builds the desired networking state for a workload.
//!
//! The builder is pure: given a workload's request and the cluster's
//! [`NetworkConfig`] it decides between the shared gateway and a dedicated
//! one, selects protocol-specific route matches, timeouts and retries, and
//! computes the CORS and response-header policy served to browsers.

use crate::{
    config::{GatewayRef, NetworkConfig},
    domain::{classify, DomainClass},
    params::{AppNetworkingParams, BackendRef, Protocol, WorkloadRef},
};
use std::{collections::BTreeMap, time::Duration};

pub const HTTP_ROUTE_TIMEOUT: Duration = Duration::from_secs(300);
pub const HTTP_PER_TRY_TIMEOUT: Duration = Duration::from_secs(60);
pub const HTTP_RETRY_ATTEMPTS: u32 = 3;
pub const CORS_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Gateway strategy derived from the requested hosts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainAnalysis {
    /// Every requested host is under a public domain.
    pub is_public_domain: bool,
    pub use_system_gateway: bool,
    pub gateway_reference: GatewayRef,
}

/// The desired routing and security state for one workload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkingSpec {
    pub workload: WorkloadRef,
    pub hosts: Vec<String>,
    pub public_hosts: Vec<String>,
    pub custom_hosts: Vec<String>,
    pub analysis: DomainAnalysis,
    pub backend: BackendRef,
    pub protocol: Protocol,
    /// Ordered HTTP route rules; empty for TCP workloads.
    pub routes: Vec<RouteRule>,
    /// `Duration::ZERO` disables the route timeout.
    pub timeout: Duration,
    pub retry: Option<RetryPolicy>,
    pub cors: Option<CorsPolicy>,
    pub response_headers: BTreeMap<String, String>,
    pub tls: Option<TlsTermination>,
    pub needs_destination_rule: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteRule {
    pub name: &'static str,
    pub uri_prefix: String,
    pub headers: Vec<HeaderMatch>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderMatch {
    pub name: String,
    pub value: StringMatch,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StringMatch {
    Exact(String),
    Prefix(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub per_try_timeout: Duration,
    pub retry_on: Vec<RetryOn>,
}

/// Retry conditions. Arbitrary 5xx responses are deliberately absent.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RetryOn {
    GatewayError,
    ConnectFailure,
    RefusedStream,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorsPolicy {
    /// Exact origins only.
    pub allow_origins: Vec<String>,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub max_age: Duration,
    pub allow_credentials: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsTermination {
    /// Secret served for public hosts.
    pub public_secret: Option<String>,
    /// Secret issued for the workload's custom hosts.
    pub custom_secret: Option<String>,
}

/// Builds the networking spec for `params`. Returns `None` when the workload
/// requests no hosts, i.e. it is internal-only.
pub fn build(params: &AppNetworkingParams, config: &NetworkConfig) -> Option<NetworkingSpec> {
    let hosts = params.all_hosts();
    if hosts.is_empty() {
        return None;
    }

    let patterns = config.public_patterns();
    let (public_hosts, custom_hosts): (Vec<_>, Vec<_>) = hosts
        .iter()
        .cloned()
        .partition(|h| classify(h, &patterns) == DomainClass::Public);
    let analysis = analyze(&params.workload, &custom_hosts, params.custom_domain.is_some(), config);

    let protocol = params.protocol;
    let (timeout, retry) = match protocol {
        Protocol::Http => (
            HTTP_ROUTE_TIMEOUT,
            Some(RetryPolicy {
                attempts: HTTP_RETRY_ATTEMPTS,
                per_try_timeout: HTTP_PER_TRY_TIMEOUT,
                retry_on: vec![
                    RetryOn::GatewayError,
                    RetryOn::ConnectFailure,
                    RetryOn::RefusedStream,
                ],
            }),
        ),
        Protocol::WebSocket | Protocol::Grpc | Protocol::Tcp => (Duration::ZERO, None),
    };

    let cors = protocol
        .is_browser_facing()
        .then(|| cors_policy(&params.workload, config));
    let response_headers = if protocol.is_browser_facing() {
        security_headers(protocol, cors.as_ref())
    } else {
        BTreeMap::new()
    };

    let tls = config.tls_enabled.then(|| TlsTermination {
        public_secret: (!public_hosts.is_empty())
            .then(|| config.tls_secret.clone())
            .flatten(),
        custom_secret: (!custom_hosts.is_empty())
            .then(|| params.workload.certificate_secret_name()),
    });

    Some(NetworkingSpec {
        workload: params.workload.clone(),
        hosts,
        public_hosts,
        custom_hosts,
        analysis,
        backend: params.backend.clone(),
        protocol,
        routes: route_rules(protocol),
        timeout,
        retry,
        cors,
        response_headers,
        tls,
        needs_destination_rule: protocol == Protocol::Grpc || config.tracing_enabled,
    })
}

/// The shared gateway is used only when every host is public and no custom
/// domain was supplied. Mixed requests get a dedicated gateway carrying all
/// hosts.
fn analyze(
    workload: &WorkloadRef,
    custom_hosts: &[String],
    custom_override: bool,
    config: &NetworkConfig,
) -> DomainAnalysis {
    let is_public_domain = custom_hosts.is_empty();
    let use_system_gateway = is_public_domain && !custom_override;
    let gateway_reference = if use_system_gateway {
        config.shared_gateway.clone()
    } else {
        workload.dedicated_gateway()
    };
    DomainAnalysis {
        is_public_domain,
        use_system_gateway,
        gateway_reference,
    }
}

fn route_rules(protocol: Protocol) -> Vec<RouteRule> {
    let default = RouteRule {
        name: "default",
        uri_prefix: "/".to_string(),
        headers: vec![],
    };
    match protocol {
        Protocol::Http => vec![default],
        Protocol::WebSocket => vec![
            RouteRule {
                name: "websocket",
                uri_prefix: "/".to_string(),
                headers: vec![HeaderMatch {
                    name: "upgrade".to_string(),
                    value: StringMatch::Exact("websocket".to_string()),
                }],
            },
            default,
        ],
        Protocol::Grpc => vec![
            RouteRule {
                name: "grpc",
                uri_prefix: "/".to_string(),
                headers: vec![HeaderMatch {
                    name: "content-type".to_string(),
                    value: StringMatch::Prefix("application/grpc".to_string()),
                }],
            },
            default,
        ],
        Protocol::Tcp => vec![],
    }
}

/// One exact `https://<subdomain>.<domain>` origin per public base domain.
/// Wildcards never appear because credentials are allowed.
fn cors_policy(workload: &WorkloadRef, config: &NetworkConfig) -> CorsPolicy {
    let subdomain = workload.app_type.subdomain();
    let allow_origins = config
        .public_bases()
        .into_iter()
        .map(|base| format!("https://{subdomain}.{base}"))
        .collect();
    CorsPolicy {
        allow_origins,
        allow_methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
            .into_iter()
            .map(String::from)
            .collect(),
        allow_headers: ["content-type", "authorization"]
            .into_iter()
            .map(String::from)
            .collect(),
        max_age: CORS_MAX_AGE,
        allow_credentials: true,
    }
}

fn security_headers(protocol: Protocol, cors: Option<&CorsPolicy>) -> BTreeMap<String, String> {
    let connect_src = if protocol == Protocol::WebSocket {
        "'self' https: wss:"
    } else {
        "'self' https:"
    };
    let mut frame_ancestors = String::from("'self'");
    for origin in cors.iter().flat_map(|c| c.allow_origins.iter()) {
        frame_ancestors.push(' ');
        frame_ancestors.push_str(origin);
    }
    let csp = format!(
        "default-src 'self'; connect-src {connect_src}; img-src 'self' data: https:; \
         style-src 'self' 'unsafe-inline'; script-src 'self' 'unsafe-inline'; \
         frame-ancestors {frame_ancestors}"
    );

    [
        ("x-frame-options", "SAMEORIGIN".to_string()),
        ("x-content-type-options", "nosniff".to_string()),
        ("x-xss-protection", "1; mode=block".to_string()),
        ("referrer-policy", "strict-origin-when-cross-origin".to_string()),
        ("content-security-policy", csp),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

// === impl RetryOn ===

impl RetryOn {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GatewayError => "gateway-error",
            Self::ConnectFailure => "connect-failure",
            Self::RefusedStream => "refused-stream",
        }
    }
}

// === impl RetryPolicy ===

impl RetryPolicy {
    /// The `retryOn` string understood by the mesh.
    pub fn retry_on_header(&self) -> String {
        self.retry_on
            .iter()
            .map(RetryOn::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}
