#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod domain;
pub mod networking;
mod params;

pub use self::{
    config::{
        ConfigError, GatewayRef, IcpConfig, IssuerRef, NetworkConfig, DEFAULT_SHARED_GATEWAY,
        DEFAULT_TENANT_NAMESPACE_PREFIX,
    },
    domain::{classify, is_internal_host, DomainClass, DomainPattern},
    networking::{build, DomainAnalysis, NetworkingSpec},
    params::{AppNetworkingParams, AppType, BackendRef, Protocol, ProtocolUnsupported, WorkloadRef},
};

pub const CONTROLLER_NAME: &str = "mesh-ingress-controller";

/// Suffix of admission denial messages that may clear up without the
/// request changing.
pub const RETRYABLE_MARKER: &str = "(retryable)";
