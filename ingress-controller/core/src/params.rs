use crate::config::GatewayRef;
use std::{fmt, num::NonZeroU16, str::FromStr};
use thiserror::Error;

/// The workload kinds that expose networking through this controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AppType {
    Terminal,
    Adminer,
    App,
}

/// Identifies the workload a networking request belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
    pub app_type: AppType,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendRef {
    pub name: String,
    pub port: NonZeroU16,
}

/// Application protocol spoken by a workload's backend.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[default]
    Http,
    WebSocket,
    Grpc,
    Tcp,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unsupported application protocol {0:?}")]
pub struct ProtocolUnsupported(pub String);

/// A single reconcile's networking request. Built fresh from the workload
/// object on every reconcile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppNetworkingParams {
    pub workload: WorkloadRef,
    pub hosts: Vec<String>,
    /// A user-supplied domain. Its presence always selects a dedicated
    /// gateway.
    pub custom_domain: Option<String>,
    pub backend: BackendRef,
    pub protocol: Protocol,
}

// === impl AppType ===

impl AppType {
    /// The dashboard subdomain that serves this kind of workload, which is
    /// also the browser origin allowed by CORS.
    pub fn subdomain(&self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::Adminer => "adminer",
            Self::App => "applaunchpad",
        }
    }
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminal => "Terminal".fmt(f),
            Self::Adminer => "Adminer".fmt(f),
            Self::App => "App".fmt(f),
        }
    }
}

// === impl WorkloadRef ===

impl WorkloadRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, app_type: AppType) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            app_type,
        }
    }

    pub fn virtual_service_name(&self) -> String {
        format!("{}-vs", self.name)
    }

    pub fn gateway_name(&self) -> String {
        format!("{}-gateway", self.name)
    }

    pub fn destination_rule_name(&self) -> String {
        format!("{}-dr", self.name)
    }

    pub fn certificate_name(&self) -> String {
        format!("{}-cert", self.name)
    }

    pub fn certificate_secret_name(&self) -> String {
        format!("{}-cert-tls", self.name)
    }

    pub fn ingress_name(&self) -> String {
        format!("{}-ingress", self.name)
    }

    pub fn dedicated_gateway(&self) -> GatewayRef {
        GatewayRef::new(self.namespace.clone(), self.gateway_name())
    }
}

// === impl Protocol ===

impl Protocol {
    /// Parses `s`, falling back to HTTP semantics for anything unknown.
    pub fn parse_or_http(s: &str) -> (Self, Option<ProtocolUnsupported>) {
        match s.parse() {
            Ok(p) => (p, None),
            Err(e) => (Self::Http, Some(e)),
        }
    }

    /// Long-lived connections get no route timeout and no retries.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::WebSocket | Self::Grpc)
    }

    pub fn is_browser_facing(&self) -> bool {
        matches!(self, Self::Http | Self::WebSocket)
    }
}

impl FromStr for Protocol {
    type Err = ProtocolUnsupported;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "http" | "http1" | "http/1.1" | "http2" | "h2c" | "https" => Ok(Self::Http),
            "websocket" | "ws" | "wss" => Ok(Self::WebSocket),
            "grpc" | "grpc-web" => Ok(Self::Grpc),
            "tcp" => Ok(Self::Tcp),
            _ => Err(ProtocolUnsupported(s.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => "HTTP".fmt(f),
            Self::WebSocket => "WebSocket".fmt(f),
            Self::Grpc => "gRPC".fmt(f),
            Self::Tcp => "TCP".fmt(f),
        }
    }
}

// === impl AppNetworkingParams ===

impl AppNetworkingParams {
    /// Requested hosts followed by the custom domain, lowercased and
    /// deduplicated in request order. Empty entries are dropped.
    pub fn all_hosts(&self) -> Vec<String> {
        let mut seen = ahash::AHashSet::new();
        self.hosts
            .iter()
            .chain(self.custom_domain.iter())
            .map(|h| h.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|h| !h.is_empty() && seen.insert(h.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_protocols_fall_back_to_http() {
        assert_eq!(Protocol::parse_or_http("WebSocket"), (Protocol::WebSocket, None));
        assert_eq!(Protocol::parse_or_http("gRPC"), (Protocol::Grpc, None));
        assert_eq!(
            Protocol::parse_or_http("quic"),
            (Protocol::Http, Some(ProtocolUnsupported("quic".to_string())))
        );
    }

    #[test]
    fn hosts_are_normalized() {
        let params = AppNetworkingParams {
            workload: WorkloadRef::new("ns-demo", "demo", AppType::App),
            hosts: vec![
                "Demo.Cloud.Sealos.io.".to_string(),
                "demo.cloud.sealos.io".to_string(),
                " ".to_string(),
            ],
            custom_domain: Some("demo.example.org".to_string()),
            backend: BackendRef {
                name: "demo".to_string(),
                port: NonZeroU16::new(80).unwrap(),
            },
            protocol: Protocol::Http,
        };
        assert_eq!(
            params.all_hosts(),
            vec!["demo.cloud.sealos.io", "demo.example.org"]
        );
    }
}
