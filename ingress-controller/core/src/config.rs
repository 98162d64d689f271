use crate::domain::{DomainPattern, InvalidPattern};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};
use thiserror::Error;

pub const DEFAULT_SHARED_GATEWAY: &str = "istio-system/sealos-gateway";
pub const DEFAULT_TENANT_NAMESPACE_PREFIX: &str = "ns-";

/// Process-wide networking configuration. Loaded once at startup and shared
/// read-only by the reconcilers and the admission webhook.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// The cluster's own domain, e.g. `cloud.sealos.io`. Names below it are
    /// always treated as public.
    pub base_domain: String,

    #[serde(default = "default_shared_gateway")]
    pub shared_gateway: GatewayRef,

    /// Additional public-domain patterns, matched in order.
    #[serde(default)]
    pub public_domains: Vec<DomainPattern>,

    #[serde(default)]
    pub tls_enabled: bool,

    /// The wildcard certificate secret served for public hosts.
    #[serde(default)]
    pub tls_secret: Option<String>,

    /// The cert-manager issuer used for custom-domain certificates.
    #[serde(default)]
    pub cert_issuer: Option<IssuerRef>,

    #[serde(default = "default_tenant_namespace_prefix")]
    pub tenant_namespace_prefix: String,

    /// Annotations injected into networking resources created in tenant
    /// namespaces, unless the user set them explicitly.
    #[serde(default)]
    pub default_annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub icp: IcpConfig,

    /// Emits a DestinationRule for every workload, not only gRPC ones.
    #[serde(default)]
    pub tracing_enabled: bool,
}

/// Namespaced reference to an Istio Gateway, written `<namespace>/<name>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct GatewayRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerRef {
    pub name: String,
    #[serde(default = "default_issuer_kind")]
    pub kind: String,
}

/// ICP registration compliance service settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IcpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("base domain must be set")]
    MissingBaseDomain,

    #[error("invalid base domain {0:?}")]
    InvalidBaseDomain(String),

    #[error("invalid public domain pattern: {0}")]
    InvalidPattern(#[from] InvalidPattern),

    #[error("invalid gateway reference {0:?}: expected <namespace>/<name>")]
    InvalidGatewayRef(String),

    #[error("TLS is enabled but no default TLS secret is configured")]
    MissingTlsSecret,

    #[error("ICP compliance checks are enabled but no endpoint is configured")]
    MissingIcpEndpoint,

    #[error("failed to parse network configuration: {0}")]
    Parse(String),
}

fn default_shared_gateway() -> GatewayRef {
    GatewayRef::new("istio-system", "sealos-gateway")
}

fn default_tenant_namespace_prefix() -> String {
    DEFAULT_TENANT_NAMESPACE_PREFIX.to_string()
}

fn default_issuer_kind() -> String {
    "ClusterIssuer".to_string()
}

// === impl NetworkConfig ===

impl NetworkConfig {
    pub fn new(base_domain: impl Into<String>) -> Self {
        Self {
            base_domain: base_domain.into(),
            shared_gateway: default_shared_gateway(),
            public_domains: Vec::new(),
            tls_enabled: false,
            tls_secret: None,
            cert_issuer: None,
            tenant_namespace_prefix: default_tenant_namespace_prefix(),
            default_annotations: BTreeMap::new(),
            icp: IcpConfig::default(),
            tracing_enabled: false,
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.base_domain = config.base_domain.trim_end_matches('.').to_ascii_lowercase();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_domain.is_empty() {
            return Err(ConfigError::MissingBaseDomain);
        }
        let base: DomainPattern = self.base_domain.parse()?;
        if matches!(base, DomainPattern::Wildcard { .. }) || !self.base_domain.contains('.') {
            return Err(ConfigError::InvalidBaseDomain(self.base_domain.clone()));
        }
        if self.tls_enabled && self.tls_secret.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::MissingTlsSecret);
        }
        if self.icp.enabled && self.icp.endpoint.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::MissingIcpEndpoint);
        }
        Ok(())
    }

    /// The patterns used for classification: the configured public domains
    /// followed by `*.<base_domain>` unless an earlier pattern covers it.
    pub fn public_patterns(&self) -> Vec<DomainPattern> {
        let mut patterns = self.public_domains.clone();
        if !patterns.iter().any(|p| p.matches(&self.base_domain)) {
            patterns.push(DomainPattern::Wildcard {
                base: self.base_domain.clone(),
            });
        }
        patterns
    }

    /// Every de-wildcarded public base domain, deduplicated, base domain
    /// included, in configuration order.
    pub fn public_bases(&self) -> Vec<String> {
        let mut bases = Vec::new();
        for base in self
            .public_domains
            .iter()
            .map(DomainPattern::base)
            .chain(std::iter::once(self.base_domain.as_str()))
        {
            let base = base.to_ascii_lowercase();
            if !bases.contains(&base) {
                bases.push(base);
            }
        }
        bases
    }

    pub fn is_tenant_namespace(&self, ns: &str) -> bool {
        !self.tenant_namespace_prefix.is_empty() && ns.starts_with(&self.tenant_namespace_prefix)
    }
}

// === impl GatewayRef ===

impl GatewayRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl FromStr for GatewayRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name))
                if !ns.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(ns, name))
            }
            _ => Err(ConfigError::InvalidGatewayRef(s.to_string())),
        }
    }
}

impl TryFrom<String> for GatewayRef {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<GatewayRef> for String {
    fn from(gw: GatewayRef) -> Self {
        gw.to_string()
    }
}

impl fmt::Display for GatewayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn loads_from_configmap_yaml() {
        let config = NetworkConfig::from_yaml(
            r#"
baseDomain: Cloud.Sealos.IO
publicDomains:
  - "*.sealos.run"
  - api.example.com
tlsEnabled: true
tlsSecret: wildcard-cert
certIssuer:
  name: letsencrypt-prod
defaultAnnotations:
  networking.istio.io/exportTo: "."
icp:
  enabled: false
"#,
        )
        .expect("config must load");

        assert_eq!(config.base_domain, "cloud.sealos.io");
        assert_eq!(config.shared_gateway, GatewayRef::new("istio-system", "sealos-gateway"));
        assert_eq!(config.tenant_namespace_prefix, "ns-");
        assert_eq!(
            config.cert_issuer,
            Some(IssuerRef {
                name: "letsencrypt-prod".to_string(),
                kind: "ClusterIssuer".to_string(),
            })
        );
        assert_eq!(
            config.public_bases(),
            vec!["sealos.run", "api.example.com", "cloud.sealos.io"]
        );
    }

    #[test]
    fn rejects_invalid_configs() {
        assert_eq!(
            NetworkConfig::new("").validate(),
            Err(ConfigError::MissingBaseDomain)
        );
        assert_eq!(
            NetworkConfig::new("*.sealos.io").validate(),
            Err(ConfigError::InvalidBaseDomain("*.sealos.io".to_string()))
        );

        let mut tls = NetworkConfig::new("cloud.sealos.io");
        tls.tls_enabled = true;
        assert_eq!(tls.validate(), Err(ConfigError::MissingTlsSecret));

        let mut icp = NetworkConfig::new("cloud.sealos.io");
        icp.icp.enabled = true;
        assert_eq!(icp.validate(), Err(ConfigError::MissingIcpEndpoint));

        assert!(matches!(
            NetworkConfig::from_yaml("baseDomain: cloud.sealos.io\nsharedGateway: sealos-gateway\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn base_domain_is_always_public() {
        let config = NetworkConfig::new("cloud.sealos.io");
        assert_eq!(
            config.public_patterns(),
            vec![DomainPattern::Wildcard {
                base: "cloud.sealos.io".to_string()
            }]
        );

        let mut covered = NetworkConfig::new("cloud.sealos.io");
        covered.public_domains = vec!["*.sealos.io".parse().unwrap()];
        assert_eq!(covered.public_patterns().len(), 1);
    }

    #[test]
    fn gateway_refs() {
        assert_eq!(
            "istio-system/sealos-gateway".parse::<GatewayRef>().unwrap().to_string(),
            "istio-system/sealos-gateway"
        );
        for bad in ["sealos-gateway", "/gw", "ns/", "a/b/c"] {
            assert!(bad.parse::<GatewayRef>().is_err(), "{bad}");
        }
    }

    #[test]
    fn tenant_namespaces() {
        let config = NetworkConfig::new("cloud.sealos.io");
        assert!(config.is_tenant_namespace("ns-demo"));
        assert!(!config.is_tenant_namespace("kube-system"));
    }
}
