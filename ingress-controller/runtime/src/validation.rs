//! External checks run on custom hosts before they may be claimed.

use anyhow::Result;
use futures::future;
use hickory_resolver::{
    error::ResolveErrorKind,
    proto::rr::{RData, RecordType},
    TokioAsyncResolver,
};
use mesh_ingress_controller_core::{classify, DomainClass, NetworkConfig, RETRYABLE_MARKER};
use serde::Deserialize;
use std::{collections::BTreeSet, fmt, sync::Arc};
use tokio::time::{self, Duration};
use tracing::debug;

/// Stable, machine-readable reasons for denying a networking write. Rendered
/// as the `<Code>: ` prefix of admission denial messages.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RejectionCode {
    CnameValidationFailure,
    OwnershipConflict,
    ComplianceFailure,
    IndexUnavailable,
    InvalidResource,
}

/// Retryable rejections render with a trailing `(retryable)` marker so that
/// writers can tell them apart from rejections of the request itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub code: RejectionCode,
    pub message: String,
    timed_out: bool,
}

/// Looks up the CNAME targets of a hostname.
#[async_trait::async_trait]
pub trait ResolveCname: Send + Sync + 'static {
    /// Returns the targets `host` is an alias for; empty when it has no
    /// CNAME record.
    async fn resolve_cname(&self, host: &str) -> Result<Vec<String>>;
}

/// Queries a host's ICP registration.
#[async_trait::async_trait]
pub trait CheckCompliance: Send + Sync + 'static {
    async fn is_registered(&self, host: &str) -> Result<bool>;
}

/// Runs CNAME and compliance checks with bounded timeouts. Every failure,
/// including a timeout, rejects the host.
#[derive(Clone)]
pub struct HostValidator {
    config: Arc<NetworkConfig>,
    resolver: Arc<dyn ResolveCname>,
    compliance: Option<Arc<dyn CheckCompliance>>,
    dns_timeout: Duration,
    icp_timeout: Duration,
}

/// A [`ResolveCname`] backed by the system's DNS configuration.
pub struct DnsResolver(TokioAsyncResolver);

/// A [`CheckCompliance`] backed by an ICP lookup service.
pub struct IcpClient {
    client: reqwest::Client,
    endpoint: String,
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IcpResponse {
    #[serde(default)]
    error_code: i32,
    #[serde(default)]
    result: Option<IcpRecord>,
}

#[derive(Debug, Deserialize)]
struct IcpRecord {
    #[serde(rename = "SiteLicense", default)]
    site_license: Option<String>,
}

// === impl RejectionCode ===

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CnameValidationFailure => "CnameValidationFailure",
            Self::OwnershipConflict => "OwnershipConflict",
            Self::ComplianceFailure => "ComplianceFailure",
            Self::IndexUnavailable => "IndexUnavailable",
            Self::InvalidResource => "InvalidResource",
        }
    }

    /// Codes that may clear up without the request changing.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::IndexUnavailable)
    }
}

impl fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl Rejection ===

impl Rejection {
    pub fn new(code: RejectionCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            timed_out: false,
        }
    }

    fn timeout(code: RejectionCode, message: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            ..Self::new(code, message)
        }
    }

    /// Retryable rejections are caused by the controller's own state or a
    /// slow dependency, not by the request.
    pub fn is_retryable(&self) -> bool {
        self.timed_out || self.code.is_retryable()
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if self.is_retryable() {
            write!(f, " {RETRYABLE_MARKER}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Rejection {}

// === impl HostValidator ===

impl HostValidator {
    pub fn new(
        config: Arc<NetworkConfig>,
        resolver: Arc<dyn ResolveCname>,
        compliance: Option<Arc<dyn CheckCompliance>>,
        dns_timeout: Duration,
        icp_timeout: Duration,
    ) -> Self {
        Self {
            config,
            resolver,
            compliance,
            dns_timeout,
            icp_timeout,
        }
    }

    /// Checks every custom host's CNAME delegation, then its ICP
    /// registration. Public hosts are operator-controlled and skip both.
    pub async fn validate(&self, hosts: &BTreeSet<String>) -> Result<(), Rejection> {
        let patterns = self.config.public_patterns();
        let custom = hosts
            .iter()
            .filter(|h| classify(h, &patterns) == DomainClass::Custom)
            .collect::<Vec<_>>();
        if custom.is_empty() {
            return Ok(());
        }

        future::try_join_all(custom.iter().map(|host| self.check_cname(host))).await?;
        if let Some(compliance) = self.compliance.as_ref() {
            future::try_join_all(custom.iter().map(|host| self.check_icp(&**compliance, host)))
                .await?;
        }
        Ok(())
    }

    async fn check_cname(&self, host: &str) -> Result<(), Rejection> {
        use RejectionCode::CnameValidationFailure as Code;

        let targets = match time::timeout(self.dns_timeout, self.resolver.resolve_cname(host)).await
        {
            Ok(Ok(targets)) => targets,
            Ok(Err(error)) => {
                return Err(Rejection::new(
                    Code,
                    format!("CNAME lookup for {host} failed: {error}"),
                ))
            }
            Err(_) => {
                return Err(Rejection::timeout(
                    Code,
                    format!(
                        "CNAME lookup for {host} timed out after {:?}",
                        self.dns_timeout
                    ),
                ))
            }
        };
        debug!(%host, ?targets, "Resolved CNAME");

        let bases = self.config.public_bases();
        let delegated = targets.iter().any(|target| {
            let target = target.trim_end_matches('.').to_ascii_lowercase();
            bases
                .iter()
                .any(|base| target == *base || target.ends_with(&format!(".{base}")))
        });
        if delegated {
            return Ok(());
        }
        if targets.is_empty() {
            return Err(Rejection::new(
                Code,
                format!(
                    "{host} has no CNAME record; point it at a name under {}",
                    self.config.base_domain
                ),
            ));
        }
        Err(Rejection::new(
            Code,
            format!(
                "{host} is an alias for {}, which is not under {}",
                targets.join(", "),
                bases.join(", ")
            ),
        ))
    }

    async fn check_icp(&self, compliance: &dyn CheckCompliance, host: &str) -> Result<(), Rejection> {
        use RejectionCode::ComplianceFailure as Code;

        match time::timeout(self.icp_timeout, compliance.is_registered(host)).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(Rejection::new(
                Code,
                format!("{host} has no ICP registration"),
            )),
            Ok(Err(error)) => Err(Rejection::new(
                Code,
                format!("ICP lookup for {host} failed: {error}"),
            )),
            Err(_) => Err(Rejection::timeout(
                Code,
                format!("ICP lookup for {host} timed out after {:?}", self.icp_timeout),
            )),
        }
    }
}

// === impl DnsResolver ===

impl DnsResolver {
    pub fn from_system_conf() -> Result<Self> {
        Ok(Self(TokioAsyncResolver::tokio_from_system_conf()?))
    }
}

#[async_trait::async_trait]
impl ResolveCname for DnsResolver {
    async fn resolve_cname(&self, host: &str) -> Result<Vec<String>> {
        // Fully qualified so search domains are never appended.
        match self.0.lookup(format!("{host}."), RecordType::CNAME).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .filter_map(|rdata| match rdata {
                    RData::CNAME(name) => Some(name.0.to_utf8()),
                    _ => None,
                })
                .collect()),
            Err(error) if matches!(error.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                Ok(Vec::new())
            }
            Err(error) => Err(error.into()),
        }
    }
}

// === impl IcpClient ===

impl IcpClient {
    pub fn new(endpoint: impl Into<String>, key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            key,
        })
    }
}

#[async_trait::async_trait]
impl CheckCompliance for IcpClient {
    async fn is_registered(&self, host: &str) -> Result<bool> {
        let mut query = vec![("domain", host)];
        if let Some(key) = self.key.as_deref() {
            query.push(("key", key));
        }
        let rsp: IcpResponse = self
            .client
            .get(&self.endpoint)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(%host, ?rsp, "ICP lookup");
        Ok(rsp.error_code == 0
            && rsp
                .result
                .and_then(|r| r.site_license)
                .is_some_and(|license| !license.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::{btreemap, btreeset};
    use mesh_ingress_controller_core::DomainPattern;
    use pretty_assertions::assert_eq;

    struct StaticCnames(std::collections::BTreeMap<String, Vec<String>>);

    #[async_trait::async_trait]
    impl ResolveCname for StaticCnames {
        async fn resolve_cname(&self, host: &str) -> Result<Vec<String>> {
            Ok(self.0.get(host).cloned().unwrap_or_default())
        }
    }

    struct SlowDns;

    #[async_trait::async_trait]
    impl ResolveCname for SlowDns {
        async fn resolve_cname(&self, _: &str) -> Result<Vec<String>> {
            time::sleep(Duration::from_secs(60)).await;
            Ok(vec![])
        }
    }

    struct Registered(BTreeSet<String>);

    #[async_trait::async_trait]
    impl CheckCompliance for Registered {
        async fn is_registered(&self, host: &str) -> Result<bool> {
            Ok(self.0.contains(host))
        }
    }

    fn config() -> Arc<NetworkConfig> {
        let mut config = NetworkConfig::new("cloud.sealos.io");
        config.public_domains = vec!["*.sealos.run".parse::<DomainPattern>().unwrap()];
        Arc::new(config)
    }

    fn validator(
        resolver: impl ResolveCname,
        compliance: Option<Arc<dyn CheckCompliance>>,
    ) -> HostValidator {
        HostValidator::new(
            config(),
            Arc::new(resolver),
            compliance,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }

    fn cnames() -> StaticCnames {
        StaticCnames(btreemap! {
            "www.example.org".to_string() => vec!["gw.cloud.sealos.io.".to_string()],
            "shop.example.org".to_string() => vec!["Edge.Sealos.Run".to_string()],
            "evil.example.org".to_string() => vec!["attacker.example.net".to_string()],
        })
    }

    #[tokio::test]
    async fn public_hosts_skip_dns() {
        let hosts = btreeset! {"demo.cloud.sealos.io".to_string(), "x.sealos.run".to_string()};
        validator(SlowDns, None)
            .validate(&hosts)
            .await
            .expect("public hosts must be accepted");
    }

    #[tokio::test]
    async fn cnames_must_point_under_a_public_base() {
        let v = validator(cnames(), None);
        v.validate(&btreeset! {"www.example.org".to_string(), "shop.example.org".to_string()})
            .await
            .expect("delegated hosts must be accepted");

        let rejection = v
            .validate(&btreeset! {"evil.example.org".to_string()})
            .await
            .expect_err("foreign CNAME must be rejected");
        assert_eq!(rejection.code, RejectionCode::CnameValidationFailure);
        assert!(!rejection.is_retryable());

        let rejection = v
            .validate(&btreeset! {"bare.example.org".to_string()})
            .await
            .expect_err("missing CNAME must be rejected");
        assert_eq!(rejection.code, RejectionCode::CnameValidationFailure);
        assert!(
            rejection.to_string().starts_with("CnameValidationFailure: "),
            "{rejection}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dns_timeouts_fail_closed() {
        let rejection = validator(SlowDns, None)
            .validate(&btreeset! {"www.example.org".to_string()})
            .await
            .expect_err("slow lookups must be rejected");
        assert_eq!(rejection.code, RejectionCode::CnameValidationFailure);
        assert!(rejection.is_retryable());
        assert!(
            rejection.to_string().ends_with(" (retryable)"),
            "{rejection}"
        );
    }

    #[tokio::test]
    async fn compliance_is_checked_after_dns() {
        let icp: Arc<dyn CheckCompliance> =
            Arc::new(Registered(btreeset! {"www.example.org".to_string()}));
        let v = validator(cnames(), Some(icp));

        v.validate(&btreeset! {"www.example.org".to_string()})
            .await
            .expect("registered hosts must be accepted");

        let rejection = v
            .validate(&btreeset! {"shop.example.org".to_string()})
            .await
            .expect_err("unregistered hosts must be rejected");
        assert_eq!(rejection.code, RejectionCode::ComplianceFailure);
        assert_eq!(
            rejection.to_string(),
            "ComplianceFailure: shop.example.org has no ICP registration"
        );
    }

    #[test]
    fn only_index_unavailability_is_retryable() {
        assert!(RejectionCode::IndexUnavailable.is_retryable());
        for code in [
            RejectionCode::CnameValidationFailure,
            RejectionCode::OwnershipConflict,
            RejectionCode::ComplianceFailure,
            RejectionCode::InvalidResource,
        ] {
            assert!(!code.is_retryable(), "{code}");
        }
    }
}
