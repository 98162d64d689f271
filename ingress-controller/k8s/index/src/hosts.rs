use mesh_ingress_controller_core::is_internal_host;
use mesh_ingress_controller_k8s_api::{Ingress, VirtualService};
use std::{collections::BTreeSet, fmt};

/// The networking resource kinds that claim hosts.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    VirtualService,
    Ingress,
}

/// A host-claiming resource within a namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
}

/// A resource whose spec lists externally routable hosts.
pub trait HostSource {
    const KIND: ResourceKind;

    /// Normalized external hosts. Cluster-internal names and the catch-all
    /// `*` never participate in ownership.
    fn hosts(&self) -> BTreeSet<String>;
}

pub fn normalize_host(host: &str) -> Option<String> {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() || host == "*" || is_internal_host(&host) {
        return None;
    }
    Some(host)
}

impl HostSource for VirtualService {
    const KIND: ResourceKind = ResourceKind::VirtualService;

    fn hosts(&self) -> BTreeSet<String> {
        self.spec
            .hosts
            .iter()
            .filter_map(|h| normalize_host(h))
            .collect()
    }
}

impl HostSource for Ingress {
    const KIND: ResourceKind = ResourceKind::Ingress;

    fn hosts(&self) -> BTreeSet<String> {
        let Some(spec) = self.spec.as_ref() else {
            return BTreeSet::new();
        };
        let rules = spec
            .rules
            .iter()
            .flatten()
            .filter_map(|r| r.host.as_deref());
        let tls = spec
            .tls
            .iter()
            .flatten()
            .flat_map(|t| t.hosts.iter().flatten())
            .map(String::as_str);
        rules.chain(tls).filter_map(normalize_host).collect()
    }
}

// === impl ResourceKind ===

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VirtualService => "VirtualService",
            Self::Ingress => "Ingress",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl ResourceRef ===

impl ResourceRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn virtual_service(name: impl Into<String>) -> Self {
        Self::new(ResourceKind::VirtualService, name)
    }

    pub fn ingress(name: impl Into<String>) -> Self {
        Self::new(ResourceKind::Ingress, name)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}
