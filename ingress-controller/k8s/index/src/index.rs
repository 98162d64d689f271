use crate::{
    hosts::{HostSource, ResourceRef},
    metrics::IndexMetrics,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use kube::ResourceExt;
use kubert::index::NamespacedRemoved;
use parking_lot::RwLock;
use std::{cmp::Ordering, collections::BTreeSet, sync::Arc};
use tokio::time::{Duration, Instant};

pub type SharedIndex = Arc<RwLock<OwnershipIndex>>;

/// Maps each owned host to the namespace that owns it.
#[derive(Debug)]
pub struct OwnershipIndex {
    hosts: HashMap<String, HostRecord>,

    /// Reverse mapping used to release a resource's hosts when it is deleted
    /// or stops listing them.
    by_resource: HashMap<(String, ResourceRef), BTreeSet<String>>,

    /// Updated on every watch event and reset, and while the watches are
    /// known to be healthy.
    synced_at: Option<Instant>,

    metrics: IndexMetrics,
}

/// Several resources in the owning namespace may list the same host. The
/// record is dropped when the last of them releases it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostRecord {
    pub namespace: String,
    pub resources: BTreeSet<ResourceRef>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("host {host} is already claimed by {resource} in namespace {namespace}")]
pub struct Conflict {
    pub host: String,
    pub namespace: String,
    pub resource: ResourceRef,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Unavailable {
    #[error("ownership index has not completed its initial sync")]
    NotSynced,

    #[error("ownership index was last synced {0:?} ago")]
    Stale(Duration),
}

// === impl OwnershipIndex ===

impl OwnershipIndex {
    pub fn new(metrics: IndexMetrics) -> Self {
        Self {
            hosts: HashMap::new(),
            by_resource: HashMap::new(),
            synced_at: None,
            metrics,
        }
    }

    pub fn shared(metrics: IndexMetrics) -> SharedIndex {
        Arc::new(RwLock::new(Self::new(metrics)))
    }

    /// Returns the owning namespace and one of its claiming resources.
    pub fn lookup(&self, host: &str) -> Option<(&str, &ResourceRef)> {
        let record = self.hosts.get(host)?;
        let resource = record.resources.first()?;
        Some((record.namespace.as_str(), resource))
    }

    pub fn record(&self, host: &str) -> Option<&HostRecord> {
        self.hosts.get(host)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// The hosts currently attributed to a resource.
    pub fn hosts_of(&self, namespace: &str, resource: &ResourceRef) -> BTreeSet<String> {
        self.by_resource
            .get(&(namespace.to_string(), resource.clone()))
            .cloned()
            .unwrap_or_default()
    }

    /// Checks whether `namespace` could claim every host without mutating
    /// the index.
    pub fn check<'h>(
        &self,
        namespace: &str,
        hosts: impl IntoIterator<Item = &'h str>,
    ) -> Result<(), Conflict> {
        hosts
            .into_iter()
            .try_for_each(|host| self.check_host(host, namespace))
    }

    /// Claims `host` for a resource. Re-claims by the same resource and
    /// claims by other resources in the owning namespace succeed.
    pub fn claim(
        &mut self,
        host: &str,
        namespace: &str,
        resource: ResourceRef,
    ) -> Result<(), Conflict> {
        self.check_host(host, namespace)?;
        self.insert(host, namespace, resource.clone());
        self.by_resource
            .entry((namespace.to_string(), resource))
            .or_default()
            .insert(host.to_string());
        self.update_gauge();
        Ok(())
    }

    /// Releases a resource's claim on `host`. Returns true if a claim was
    /// removed.
    pub fn release(&mut self, host: &str, namespace: &str, resource: &ResourceRef) -> bool {
        let released = self.remove(host, namespace, resource);
        if released {
            if let Some(owned) = self
                .by_resource
                .get_mut(&(namespace.to_string(), resource.clone()))
            {
                owned.remove(host);
                if owned.is_empty() {
                    self.by_resource
                        .remove(&(namespace.to_string(), resource.clone()));
                }
            }
            self.update_gauge();
        }
        released
    }

    /// Replaces the set of hosts a resource claims. Either every host is
    /// claimed, or the index is left untouched and the first conflict is
    /// returned. Hosts the resource no longer lists are released.
    pub fn set_resource_hosts(
        &mut self,
        namespace: &str,
        resource: ResourceRef,
        hosts: BTreeSet<String>,
    ) -> Result<(), Conflict> {
        self.check(namespace, hosts.iter().map(String::as_str))?;

        let key = (namespace.to_string(), resource);
        let previous = self.by_resource.remove(&key).unwrap_or_default();
        let (namespace, resource) = &key;
        for host in previous.difference(&hosts) {
            self.remove(host, namespace, resource);
        }
        for host in &hosts {
            self.insert(host, namespace, resource.clone());
        }
        if !hosts.is_empty() {
            self.by_resource.insert(key, hosts);
        }
        self.update_gauge();
        Ok(())
    }

    /// Claims every host for a resource without releasing the hosts it
    /// claimed before. Either every host is claimed or none is.
    ///
    /// Admitted writes may still fail to be stored, so hosts an update drops
    /// stay claimed until the watch observes the stored object.
    pub fn add_resource_hosts(
        &mut self,
        namespace: &str,
        resource: ResourceRef,
        hosts: BTreeSet<String>,
    ) -> Result<(), Conflict> {
        self.check(namespace, hosts.iter().map(String::as_str))?;
        if hosts.is_empty() {
            return Ok(());
        }
        for host in &hosts {
            self.insert(host, namespace, resource.clone());
        }
        self.by_resource
            .entry((namespace.to_string(), resource))
            .or_default()
            .extend(hosts);
        self.update_gauge();
        Ok(())
    }

    /// Releases every host claimed by a resource, returning them.
    pub fn release_resource(&mut self, namespace: &str, resource: &ResourceRef) -> BTreeSet<String> {
        let hosts = self
            .by_resource
            .remove(&(namespace.to_string(), resource.clone()))
            .unwrap_or_default();
        for host in &hosts {
            self.remove(host, namespace, resource);
        }
        self.update_gauge();
        hosts
    }

    pub fn mark_synced(&mut self, now: Instant) {
        self.synced_at = Some(now);
    }

    /// Refreshes a synced index whose watches are still healthy but have had
    /// nothing to deliver. Never stands in for the initial sync.
    pub fn mark_live(&mut self, now: Instant) {
        if self.synced_at.is_some() {
            self.synced_at = Some(now);
        }
    }

    pub fn ensure_synced(&self) -> Result<(), Unavailable> {
        self.synced_at.map(|_| ()).ok_or(Unavailable::NotSynced)
    }

    /// Fails when the index has neither been updated by a watch nor confirmed
    /// live within `max_staleness`.
    pub fn ensure_fresh(&self, now: Instant, max_staleness: Duration) -> Result<(), Unavailable> {
        let synced_at = self.synced_at.ok_or(Unavailable::NotSynced)?;
        let age = now.saturating_duration_since(synced_at);
        if age > max_staleness {
            return Err(Unavailable::Stale(age));
        }
        Ok(())
    }

    fn check_host(&self, host: &str, namespace: &str) -> Result<(), Conflict> {
        let Some(record) = self.hosts.get(host) else {
            return Ok(());
        };
        match record.resources.first() {
            Some(resource) if record.namespace != namespace => Err(Conflict {
                host: host.to_string(),
                namespace: record.namespace.clone(),
                resource: resource.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Records a claim without checking it. The reverse mapping is left to
    /// the caller.
    fn insert(&mut self, host: &str, namespace: &str, resource: ResourceRef) {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| HostRecord {
                namespace: namespace.to_string(),
                resources: BTreeSet::new(),
            })
            .resources
            .insert(resource);
    }

    fn remove(&mut self, host: &str, namespace: &str, resource: &ResourceRef) -> bool {
        let Some(record) = self.hosts.get_mut(host) else {
            return false;
        };
        if record.namespace != namespace || !record.resources.remove(resource) {
            return false;
        }
        if record.resources.is_empty() {
            self.hosts.remove(host);
        }
        true
    }

    /// Applies a watched resource's hosts. Unlike admission, a conflicting
    /// host does not reject the whole resource: the existing owner is kept
    /// and only the contested host is skipped.
    fn observe(&mut self, namespace: &str, resource: ResourceRef, hosts: BTreeSet<String>) {
        let mut accepted = BTreeSet::new();
        for host in hosts {
            match self.check_host(&host, namespace) {
                Ok(()) => {
                    accepted.insert(host);
                }
                Err(conflict) => {
                    tracing::warn!(
                        %namespace,
                        %resource,
                        host = %conflict.host,
                        owner = %conflict.namespace,
                        "Ignoring host claimed by another namespace",
                    );
                    self.metrics.drift.inc();
                }
            }
        }
        // The accepted set is conflict-free by construction.
        if let Err(error) = self.set_resource_hosts(namespace, resource, accepted) {
            tracing::error!(%error, "Failed to apply checked hosts");
        }
    }

    fn update_gauge(&self) {
        self.metrics.hosts.set(self.hosts.len() as i64);
    }
}

impl<R> kubert::index::IndexNamespacedResource<R> for OwnershipIndex
where
    R: HostSource + ResourceExt,
{
    fn apply(&mut self, resource: R) {
        let namespace = resource.namespace().unwrap_or_default();
        let reference = ResourceRef::new(R::KIND, resource.name_unchecked());
        let hosts = resource.hosts();
        tracing::trace!(%namespace, resource = %reference, ?hosts, "Applying");
        self.observe(&namespace, reference, hosts);
        self.mark_synced(Instant::now());
    }

    fn delete(&mut self, namespace: String, name: String) {
        let reference = ResourceRef::new(R::KIND, name);
        let released = self.release_resource(&namespace, &reference);
        tracing::debug!(%namespace, resource = %reference, ?released, "Released");
        self.mark_synced(Instant::now());
    }

    /// Rebuilds the index's view of every `R` from the full list of live
    /// resources. Claims held by resources that are no longer present
    /// (including admitted writes that were never persisted) are dropped.
    ///
    /// Resources are applied oldest first so that a contested host stays
    /// with the namespace that claimed it first, whatever the list order.
    fn reset(&mut self, mut resources: Vec<R>, removed: NamespacedRemoved) {
        let live = resources
            .iter()
            .map(|r| {
                (
                    r.namespace().unwrap_or_default(),
                    ResourceRef::new(R::KIND, r.name_unchecked()),
                )
            })
            .collect::<HashSet<_>>();

        let stale = self
            .by_resource
            .keys()
            .filter(|(_, resource)| resource.kind == R::KIND)
            .filter(|key| !live.contains(*key))
            .cloned()
            .collect::<Vec<_>>();
        let removed = removed.into_iter().flat_map(|(namespace, names)| {
            names
                .into_iter()
                .map(move |name| (namespace.clone(), ResourceRef::new(R::KIND, name)))
        });
        for (namespace, resource) in stale.into_iter().chain(removed) {
            self.release_resource(&namespace, &resource);
        }

        resources.sort_by(oldest_first);
        for resource in resources {
            <Self as kubert::index::IndexNamespacedResource<R>>::apply(self, resource);
        }
        self.mark_synced(Instant::now());
    }
}

fn oldest_first<R: ResourceExt>(a: &R, b: &R) -> Ordering {
    let by_ts = match (a.creation_timestamp(), b.creation_timestamp()) {
        (Some(a_ts), Some(b_ts)) => a_ts.cmp(&b_ts),
        (None, None) => Ordering::Equal,
        // Resources with timestamps are preferred over resources without.
        (Some(_), None) => return Ordering::Less,
        (None, Some(_)) => return Ordering::Greater,
    };
    by_ts
        .then_with(|| a.namespace().cmp(&b.namespace()))
        .then_with(|| a.name_unchecked().cmp(&b.name_unchecked()))
}
