use std::{collections::BTreeMap, sync::Arc};

pub const MANAGED_BY_KEY: &str = "app.kubernetes.io/managed-by";
pub const WORKLOAD_KEY: &str = "mesh-ingress.sealos.io/workload";

/// Shared, cheaply-cloned object labels.
#[derive(Clone, Debug, Eq, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

// === Labels ===

impl Labels {
    /// The labels stamped on every object rendered for `workload`.
    pub fn managed(controller: &str, workload: &str) -> Self {
        [
            (MANAGED_BY_KEY.to_string(), controller.to_string()),
            (WORKLOAD_KEY.to_string(), workload.to_string()),
        ]
        .into_iter()
        .collect()
    }

    pub fn is_managed_by(&self, controller: &str) -> bool {
        self.0.get(MANAGED_BY_KEY).map(String::as_str) == Some(controller)
    }

    pub fn workload(&self) -> Option<&str> {
        self.0.get(WORKLOAD_KEY).map(String::as_str)
    }

    /// True when every label in `self` is present with the same value in
    /// `other`. Extra labels on `other` are tolerated so that labels added
    /// by other tools do not cause rewrites.
    pub fn is_subset_of(&self, other: &Map) -> bool {
        self.0.iter().all(|(k, v)| other.get(k) == Some(v))
    }

    pub fn to_map(&self) -> Map {
        (*self.0).clone()
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}
