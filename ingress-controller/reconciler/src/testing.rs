//! An in-memory [`ClusterApi`] for exercising reconcilers without an API
//! server.

use crate::cluster::{ClusterApi, Managed};
use async_trait::async_trait;
use kube::core::ErrorResponse;
use parking_lot::Mutex;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

type Key = (String, String, String);

/// Writes that are routed through the [`AdmissionHook`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// A write as an admission webhook would see it.
#[derive(Clone, Debug)]
pub struct AdmissionCall {
    pub operation: Operation,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub object: Option<Value>,
    pub old_object: Option<Value>,
}

/// Reviews VirtualService and Ingress writes before they are stored.
#[async_trait]
pub trait AdmissionHook: Send + Sync + 'static {
    /// Returns the denial message when the write is rejected.
    async fn review(&self, call: AdmissionCall) -> Result<(), String>;
}

#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<Key, Value>>,
    admission: Option<Arc<dyn AdmissionHook>>,
    failures: Mutex<Vec<u16>>,
    writes: AtomicUsize,
    versions: AtomicU64,
}

// === impl FakeCluster ===

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_admission(hook: Arc<dyn AdmissionHook>) -> Self {
        Self {
            admission: Some(hook),
            ..Self::default()
        }
    }

    /// Stores an object without counting it as a write. Missing uids and
    /// resource versions are filled in.
    pub fn insert<K: Managed>(&self, obj: &K) -> K {
        let value = self.stamp(obj, true);
        let stored = serde_json::from_value(value.clone()).expect("object must round trip");
        self.objects.lock().insert(key_of::<K>(obj), value);
        stored
    }

    pub fn get_obj<K: Managed>(&self, ns: &str, name: &str) -> Option<K> {
        let value = self.get_json(K::kind(&()).as_ref(), ns, name)?;
        Some(serde_json::from_value(value).expect("stored object must decode"))
    }

    pub fn get_json(&self, kind: &str, ns: &str, name: &str) -> Option<Value> {
        self.objects
            .lock()
            .get(&(kind.to_string(), ns.to_string(), name.to_string()))
            .cloned()
    }

    /// Names of the stored objects of `kind` in `ns`.
    pub fn names(&self, kind: &str, ns: &str) -> Vec<String> {
        self.objects
            .lock()
            .keys()
            .filter(|(k, n, _)| k == kind && n == ns)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Creates, replaces, deletes and status patches performed so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Fails the next write with an API error carrying `code`.
    pub fn fail_next_write(&self, code: u16) {
        self.failures.lock().push(code);
    }

    fn stamp<K: Managed>(&self, obj: &K, assign_uid: bool) -> Value {
        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        let mut obj = obj.clone();
        let meta = obj.meta_mut();
        meta.resource_version = Some(version.to_string());
        if assign_uid && meta.uid.is_none() {
            meta.uid = Some(format!("uid-{version}"));
        }
        let mut value = serde_json::to_value(&obj).expect("object must encode");
        if let Some(fields) = value.as_object_mut() {
            fields.insert("apiVersion".into(), K::api_version(&()).into_owned().into());
            fields.insert("kind".into(), K::kind(&()).into_owned().into());
        }
        value
    }

    fn injected_failure(&self) -> Result<(), kube::Error> {
        match self.failures.lock().pop() {
            Some(code) => Err(api_error(code, "Injected", "injected failure".to_string())),
            None => Ok(()),
        }
    }

    async fn admit<K: Managed>(
        &self,
        operation: Operation,
        ns: &str,
        name: &str,
        object: Option<Value>,
        old_object: Option<Value>,
    ) -> Result<(), kube::Error> {
        let kind = K::kind(&()).to_string();
        let Some(hook) = self.admission.as_ref() else {
            return Ok(());
        };
        if kind != "VirtualService" && kind != "Ingress" {
            return Ok(());
        }
        let call = AdmissionCall {
            operation,
            kind,
            namespace: ns.to_string(),
            name: name.to_string(),
            object,
            old_object,
        };
        hook.review(call).await.map_err(|message| {
            api_error(
                400,
                "BadRequest",
                format!("admission webhook \"mesh-ingress-controller\" denied the request: {message}"),
            )
        })
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get<K: Managed>(&self, ns: &str, name: &str) -> Result<Option<K>, kube::Error> {
        match self.get_json(K::kind(&()).as_ref(), ns, name) {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(kube::Error::SerdeError),
            None => Ok(None),
        }
    }

    async fn create<K: Managed>(&self, obj: &K) -> Result<K, kube::Error> {
        self.injected_failure()?;
        let key = key_of::<K>(obj);
        if self.objects.lock().contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("{} already exists", key.2)));
        }
        let value = self.stamp(obj, true);
        self.admit::<K>(Operation::Create, &key.1, &key.2, Some(value.clone()), None)
            .await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().insert(key, value.clone());
        serde_json::from_value(value).map_err(kube::Error::SerdeError)
    }

    async fn replace<K: Managed>(&self, obj: &K) -> Result<K, kube::Error> {
        self.injected_failure()?;
        let key = key_of::<K>(obj);
        let Some(old) = self.objects.lock().get(&key).cloned() else {
            return Err(api_error(404, "NotFound", format!("{} not found", key.2)));
        };
        let current_version = old["metadata"]["resourceVersion"].as_str().map(str::to_string);
        if obj.meta().resource_version != current_version {
            return Err(api_error(409, "Conflict", "the object has been modified".to_string()));
        }
        let mut value = self.stamp(obj, false);
        if let Some(status) = old.get("status") {
            value["status"] = status.clone();
        }
        self.admit::<K>(Operation::Update, &key.1, &key.2, Some(value.clone()), Some(old))
            .await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().insert(key, value.clone());
        serde_json::from_value(value).map_err(kube::Error::SerdeError)
    }

    async fn delete<K: Managed>(&self, ns: &str, name: &str) -> Result<(), kube::Error> {
        self.injected_failure()?;
        let key = (K::kind(&()).to_string(), ns.to_string(), name.to_string());
        let Some(old) = self.objects.lock().get(&key).cloned() else {
            return Ok(());
        };
        self.admit::<K>(Operation::Delete, ns, name, None, Some(old))
            .await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().remove(&key);
        Ok(())
    }

    async fn patch_status<K: Managed>(
        &self,
        ns: &str,
        name: &str,
        status: Value,
    ) -> Result<(), kube::Error> {
        self.injected_failure()?;
        let key = (K::kind(&()).to_string(), ns.to_string(), name.to_string());
        let mut objects = self.objects.lock();
        let Some(value) = objects.get_mut(&key) else {
            return Err(api_error(404, "NotFound", format!("{name} not found")));
        };
        value["status"] = status;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn key_of<K: Managed>(obj: &K) -> Key {
    let meta = obj.meta();
    (
        K::kind(&()).to_string(),
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}
