use crate::{
    index::{HostSource, ResourceKind, ResourceRef, SharedIndex, Unavailable},
    k8s::{Ingress, VirtualService},
    validation::{HostValidator, Rejection, RejectionCode},
};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use jsonptr::PointerBuf;
use kube::{
    core::{admission::Operation, DynamicObject},
    ResourceExt,
};
use mesh_ingress_controller_core::NetworkConfig;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use serde::de::DeserializeOwned;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{Duration, Instant},
};
use tracing::{debug, info, trace, warn};

/// Validates and mutates VirtualService and Ingress writes against the
/// ownership index.
#[derive(Clone)]
pub struct Admission {
    index: SharedIndex,
    config: Arc<NetworkConfig>,
    validator: HostValidator,
    leader: watch::Receiver<bool>,
    max_staleness: Duration,
    metrics: AdmissionMetrics,
}

#[derive(Clone, Debug, Default)]
pub struct AdmissionMetrics {
    decisions: Family<DecisionLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DecisionLabels {
    operation: String,
    kind: String,
    result: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Route {
    Validate(ResourceKind),
    Mutate(ResourceKind),
}

pub(crate) type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
pub(crate) type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl AdmissionService ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        let route = match Route::from_path(req.uri().path()) {
            Some(route) if req.method() == http::Method::POST => route,
            _ => return Box::pin(future::ok(not_found())),
        };

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: AdmissionReview = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(route, req).await
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new(
        index: SharedIndex,
        config: Arc<NetworkConfig>,
        validator: HostValidator,
        leader: watch::Receiver<bool>,
        max_staleness: Duration,
        metrics: AdmissionMetrics,
    ) -> Self {
        Self {
            index,
            config,
            validator,
            leader,
            max_staleness,
            metrics,
        }
    }

    pub(crate) async fn admit(&self, route: Route, req: AdmissionRequest) -> AdmissionResponse {
        match route {
            Route::Validate(kind) if is_kind(kind, &req) => self.validate(kind, req).await,
            Route::Mutate(kind) if is_kind(kind, &req) => self.mutate(req),
            _ => AdmissionResponse::invalid(format_args!(
                "unsupported resource type: {}.{}.{}",
                req.kind.group, req.kind.version, req.kind.kind
            )),
        }
    }

    async fn validate(&self, kind: ResourceKind, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        let ns = req.namespace.clone().unwrap_or_default();
        let name = request_name(&req);

        let result = match req.operation {
            Operation::Create | Operation::Update => self.claim(kind, &ns, &name, &req).await,
            Operation::Delete => {
                self.release(kind, &ns, &name, req.dry_run);
                Ok(())
            }
            Operation::Connect => Ok(()),
        };

        let operation = operation_label(&req.operation);
        match result {
            Ok(()) => {
                self.metrics.record(operation, kind, "allowed");
                rsp
            }
            Err(rejection) => {
                info!(%ns, %name, %kind, %rejection, retryable = rejection.is_retryable(), "Denied");
                self.metrics.record(operation, kind, rejection.code.as_str());
                rsp.deny(rejection)
            }
        }
    }

    /// Claims the resource's hosts. Ownership is pre-checked before the
    /// external checks so that conflicts fail fast, and committed only after
    /// every check passed so that rejected requests leave no partial claims.
    async fn claim(
        &self,
        kind: ResourceKind,
        ns: &str,
        name: &str,
        req: &AdmissionRequest,
    ) -> Result<(), Rejection> {
        let obj = req.object.as_ref().ok_or_else(|| {
            Rejection::new(
                RejectionCode::InvalidResource,
                "admission request is missing its object",
            )
        })?;
        let hosts = extract_hosts(kind, obj)?;
        debug!(%ns, %name, ?hosts, "Validating hosts");

        let leader = *self.leader.borrow();
        self.ensure_available(leader)?;
        self.index
            .read()
            .check(ns, hosts.iter().map(String::as_str))
            .map_err(conflict)?;

        self.validator.validate(&hosts).await?;

        let resource = ResourceRef::new(kind, name);
        if req.dry_run || !leader {
            return self
                .index
                .read()
                .check(ns, hosts.iter().map(String::as_str))
                .map_err(conflict);
        }
        // Hosts an update drops are released by the watch once the update is
        // stored.
        self.index
            .write()
            .add_resource_hosts(ns, resource, hosts)
            .map_err(conflict)
    }

    fn release(&self, kind: ResourceKind, ns: &str, name: &str, dry_run: bool) {
        if dry_run || !*self.leader.borrow() {
            return;
        }
        let released = self
            .index
            .write()
            .release_resource(ns, &ResourceRef::new(kind, name));
        debug!(%ns, %name, ?released, "Released hosts");
    }

    /// The leader owns the index once it has synced. Followers serve from the
    /// watch-fed cache and fail closed once it is stale.
    fn ensure_available(&self, leader: bool) -> Result<(), Rejection> {
        let index = self.index.read();
        let available = if leader {
            index.ensure_synced()
        } else {
            index.ensure_fresh(Instant::now(), self.max_staleness)
        };
        available.map_err(|error: Unavailable| {
            Rejection::new(RejectionCode::IndexUnavailable, error.to_string())
        })
    }

    fn mutate(&self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        if !matches!(req.operation, Operation::Create | Operation::Update) {
            return rsp;
        }
        let Some(obj) = req.object.as_ref() else {
            return rsp;
        };
        let ns = req.namespace.as_deref().unwrap_or_default();
        if !self.config.is_tenant_namespace(ns) {
            return rsp;
        }

        let patch = default_annotations_patch(
            obj.metadata.annotations.as_ref(),
            &self.config.default_annotations,
        );
        if patch.0.is_empty() {
            return rsp;
        }
        debug!(%ns, name = %request_name(&req), ?patch, "Adding default annotations");
        match rsp.with_patch(patch) {
            Ok(rsp) => rsp,
            Err(error) => {
                warn!(%error, "Failed to encode patch");
                AdmissionResponse::from(&req).deny(error)
            }
        }
    }
}

// === impl Route ===

impl Route {
    const VALIDATE_VIRTUAL_SERVICE: &'static str =
        "/validate-networking-istio-io-v1beta1-virtualservice";
    const MUTATE_VIRTUAL_SERVICE: &'static str =
        "/mutate-networking-istio-io-v1beta1-virtualservice";
    const VALIDATE_INGRESS: &'static str = "/validate-networking-k8s-io-v1-ingress";
    const MUTATE_INGRESS: &'static str = "/mutate-networking-k8s-io-v1-ingress";

    pub(crate) fn from_path(path: &str) -> Option<Self> {
        match path {
            Self::VALIDATE_VIRTUAL_SERVICE => Some(Self::Validate(ResourceKind::VirtualService)),
            Self::MUTATE_VIRTUAL_SERVICE => Some(Self::Mutate(ResourceKind::VirtualService)),
            Self::VALIDATE_INGRESS => Some(Self::Validate(ResourceKind::Ingress)),
            Self::MUTATE_INGRESS => Some(Self::Mutate(ResourceKind::Ingress)),
            _ => None,
        }
    }
}

// === impl AdmissionMetrics ===

impl AdmissionMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let decisions = Family::default();
        prom.register(
            "decisions",
            "Count of admission decisions by operation, kind and result",
            decisions.clone(),
        );
        Self { decisions }
    }

    fn record(&self, operation: &str, kind: ResourceKind, result: &str) {
        self.decisions
            .get_or_create(&DecisionLabels {
                operation: operation.to_string(),
                kind: kind.to_string(),
                result: result.to_string(),
            })
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn count(&self, operation: &str, kind: ResourceKind, result: &str) -> u64 {
        self.decisions
            .get_or_create(&DecisionLabels {
                operation: operation.to_string(),
                kind: kind.to_string(),
                result: result.to_string(),
            })
            .get()
    }
}

fn is_kind(kind: ResourceKind, req: &AdmissionRequest) -> bool {
    let (group, expected) = match kind {
        ResourceKind::VirtualService => ("networking.istio.io", "VirtualService"),
        ResourceKind::Ingress => ("networking.k8s.io", "Ingress"),
    };
    req.kind.group.eq_ignore_ascii_case(group) && req.kind.kind.eq_ignore_ascii_case(expected)
}

fn request_name(req: &AdmissionRequest) -> String {
    if !req.name.is_empty() {
        return req.name.clone();
    }
    req.object
        .as_ref()
        .or(req.old_object.as_ref())
        .map(|obj| obj.name_any())
        .unwrap_or_default()
}

fn operation_label(op: &Operation) -> &'static str {
    match op {
        Operation::Create => "create",
        Operation::Update => "update",
        Operation::Delete => "delete",
        Operation::Connect => "connect",
    }
}

fn extract_hosts(kind: ResourceKind, obj: &DynamicObject) -> Result<BTreeSet<String>, Rejection> {
    fn parse<T: HostSource + DeserializeOwned>(
        obj: &DynamicObject,
    ) -> Result<BTreeSet<String>, Rejection> {
        let value = serde_json::to_value(obj)
            .map_err(|error| Rejection::new(RejectionCode::InvalidResource, error.to_string()))?;
        let resource = serde_json::from_value::<T>(value)
            .map_err(|error| Rejection::new(RejectionCode::InvalidResource, error.to_string()))?;
        Ok(resource.hosts())
    }

    match kind {
        ResourceKind::VirtualService => parse::<VirtualService>(obj),
        ResourceKind::Ingress => parse::<Ingress>(obj),
    }
}

fn conflict(error: crate::index::Conflict) -> Rejection {
    Rejection::new(RejectionCode::OwnershipConflict, error.to_string())
}

/// Adds each default annotation the object does not already carry.
fn default_annotations_patch(
    existing: Option<&BTreeMap<String, String>>,
    defaults: &BTreeMap<String, String>,
) -> json_patch::Patch {
    use json_patch::{AddOperation, PatchOperation};

    let missing = defaults
        .iter()
        .filter(|(key, _)| existing.map_or(true, |a| !a.contains_key(*key)))
        .collect::<Vec<_>>();

    let mut ops = Vec::with_capacity(missing.len() + 1);
    if existing.is_none() && !missing.is_empty() {
        ops.push(PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["metadata", "annotations"]),
            value: serde_json::json!({}),
        }));
    }
    for (key, value) in missing {
        ops.push(PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["metadata", "annotations", key.as_str()]),
            value: serde_json::Value::String(value.clone()),
        }));
    }
    json_patch::Patch(ops)
}

fn not_found() -> Response<Body> {
    let mut rsp = Response::new(Body::default());
    *rsp.status_mut() = http::StatusCode::NOT_FOUND;
    rsp
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    let mut rsp = Response::new(Body::from(bytes));
    rsp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    Ok(rsp)
}
