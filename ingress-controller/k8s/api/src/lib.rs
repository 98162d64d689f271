#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cert_manager;
pub mod duration;
pub mod istio;
pub mod labels;
pub mod workload;

pub use self::{
    cert_manager::Certificate,
    duration::MeshDuration,
    istio::{DestinationRule, Gateway, VirtualService},
    labels::Labels,
    workload::{Adminer, App, Condition, IngressType, Terminal, WorkloadStatus},
};
pub use k8s_openapi::{
    api::{
        self,
        admissionregistration::v1::{MutatingWebhookConfiguration, ValidatingWebhookConfiguration},
        apps::v1::Deployment,
        networking::v1::Ingress,
    },
    apimachinery::pkg::apis::meta::v1 as metav1,
};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    core::{ErrorResponse, NamespaceResourceScope},
    Client, Error, Resource,
};
