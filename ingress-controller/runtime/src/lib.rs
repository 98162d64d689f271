#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use mesh_ingress_controller_core as core;
pub use mesh_ingress_controller_k8s_api as k8s;
pub use mesh_ingress_controller_k8s_index as index;
pub use mesh_ingress_controller_reconciler as reconciler;

mod admission;
mod args;
mod lease;
mod liveness;
pub mod validation;
pub mod webhook_config;

pub use self::{
    admission::{Admission, AdmissionMetrics},
    args::Args,
};
