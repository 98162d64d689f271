//! Workload Networking Reconcilers
//!
//! One `kube::runtime::Controller` runs per workload kind (`Terminal`,
//! `Adminer`, `App`). Each reconcile builds the workload's
//! [`NetworkingSpec`](mesh_ingress_controller_core::NetworkingSpec), renders
//! it into Gateway/VirtualService/DestinationRule/Certificate or nginx
//! Ingress objects, converges the cluster toward them and records the outcome
//! in the workload's status.
//!
//! Reconcilers never touch the ownership index. Host conflicts surface as
//! admission denials of the objects they write, which are recorded as a
//! `NetworkingRejected` condition and not retried until the workload changes.
//! Denials marked retryable are retried with backoff instead.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod backoff;
mod cluster;
mod controller;
mod metrics;
mod render;
mod workload;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

#[cfg(test)]
mod tests;

pub use self::{
    backoff::Backoff,
    cluster::{ClusterApi, KubeClusterApi, Managed},
    controller::{error_policy, reconcile, run, Context},
    metrics::ReconcileMetrics,
    render::{render, Desired},
    workload::Workload,
};
use mesh_ingress_controller_core::RETRYABLE_MARKER;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Conflicts, throttling, server errors and transport failures.
    #[error("kubernetes API request failed: {0}")]
    Transient(#[source] kube::Error),

    /// An admission webhook denied a write. Permanent until the workload
    /// changes unless the webhook marked the denial retryable.
    #[error("{code}: {message}")]
    Rejected {
        code: String,
        message: String,
        retryable: bool,
    },

    #[error("{kind} {namespace}/{name} exists and is not owned by this workload")]
    ForeignResource {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("workload is missing {0}")]
    MissingObjectKey(&'static str),

    #[error("invalid workload: {0}")]
    InvalidWorkload(String),

    #[error("failed to encode object: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The code used when a denial carries no recognizable code.
pub const ADMISSION_DENIED: &str = "AdmissionDenied";

// === impl Error ===

impl Error {
    /// Permanent errors are surfaced in status and wait for a spec change.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Rejected { retryable, .. } => !retryable,
            Self::ForeignResource { .. } | Self::InvalidWorkload(_) => true,
            Self::Transient(_) | Self::MissingObjectKey(_) | Self::Encode(_) => false,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::Transient(_) => "Transient",
            Self::Rejected { code, .. } => code,
            Self::ForeignResource { .. } => "ForeignResource",
            Self::MissingObjectKey(_) => "MissingObjectKey",
            Self::InvalidWorkload(_) => "InvalidWorkload",
            Self::Encode(_) => "Encode",
        }
    }
}

impl From<kube::Error> for Error {
    fn from(error: kube::Error) -> Self {
        if let kube::Error::Api(response) = &error {
            if let Some(denial) = response
                .message
                .split_once("denied the request:")
                .map(|(_, denial)| denial.trim())
            {
                let (denial, retryable) = match denial.strip_suffix(RETRYABLE_MARKER) {
                    Some(denial) => (denial.trim_end(), true),
                    None => (denial, false),
                };
                let (code, message) = match denial.split_once(':') {
                    Some((code, message))
                        if !code.is_empty() && code.chars().all(|c| c.is_ascii_alphanumeric()) =>
                    {
                        (code.to_string(), message.trim().to_string())
                    }
                    _ => (ADMISSION_DENIED.to_string(), denial.to_string()),
                };
                return Self::Rejected {
                    code,
                    message,
                    retryable,
                };
            }
        }
        Self::Transient(error)
    }
}
