//! Host Ownership Index
//!
//! Tracks which namespace owns each externally routable hostname so that two
//! tenants can never route the same host. The index is fed two ways:
//!
//! - The admission webhook commits claims synchronously when it admits a
//!   `VirtualService` or `Ingress` write (only while it holds the write lease).
//! - Watches over `VirtualService` and `Ingress` objects rebuild the index on
//!   start and keep it current on replicas that do not hold the lease. A
//!   watched write that contradicts an existing owner (one that bypassed
//!   admission) is recorded as drift and otherwise ignored.
//!
//! ```text
//! [ host ] -> ( namespace, { VirtualService/<name>, Ingress/<name>, ... } )
//! ```

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod hosts;
mod index;
mod metrics;


pub use self::{
    hosts::{normalize_host, HostSource, ResourceKind, ResourceRef},
    index::{Conflict, HostRecord, OwnershipIndex, SharedIndex, Unavailable},
    metrics::IndexMetrics,
};
