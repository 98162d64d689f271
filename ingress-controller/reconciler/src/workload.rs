use crate::{cluster::Managed, Error};
use kube::ResourceExt;
use mesh_ingress_controller_core::{
    AppNetworkingParams, AppType, BackendRef, NetworkConfig, Protocol, ProtocolUnsupported,
    WorkloadRef,
};
use mesh_ingress_controller_k8s_api::{Adminer, App, IngressType, Terminal, WorkloadStatus};
use std::num::NonZeroU16;

/// The port ttyd and adminer containers listen on.
const CONSOLE_PORT: NonZeroU16 = match NonZeroU16::new(8080) {
    Some(port) => port,
    None => panic!("port must be non-zero"),
};

/// A workload kind that requests networking.
pub trait Workload: Managed {
    const APP_TYPE: AppType;

    fn ingress_type(&self) -> IngressType;

    fn status(&self) -> Option<&WorkloadStatus>;

    /// Builds this reconcile's networking request. An unrecognized protocol
    /// is served as HTTP and reported alongside the request.
    fn networking_params(
        &self,
        config: &NetworkConfig,
    ) -> Result<(AppNetworkingParams, Option<ProtocolUnsupported>), Error>;

    /// The Deployment whose available replicas are mirrored into status.
    fn deployment_name(&self) -> String {
        self.name_any()
    }

    fn workload_ref(&self) -> Result<WorkloadRef, Error> {
        let namespace = self
            .namespace()
            .ok_or(Error::MissingObjectKey("namespace"))?;
        Ok(WorkloadRef::new(namespace, self.name_any(), Self::APP_TYPE))
    }
}

/// Consoles are served at `<prefix>.<base domain>` by a service named after
/// the workload.
fn console_params(
    workload: WorkloadRef,
    domain_prefix: Option<&str>,
    custom_domain: Option<&String>,
    protocol: Protocol,
    config: &NetworkConfig,
) -> AppNetworkingParams {
    let prefix = domain_prefix
        .filter(|p| !p.is_empty())
        .unwrap_or(&workload.name);
    AppNetworkingParams {
        hosts: vec![format!("{prefix}.{}", config.base_domain)],
        custom_domain: custom_domain.filter(|d| !d.is_empty()).cloned(),
        backend: BackendRef {
            name: workload.name.clone(),
            port: CONSOLE_PORT,
        },
        protocol,
        workload,
    }
}

impl Workload for Terminal {
    const APP_TYPE: AppType = AppType::Terminal;

    fn ingress_type(&self) -> IngressType {
        self.spec.ingress_type
    }

    fn status(&self) -> Option<&WorkloadStatus> {
        self.status.as_ref()
    }

    fn networking_params(
        &self,
        config: &NetworkConfig,
    ) -> Result<(AppNetworkingParams, Option<ProtocolUnsupported>), Error> {
        let params = console_params(
            self.workload_ref()?,
            self.spec.domain_prefix.as_deref(),
            self.spec.custom_domain.as_ref(),
            Protocol::WebSocket,
            config,
        );
        Ok((params, None))
    }
}

impl Workload for Adminer {
    const APP_TYPE: AppType = AppType::Adminer;

    fn ingress_type(&self) -> IngressType {
        self.spec.ingress_type
    }

    fn status(&self) -> Option<&WorkloadStatus> {
        self.status.as_ref()
    }

    fn networking_params(
        &self,
        config: &NetworkConfig,
    ) -> Result<(AppNetworkingParams, Option<ProtocolUnsupported>), Error> {
        let params = console_params(
            self.workload_ref()?,
            self.spec.domain_prefix.as_deref(),
            self.spec.custom_domain.as_ref(),
            Protocol::Http,
            config,
        );
        Ok((params, None))
    }
}

impl Workload for App {
    const APP_TYPE: AppType = AppType::App;

    fn ingress_type(&self) -> IngressType {
        self.spec.ingress_type
    }

    fn status(&self) -> Option<&WorkloadStatus> {
        self.status.as_ref()
    }

    fn networking_params(
        &self,
        _config: &NetworkConfig,
    ) -> Result<(AppNetworkingParams, Option<ProtocolUnsupported>), Error> {
        let service = &self.spec.service;
        if service.name.is_empty() {
            return Err(Error::InvalidWorkload("spec.service.name must be set".into()));
        }
        let port = NonZeroU16::new(service.port)
            .ok_or_else(|| Error::InvalidWorkload("spec.service.port must be non-zero".into()))?;
        let (protocol, unsupported) =
            Protocol::parse_or_http(self.spec.protocol.as_deref().unwrap_or_default());

        let params = AppNetworkingParams {
            workload: self.workload_ref()?,
            hosts: self.spec.hosts.clone(),
            custom_domain: self.spec.custom_domain.clone().filter(|d| !d.is_empty()),
            backend: BackendRef {
                name: service.name.clone(),
                port,
            },
            protocol,
        };
        Ok((params, unsupported))
    }
}
