//! VM lifecycle contract and its backends
//!
//! [`ProvisioningDriver`] is the only interface higher-level handlers use to
//! drive a VM. Two implementations exist:
//!
//! - [`ClusterDriver`] talks to a KubeVirt control plane through kube-rs
//! - [`SimulatedDriver`] keeps VMs in an in-memory [`SimulatedRegistry`]
//!
//! Both report identical externally observable semantics, so callers can swap
//! them without behavioral drift. The variant is chosen once, in
//! [`build_driver`], and never inspected afterwards.

mod cluster;
mod simulated;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
#[cfg(test)]
use mockall::automock;
use tracing::info;

use crate::catalog::Template;
use crate::config::{DriverKind, ProvisionerConfig};
use crate::crd::VirtualDataCenter;
use crate::kube_utils::load_client_config;
use crate::types::{VirtualMachine, VmStatus};
use crate::Error;

pub use cluster::{build_vm_manifest, ClusterDriver, ClusterDriverOptions};
pub use simulated::{SimulatedDriver, SimulatedRegistry, SIMULATED_CONSOLE_BASE};

/// Capability contract for VM lifecycle operations
///
/// Every operation is scoped by `(namespace, id)`. Ids must be DNS labels
/// (see [`crate::manifest::validate_vm_id`]); both backends reject anything
/// else with `Validation`. Dropping a returned future cancels the operation;
/// an operation either fully applies or has no effect.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProvisioningDriver: Send + Sync {
    /// Short backend name for logs ("cluster", "simulated")
    fn backend(&self) -> &'static str;

    /// Register a new VM in the VDC's workload namespace, in the `Stopped` phase
    ///
    /// `manifest` is the template's own materialized VM object, if it has one.
    /// Fails with `Validation` when `vm.id` is not a DNS label and with
    /// `Conflict(AlreadyExists)` when the namespace/id pair is taken.
    async fn create_vm(
        &self,
        vm: &VirtualMachine,
        vdc: &VirtualDataCenter,
        template: &Template,
        manifest: Option<Value>,
    ) -> Result<(), Error>;

    /// Current normalized status of a VM
    async fn get_vm_status(&self, id: &str, namespace: &str) -> Result<VmStatus, Error>;

    /// Start a stopped VM; it gets an IP and moves to `Running`
    async fn start_vm(&self, id: &str, namespace: &str) -> Result<(), Error>;

    /// Stop a running VM; its IP is released and it moves to `Stopped`
    async fn stop_vm(&self, id: &str, namespace: &str) -> Result<(), Error>;

    /// Restart a running VM; it stays `Running` with a refreshed IP
    async fn restart_vm(&self, id: &str, namespace: &str) -> Result<(), Error>;

    /// Remove a VM and every object created for it
    async fn delete_vm(&self, id: &str, namespace: &str) -> Result<(), Error>;

    /// Assigned IP address of a VM
    ///
    /// Fails with `Conflict(NoIpAssigned)` when the VM has no address.
    async fn get_vm_ip_address(&self, id: &str, namespace: &str) -> Result<String, Error>;

    /// URL of the VM's graphical console
    async fn get_vm_console_url(&self, id: &str, namespace: &str) -> Result<String, Error>;

    /// Verify the backend is reachable
    async fn check_connection(&self) -> Result<(), Error>;
}

/// Build the driver selected by configuration
///
/// The simulated variant gets a fresh registry. Falling back to the simulator
/// when the cluster is unreachable is left to the caller.
pub async fn build_driver(config: &ProvisionerConfig) -> Result<Arc<dyn ProvisioningDriver>, Error> {
    match config.driver {
        DriverKind::Simulated => {
            info!(driver = "simulated", "using in-memory provisioning driver");
            Ok(Arc::new(SimulatedDriver::new(Arc::new(
                SimulatedRegistry::new(),
            ))))
        }
        DriverKind::Cluster => {
            let kube_config = load_client_config(
                config.kubeconfig.as_deref(),
                config.connect_timeout,
                config.read_timeout,
            )
            .await?;
            let api_server_url = kube_config.cluster_url.to_string();
            let client = kube::Client::try_from(kube_config).map_err(|e| {
                Error::backend_unavailable(format!("failed to create client: {}", e))
            })?;
            info!(driver = "cluster", api_server = %api_server_url, "using cluster provisioning driver");
            Ok(Arc::new(ClusterDriver::new(
                client,
                ClusterDriverOptions::from_config(config, api_server_url),
            )))
        }
    }
}
