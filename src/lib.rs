//! vdc-provisioner - VM provisioning core for tenant-partitioned KubeVirt clusters
//!
//! Turns a catalog of VM templates and a hierarchical quota model
//! (organization → virtual data center → VM) into running VMs while keeping
//! every tenant inside its resource ceilings.
//!
//! # Architecture
//!
//! A deploy request flows through:
//! - the [`catalog`], which resolves and normalizes a template
//! - the [`quota`] enforcer, which rejects VMs that do not fit the VDC
//! - the [`manifest`] builder, which materializes the template's objects
//! - a [`driver`], which creates the VM on the cluster or in the simulator
//!
//! [`status`] turns raw cluster objects into a canonical [`types::VmStatus`]
//! on demand. [`provisioner::Provisioner`] wires these together.
//!
//! # Modules
//!
//! - [`catalog`] - Template stores and normalization of template metadata
//! - [`config`] - Provisioner configuration and driver selection
//! - [`crd`] - VirtualDataCenter custom resource
//! - [`document`] - Path lookups over untyped JSON objects
//! - [`driver`] - VM lifecycle contract plus cluster and simulated backends
//! - [`error`] - Error types for the provisioning core
//! - [`kube_utils`] - Client construction, API resources and kube error mapping
//! - [`manifest`] - Template materialization, name sanitization and object sinks
//! - [`provisioner`] - End-to-end deploy pipeline
//! - [`quota`] - Quota validation and ResourceQuota/LimitRange enforcement
//! - [`status`] - Normalization of VM and VMI objects into [`types::VmStatus`]
//! - [`telemetry`] - Tracing subscriber setup
//! - [`types`] - VM records, deploy requests and status types
//! - [`units`] - Kubernetes quantity parsing and formatting

#![deny(missing_docs)]

pub mod catalog;
pub mod config;
pub mod crd;
pub mod document;
pub mod driver;
pub mod error;
pub mod kube_utils;
pub mod manifest;
pub mod provisioner;
pub mod quota;
pub mod status;
pub mod telemetry;
pub mod types;
pub mod units;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Labels and ownership
// =============================================================================

/// Domain prefix for labels this crate writes
pub const LABEL_DOMAIN: &str = "vdc.dev";

/// Label carrying the VM id on every object created for a VM
pub const LABEL_VM_ID: &str = "vdc.dev/vm-id";

/// Label carrying the owning VDC id
pub const LABEL_VDC_ID: &str = "vdc.dev/vdc-id";

/// Label carrying the template the VM was deployed from
pub const LABEL_TEMPLATE_ID: &str = "vdc.dev/template-id";

/// Annotation carrying the VM's display name
pub const ANNOTATION_DISPLAY_NAME: &str = "vdc.dev/display-name";

/// Standard managed-by label key
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label on objects this crate creates
pub const MANAGED_BY: &str = "vdc-provisioner";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "vdc-provisioner";
