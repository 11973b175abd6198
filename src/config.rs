//! Provisioner configuration
//!
//! A plain struct the binary fills from command-line flags and environment
//! variables. Library callers construct it directly.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::kube_utils::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT};
use crate::{Error, FIELD_MANAGER};

/// Namespace the platform publishes VM templates in
pub const DEFAULT_TEMPLATE_NAMESPACE: &str = "openshift";

/// Default bound for a single control-plane round-trip
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Which provisioning backend to construct
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum DriverKind {
    /// KubeVirt control plane
    #[default]
    Cluster,
    /// In-memory simulator
    Simulated,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cluster => write!(f, "cluster"),
            Self::Simulated => write!(f, "simulated"),
        }
    }
}

/// Runtime configuration for the provisioning core
#[derive(Clone, Debug)]
pub struct ProvisionerConfig {
    /// Backend to construct
    pub driver: DriverKind,
    /// Explicit kubeconfig; inferred when unset
    pub kubeconfig: Option<PathBuf>,
    /// TCP connect timeout for the kube client
    pub connect_timeout: Duration,
    /// Read timeout for the kube client
    pub read_timeout: Duration,
    /// Bound applied to each driver/enforcer round-trip
    pub request_timeout: Duration,
    /// Namespace templates are read from
    pub template_namespace: String,
    /// Web console base URL
    pub console_base_url: Option<String>,
    /// Field manager for server-side apply
    pub field_manager: String,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::default(),
            kubeconfig: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            template_namespace: DEFAULT_TEMPLATE_NAMESPACE.to_string(),
            console_base_url: None,
            field_manager: FIELD_MANAGER.to_string(),
        }
    }
}

impl ProvisionerConfig {
    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<(), Error> {
        if self.request_timeout.is_zero() {
            return Err(Error::validation("request timeout must be non-zero"));
        }
        if self.template_namespace.is_empty() {
            return Err(Error::validation("template namespace must not be empty"));
        }
        if let Some(url) = &self.console_base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(Error::validation(format!(
                    "console base URL must be http(s): {}",
                    url
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProvisionerConfig::default();
        assert_eq!(config.driver, DriverKind::Cluster);
        assert_eq!(config.template_namespace, "openshift");
        assert_eq!(config.field_manager, "vdc-provisioner");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_driver_kind_flag_values() {
        use clap::ValueEnum;
        assert_eq!(DriverKind::from_str("simulated", false).unwrap(), DriverKind::Simulated);
        assert_eq!(DriverKind::from_str("Cluster", true).unwrap(), DriverKind::Cluster);
        assert!(DriverKind::from_str("docker", true).is_err());
        assert_eq!(DriverKind::Simulated.to_string(), "simulated");
    }

    #[test]
    fn test_validation_rejects_bad_console_url() {
        let config = ProvisionerConfig {
            console_base_url: Some("console.example.com".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ProvisionerConfig {
            request_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
