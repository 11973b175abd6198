//! Domain types shared by the drivers, the enforcer and the builder

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A VM as owned by a driver's backing store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    /// Unique id within its namespace
    pub id: String,
    /// Display name
    pub name: String,
    /// Requested CPU cores
    pub cpu: u32,
    /// Requested memory quantity (e.g. "4Gi")
    pub memory: String,
    /// Requested root disk quantity (e.g. "30Gi")
    pub disk_size: String,
    /// Lifecycle status string as last reported
    #[serde(default)]
    pub status: String,
}

impl VirtualMachine {
    /// Create a VM record with the given sizing
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        cpu: u32,
        memory: impl Into<String>,
        disk_size: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            cpu,
            memory: memory.into(),
            disk_size: disk_size.into(),
            status: VmPhase::Stopped.to_string(),
        }
    }
}

/// Request to deploy a VM from a catalog template
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    /// Catalog template id
    pub template_id: String,
    /// Requested VM name (sanitized before use)
    pub vm_name: String,
    /// Namespace the objects are created in
    pub namespace: String,
    /// Root disk size override (e.g. "50Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size: Option<String>,
    /// VDC whose quota the VM is validated against
    pub vdc_id: String,
}

/// Coarse VM lifecycle state
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VmPhase {
    /// Defined but not running
    #[default]
    Stopped,
    /// Instance is running
    Running,
    /// Storage or instance still being prepared
    Provisioning,
    /// Any other platform-reported phase (Scheduling, Failed, ...)
    Other(String),
}

impl VmPhase {
    /// String form as reported by the platform
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stopped => "Stopped",
            Self::Running => "Running",
            Self::Provisioning => "Provisioning",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for VmPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for VmPhase {
    fn from(s: &str) -> Self {
        match s {
            "Stopped" => Self::Stopped,
            "Running" => Self::Running,
            "Provisioning" => Self::Provisioning,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for VmPhase {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<VmPhase> for String {
    fn from(phase: VmPhase) -> Self {
        phase.as_str().to_string()
    }
}

/// Condition reported on the primary VM object
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmCondition {
    /// Condition type (Ready, Paused, ...)
    #[serde(rename = "type")]
    pub type_: String,
    /// "True", "False" or "Unknown"
    pub status: String,
    /// Machine-readable reason
    pub reason: String,
}

/// Network interface reported on the running instance
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmInterface {
    /// Interface name
    pub name: String,
    /// IP address, empty when not yet assigned
    pub ip_address: String,
    /// MAC address
    pub mac: String,
}

/// Canonical VM status, derived on every query
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmStatus {
    /// Lifecycle phase
    pub phase: VmPhase,
    /// Readiness of the primary object
    pub ready: bool,
    /// First non-empty interface IP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Node hosting the instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Conditions in reported order
    #[serde(default)]
    pub conditions: Vec<VmCondition>,
    /// Interfaces in reported order
    #[serde(default)]
    pub interfaces: Vec<VmInterface>,
    /// Free-form annotations
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_round_trips_through_strings() {
        assert_eq!(VmPhase::from("Running"), VmPhase::Running);
        assert_eq!(
            VmPhase::from("Scheduling"),
            VmPhase::Other("Scheduling".to_string())
        );
        assert_eq!(String::from(VmPhase::Provisioning), "Provisioning");
    }

    #[test]
    fn test_status_serializes_phase_as_plain_string() {
        let status = VmStatus {
            phase: VmPhase::Running,
            ready: true,
            ip_address: Some("10.128.0.100".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "Running");
        assert_eq!(json["ipAddress"], "10.128.0.100");
        assert!(json.get("nodeName").is_none());
    }

    #[test]
    fn test_new_vm_starts_stopped() {
        let vm = VirtualMachine::new("vm-1", "web", 2, "4Gi", "20Gi");
        assert_eq!(vm.status, "Stopped");
    }
}
