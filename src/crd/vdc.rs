//! VirtualDataCenter Custom Resource Definition
//!
//! A VirtualDataCenter is a tenant partition: one workload namespace plus the
//! CPU/memory/storage ceilings every VM in it must fit under. The resource is
//! owned by the organization controllers; this crate only reads it.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a VirtualDataCenter
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "vdc.dev",
    version = "v1alpha1",
    kind = "VirtualDataCenter",
    plural = "virtualdatacenters",
    shortname = "vdc",
    namespaced,
    printcolumn = r#"{"name":"Org","type":"string","jsonPath":".spec.organization"}"#,
    printcolumn = r#"{"name":"Namespace","type":"string","jsonPath":".spec.workloadNamespace"}"#,
    printcolumn = r#"{"name":"CPU","type":"integer","jsonPath":".spec.quota.cpu"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDataCenterSpec {
    /// Owning organization id
    pub organization: String,

    /// Namespace VMs of this VDC are created in
    pub workload_namespace: String,

    /// Aggregate ceilings for the VDC
    pub quota: QuotaSpec,

    /// Optional per-VM bounds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_range: Option<LimitRangeSpec>,
}

/// Aggregate resource ceilings; zero means unbounded
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSpec {
    /// CPU cores
    #[serde(default)]
    pub cpu: u32,
    /// Memory in GiB
    #[serde(default)]
    pub memory_gi: u32,
    /// Storage in GiB
    #[serde(default)]
    pub storage_gi: u32,
}

/// Per-VM minimum and maximum sizing
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LimitRangeSpec {
    /// Minimum CPU cores per VM
    pub min_cpu: u32,
    /// Maximum CPU cores per VM
    pub max_cpu: u32,
    /// Minimum memory per VM in GiB
    pub min_memory_gi: u32,
    /// Maximum memory per VM in GiB
    pub max_memory_gi: u32,
}

impl LimitRangeSpec {
    /// Validate that minimums do not exceed maximums
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.min_cpu > self.max_cpu {
            return Err(crate::Error::validation(format!(
                "limit range minCpu {} exceeds maxCpu {}",
                self.min_cpu, self.max_cpu
            )));
        }
        if self.min_memory_gi > self.max_memory_gi {
            return Err(crate::Error::validation(format!(
                "limit range minMemoryGi {} exceeds maxMemoryGi {}",
                self.min_memory_gi, self.max_memory_gi
            )));
        }
        Ok(())
    }
}

impl VirtualDataCenter {
    /// VDC identity (the resource name)
    pub fn id(&self) -> String {
        self.name_any()
    }

    /// Namespace the VDC's workloads live in
    pub fn workload_namespace(&self) -> &str {
        &self.spec.workload_namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn sample_spec() -> VirtualDataCenterSpec {
        VirtualDataCenterSpec {
            organization: "acme".to_string(),
            workload_namespace: "acme-dev".to_string(),
            quota: QuotaSpec {
                cpu: 8,
                memory_gi: 16,
                storage_gi: 100,
            },
            limit_range: None,
        }
    }

    #[test]
    fn test_spec_serializes_camel_case() {
        let json = serde_json::to_value(sample_spec()).unwrap();
        assert_eq!(json["workloadNamespace"], "acme-dev");
        assert_eq!(json["quota"]["memoryGi"], 16);
        assert!(json.get("limitRange").is_none());
    }

    #[test]
    fn test_identity_and_namespace() {
        let vdc = VirtualDataCenter::new("acme-dev-vdc", sample_spec());
        assert_eq!(vdc.id(), "acme-dev-vdc");
        assert_eq!(vdc.workload_namespace(), "acme-dev");
    }

    #[test]
    fn test_limit_range_validation() {
        let ok = LimitRangeSpec {
            min_cpu: 1,
            max_cpu: 4,
            min_memory_gi: 1,
            max_memory_gi: 8,
        };
        assert!(ok.validate().is_ok());

        let bad = LimitRangeSpec {
            min_cpu: 8,
            max_cpu: 4,
            ..ok.clone()
        };
        assert!(bad.validate().unwrap_err().to_string().contains("minCpu"));

        let bad = LimitRangeSpec {
            min_memory_gi: 16,
            ..ok
        };
        assert!(bad.validate().unwrap_err().to_string().contains("minMemoryGi"));
    }

    #[test]
    fn test_crd_metadata() {
        let crd = VirtualDataCenter::crd();
        assert_eq!(
            crd.metadata.name.as_deref(),
            Some("virtualdatacenters.vdc.dev")
        );
        assert_eq!(crd.spec.scope, "Namespaced");
    }
}
