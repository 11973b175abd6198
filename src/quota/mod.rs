//! Tenant quota enforcement
//!
//! Two halves:
//!
//! - [`validate_resources`] checks a VM against its VDC's ceilings before any
//!   object is created. Pure, no cluster access.
//! - [`QuotaEnforcer`] encodes the ceilings as a namespace `ResourceQuota`
//!   (`vdc-quota`) and per-container `LimitRange` (`vdc-limits`) using
//!   server-side apply, so repeated calls update in place.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    LimitRange, LimitRangeItem, LimitRangeSpec as K8sLimitRangeSpec, ResourceQuota,
    ResourceQuotaSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info};

use crate::crd::{LimitRangeSpec, VirtualDataCenter};
use crate::error::ResourceDimension;
use crate::kube_utils::{is_not_found, map_kube_error, with_timeout};
use crate::types::VirtualMachine;
use crate::units::{format_cpu, format_gib, parse_cpu_millis, parse_quantity_bytes, GIB};
use crate::{Error, LABEL_MANAGED_BY, MANAGED_BY};

/// Name of the per-container LimitRange in a workload namespace
pub const LIMIT_RANGE_NAME: &str = "vdc-limits";

/// Name of the aggregate ResourceQuota in a workload namespace
pub const RESOURCE_QUOTA_NAME: &str = "vdc-quota";

/// Ceiling on concurrent PVCs when storage is bounded
pub const MAX_PERSISTENT_VOLUME_CLAIMS: u32 = 10;

/// Check a VM's sizing against its VDC's ceilings
///
/// Dimensions are checked in order CPU, Memory, Storage; the first violation
/// is returned. A zero ceiling is unbounded.
pub fn validate_resources(vm: &VirtualMachine, vdc: &VirtualDataCenter) -> Result<(), Error> {
    let quota = &vdc.spec.quota;

    if quota.cpu > 0 && vm.cpu > quota.cpu {
        return Err(Error::resource_exceeded(
            ResourceDimension::Cpu,
            vm.cpu.to_string(),
            quota.cpu.to_string(),
        ));
    }

    let memory = parse_quantity_bytes(&vm.memory)?;
    if quota.memory_gi > 0 && memory > u64::from(quota.memory_gi) * GIB {
        return Err(Error::resource_exceeded(
            ResourceDimension::Memory,
            vm.memory.clone(),
            format_gib(quota.memory_gi.into()),
        ));
    }

    let disk = parse_quantity_bytes(&vm.disk_size)?;
    if quota.storage_gi > 0 && disk > u64::from(quota.storage_gi) * GIB {
        return Err(Error::resource_exceeded(
            ResourceDimension::Storage,
            vm.disk_size.clone(),
            format_gib(quota.storage_gi.into()),
        ));
    }

    Ok(())
}

/// Current per-container bounds of a namespace
///
/// CPU in cores, memory in GiB. `exists` is false when no LimitRange is set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LimitRangeInfo {
    /// Whether the LimitRange exists
    pub exists: bool,
    /// Minimum CPU cores
    pub min_cpu: u32,
    /// Maximum CPU cores
    pub max_cpu: u32,
    /// Minimum memory in GiB
    pub min_memory: u32,
    /// Maximum memory in GiB
    pub max_memory: u32,
}

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string())])
}

fn cpu_cores_quantity(cores: u32) -> Quantity {
    Quantity(format!("{}m", u64::from(cores) * 1000))
}

fn gib_quantity(gib: u32) -> Quantity {
    Quantity(format_gib(gib.into()))
}

/// Build the `vdc-limits` LimitRange
///
/// Containers default to the maximum and request the minimum.
pub fn build_limit_range(namespace: &str, bounds: &LimitRangeSpec) -> LimitRange {
    let resources = |cpu: u32, memory: u32| {
        BTreeMap::from([
            ("cpu".to_string(), cpu_cores_quantity(cpu)),
            ("memory".to_string(), gib_quantity(memory)),
        ])
    };

    LimitRange {
        metadata: ObjectMeta {
            name: Some(LIMIT_RANGE_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        spec: Some(K8sLimitRangeSpec {
            limits: vec![LimitRangeItem {
                type_: "Container".to_string(),
                min: Some(resources(bounds.min_cpu, bounds.min_memory_gi)),
                max: Some(resources(bounds.max_cpu, bounds.max_memory_gi)),
                default: Some(resources(bounds.max_cpu, bounds.max_memory_gi)),
                default_request: Some(resources(bounds.min_cpu, bounds.min_memory_gi)),
                ..Default::default()
            }],
        }),
    }
}

/// Build the `vdc-quota` ResourceQuota
///
/// Zero CPU or memory leaves that dimension unbounded. Storage adds
/// `requests.storage` and the PVC count ceiling only when bounded.
pub fn build_resource_quota(
    namespace: &str,
    cpu_millis: u64,
    memory_gi: u32,
    storage_gi: u32,
) -> ResourceQuota {
    let mut hard = BTreeMap::new();
    if cpu_millis > 0 {
        let cpu = Quantity(format_cpu(cpu_millis));
        hard.insert("requests.cpu".to_string(), cpu.clone());
        hard.insert("limits.cpu".to_string(), cpu);
    }
    if memory_gi > 0 {
        let memory = gib_quantity(memory_gi);
        hard.insert("requests.memory".to_string(), memory.clone());
        hard.insert("limits.memory".to_string(), memory);
    }
    if storage_gi > 0 {
        hard.insert("requests.storage".to_string(), gib_quantity(storage_gi));
        hard.insert(
            "persistentvolumeclaims".to_string(),
            Quantity(MAX_PERSISTENT_VOLUME_CLAIMS.to_string()),
        );
    }

    ResourceQuota {
        metadata: ObjectMeta {
            name: Some(RESOURCE_QUOTA_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        spec: Some(ResourceQuotaSpec {
            hard: Some(hard),
            ..Default::default()
        }),
        status: None,
    }
}

/// Read bounds back out of a LimitRange
///
/// Only the first `Container` item is considered; unparseable quantities
/// read as zero.
pub fn limit_range_info(limit_range: &LimitRange) -> LimitRangeInfo {
    let item = limit_range
        .spec
        .as_ref()
        .and_then(|spec| spec.limits.iter().find(|l| l.type_ == "Container"));

    let Some(item) = item else {
        return LimitRangeInfo {
            exists: true,
            ..Default::default()
        };
    };

    let cores = |map: &Option<BTreeMap<String, Quantity>>| {
        map.as_ref()
            .and_then(|m| m.get("cpu"))
            .and_then(|q| parse_cpu_millis(&q.0).ok())
            .map(|millis| (millis / 1000) as u32)
            .unwrap_or(0)
    };
    let gib = |map: &Option<BTreeMap<String, Quantity>>| {
        map.as_ref()
            .and_then(|m| m.get("memory"))
            .and_then(|q| parse_quantity_bytes(&q.0).ok())
            .map(|bytes| (bytes / GIB) as u32)
            .unwrap_or(0)
    };

    LimitRangeInfo {
        exists: true,
        min_cpu: cores(&item.min),
        max_cpu: cores(&item.max),
        min_memory: gib(&item.min),
        max_memory: gib(&item.max),
    }
}

/// Applies VDC ceilings to workload namespaces
#[derive(Clone)]
pub struct QuotaEnforcer {
    client: Client,
    field_manager: String,
    request_timeout: Duration,
}

impl QuotaEnforcer {
    /// Create an enforcer over a kube client
    pub fn new(client: Client, field_manager: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
            request_timeout,
        }
    }

    fn apply_params(&self) -> PatchParams {
        PatchParams::apply(&self.field_manager).force()
    }

    /// Create or update the namespace's `vdc-limits` LimitRange
    pub async fn upsert_limit_range(
        &self,
        namespace: &str,
        min_cpu: u32,
        max_cpu: u32,
        min_memory_gi: u32,
        max_memory_gi: u32,
    ) -> Result<(), Error> {
        let bounds = LimitRangeSpec {
            min_cpu,
            max_cpu,
            min_memory_gi,
            max_memory_gi,
        };
        bounds.validate()?;

        let limit_range = build_limit_range(namespace, &bounds);
        let api: Api<LimitRange> = Api::namespaced(self.client.clone(), namespace);
        let params = self.apply_params();
        with_timeout(self.request_timeout, "apply LimitRange", async {
            api.patch(LIMIT_RANGE_NAME, &params, &Patch::Apply(&limit_range))
                .await
                .map_err(|e| map_kube_error(e, "LimitRange", namespace, LIMIT_RANGE_NAME))
        })
        .await?;

        info!(
            namespace = %namespace,
            min_cpu, max_cpu, min_memory_gi, max_memory_gi,
            "applied LimitRange"
        );
        Ok(())
    }

    /// Create or update the namespace's `vdc-quota` ResourceQuota
    pub async fn upsert_resource_quota(
        &self,
        namespace: &str,
        cpu_millis: u64,
        memory_gi: u32,
        storage_gi: u32,
    ) -> Result<(), Error> {
        let quota = build_resource_quota(namespace, cpu_millis, memory_gi, storage_gi);
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), namespace);
        let params = self.apply_params();
        with_timeout(self.request_timeout, "apply ResourceQuota", async {
            api.patch(RESOURCE_QUOTA_NAME, &params, &Patch::Apply(&quota))
                .await
                .map_err(|e| map_kube_error(e, "ResourceQuota", namespace, RESOURCE_QUOTA_NAME))
        })
        .await?;

        info!(
            namespace = %namespace,
            cpu = %format_cpu(cpu_millis),
            memory_gi, storage_gi,
            "applied ResourceQuota"
        );
        Ok(())
    }

    /// Remove the namespace's LimitRange; absence is success
    pub async fn delete_limit_range(&self, namespace: &str) -> Result<(), Error> {
        let api: Api<LimitRange> = Api::namespaced(self.client.clone(), namespace);
        with_timeout(self.request_timeout, "delete LimitRange", async {
            match api.delete(LIMIT_RANGE_NAME, &DeleteParams::default()).await {
                Ok(_) => {
                    info!(namespace = %namespace, "deleted LimitRange");
                    Ok(())
                }
                Err(e) if is_not_found(&e) => {
                    debug!(namespace = %namespace, "LimitRange already absent");
                    Ok(())
                }
                Err(e) => Err(map_kube_error(e, "LimitRange", namespace, LIMIT_RANGE_NAME)),
            }
        })
        .await
    }

    /// Current bounds of the namespace; `exists=false` when unset
    pub async fn get_limit_range(&self, namespace: &str) -> Result<LimitRangeInfo, Error> {
        let api: Api<LimitRange> = Api::namespaced(self.client.clone(), namespace);
        let limit_range = with_timeout(self.request_timeout, "get LimitRange", async {
            api.get_opt(LIMIT_RANGE_NAME)
                .await
                .map_err(|e| map_kube_error(e, "LimitRange", namespace, LIMIT_RANGE_NAME))
        })
        .await?;
        Ok(limit_range
            .as_ref()
            .map(limit_range_info)
            .unwrap_or_default())
    }

    /// Bring a VDC's workload namespace in line with its spec
    ///
    /// Applies the aggregate quota, then applies the limit range or removes a
    /// stale one.
    pub async fn apply_vdc(&self, vdc: &VirtualDataCenter) -> Result<(), Error> {
        let namespace = vdc.workload_namespace();
        let quota = &vdc.spec.quota;
        self.upsert_resource_quota(
            namespace,
            u64::from(quota.cpu) * 1000,
            quota.memory_gi,
            quota.storage_gi,
        )
        .await?;

        match &vdc.spec.limit_range {
            Some(bounds) => {
                self.upsert_limit_range(
                    namespace,
                    bounds.min_cpu,
                    bounds.max_cpu,
                    bounds.min_memory_gi,
                    bounds.max_memory_gi,
                )
                .await
            }
            None => self.delete_limit_range(namespace).await,
        }
    }
}
