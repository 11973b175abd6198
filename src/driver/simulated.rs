//! In-memory provisioning backend
//!
//! Deterministic and safe under concurrent use. All state lives in a
//! [`SimulatedRegistry`] owned by whoever composes the driver; mutations hold
//! the write guard for the whole read-check-write and nothing awaits while a
//! guard is held, so a cancelled call never leaves a half-applied update.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use super::ProvisioningDriver;
use crate::catalog::Template;
use crate::crd::VirtualDataCenter;
use crate::error::ConflictReason;
use crate::manifest::validate_vm_id;
use crate::types::{VirtualMachine, VmCondition, VmInterface, VmPhase, VmStatus};
use crate::{Error, LABEL_TEMPLATE_ID, LABEL_VDC_ID};

/// Base URL for simulated console sessions
pub const SIMULATED_CONSOLE_BASE: &str = "https://console.simulated.local/vm";

/// Node name reported for running simulated VMs
const SIMULATED_NODE: &str = "simulated-node-0";

/// First address of the simulated pod network
const IP_POOL_BASE: Ipv4Addr = Ipv4Addr::new(10, 128, 0, 0);

/// Offset of the first assigned address within the pool
const IP_POOL_OFFSET: u32 = 100;

/// One VM as tracked by the simulator
#[derive(Clone, Debug)]
struct SimulatedVm {
    vm: VirtualMachine,
    vdc_id: String,
    template_id: String,
    phase: VmPhase,
    ip_address: Option<String>,
    created_at: DateTime<Utc>,
}

impl SimulatedVm {
    fn status(&self) -> VmStatus {
        let running = self.phase == VmPhase::Running;
        let ready_condition = VmCondition {
            type_: "Ready".to_string(),
            status: if running { "True" } else { "False" }.to_string(),
            reason: if running { "" } else { "VMINotExists" }.to_string(),
        };
        let interfaces = self
            .ip_address
            .as_deref()
            .map(|ip| {
                vec![VmInterface {
                    name: "default".to_string(),
                    ip_address: ip.to_string(),
                    mac: mac_for(ip),
                }]
            })
            .unwrap_or_default();

        let mut annotations = BTreeMap::new();
        annotations.insert(LABEL_VDC_ID.to_string(), self.vdc_id.clone());
        annotations.insert(LABEL_TEMPLATE_ID.to_string(), self.template_id.clone());
        annotations.insert(
            "vdc.dev/created-at".to_string(),
            self.created_at.to_rfc3339(),
        );

        VmStatus {
            phase: self.phase.clone(),
            ready: running,
            ip_address: self.ip_address.clone(),
            node_name: running.then(|| SIMULATED_NODE.to_string()),
            conditions: vec![ready_condition],
            interfaces,
            annotations,
        }
    }
}

/// Locally administered MAC derived from the last two octets of an IPv4 address
fn mac_for(ip: &str) -> String {
    let octets = ip
        .parse::<Ipv4Addr>()
        .map(|addr| addr.octets())
        .unwrap_or_default();
    format!("02:00:00:00:{:02x}:{:02x}", octets[2], octets[3])
}

/// Registry key for a VM; ids follow the same DNS-label rule as on the cluster
fn registry_key(namespace: &str, id: &str) -> Result<String, Error> {
    validate_vm_id(id)?;
    Ok(format!("{}/{}", namespace, id))
}

/// Registry of simulated VMs keyed by `namespace/id`
///
/// Constructed once by the composition root and shared by `Arc`.
#[derive(Debug, Default)]
pub struct SimulatedRegistry {
    vms: RwLock<HashMap<String, SimulatedVm>>,
}

impl SimulatedRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered VMs
    pub fn len(&self) -> usize {
        self.vms.read().len()
    }

    /// True when no VM is registered
    pub fn is_empty(&self) -> bool {
        self.vms.read().is_empty()
    }

    /// Ids of all VMs registered in `namespace`, sorted
    pub fn ids_in(&self, namespace: &str) -> Vec<String> {
        let prefix = format!("{}/", namespace);
        let mut ids: Vec<String> = self
            .vms
            .read()
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect();
        ids.sort();
        ids
    }
}

/// Next free address for `key`
///
/// Starts at `base + offset + registry_len` and advances past any address
/// held by another VM.
fn allocate_ip(vms: &HashMap<String, SimulatedVm>, key: &str) -> String {
    let in_use: HashSet<&str> = vms
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .filter_map(|(_, v)| v.ip_address.as_deref())
        .collect();

    let mut candidate = u32::from(IP_POOL_BASE)
        .wrapping_add(IP_POOL_OFFSET)
        .wrapping_add(vms.len() as u32);
    loop {
        let ip = Ipv4Addr::from(candidate).to_string();
        if !in_use.contains(ip.as_str()) {
            return ip;
        }
        candidate = candidate.wrapping_add(1);
    }
}

/// Provisioning driver backed by a [`SimulatedRegistry`]
#[derive(Clone, Debug)]
pub struct SimulatedDriver {
    registry: Arc<SimulatedRegistry>,
}

impl SimulatedDriver {
    /// Create a driver over an existing registry
    pub fn new(registry: Arc<SimulatedRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this driver mutates
    pub fn registry(&self) -> &Arc<SimulatedRegistry> {
        &self.registry
    }

    /// Apply `f` to the VM at `namespace/id` under the write lock
    fn mutate<T>(
        &self,
        id: &str,
        namespace: &str,
        f: impl FnOnce(&mut SimulatedVm, &str) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let key = registry_key(namespace, id)?;
        let mut vms = self.registry.vms.write();
        if !vms.contains_key(&key) {
            return Err(Error::not_found("VirtualMachine", namespace, id));
        }
        // Allocation needs the whole map, so compute it before borrowing the entry
        let next_ip = allocate_ip(&vms, &key);
        let entry = vms
            .get_mut(&key)
            .ok_or_else(|| Error::not_found("VirtualMachine", namespace, id))?;
        f(entry, &next_ip)
    }

    fn read<T>(
        &self,
        id: &str,
        namespace: &str,
        f: impl FnOnce(&SimulatedVm) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let key = registry_key(namespace, id)?;
        let vms = self.registry.vms.read();
        vms.get(&key)
            .ok_or_else(|| Error::not_found("VirtualMachine", namespace, id))
            .and_then(f)
    }
}

#[async_trait]
impl ProvisioningDriver for SimulatedDriver {
    fn backend(&self) -> &'static str {
        "simulated"
    }

    async fn create_vm(
        &self,
        vm: &VirtualMachine,
        vdc: &VirtualDataCenter,
        template: &Template,
        _manifest: Option<Value>,
    ) -> Result<(), Error> {
        let namespace = vdc.workload_namespace();
        let key = registry_key(namespace, &vm.id)?;

        let mut vms = self.registry.vms.write();
        if vms.contains_key(&key) {
            return Err(Error::conflict(
                ConflictReason::AlreadyExists,
                namespace,
                &vm.id,
            ));
        }

        let mut record = vm.clone();
        record.status = VmPhase::Stopped.to_string();
        vms.insert(
            key,
            SimulatedVm {
                vm: record,
                vdc_id: vdc.id(),
                template_id: template.id.clone(),
                phase: VmPhase::Stopped,
                ip_address: None,
                created_at: Utc::now(),
            },
        );

        info!(vm = %vm.id, namespace = %namespace, template = %template.id, "created simulated VM");
        Ok(())
    }

    async fn get_vm_status(&self, id: &str, namespace: &str) -> Result<VmStatus, Error> {
        self.read(id, namespace, |vm| Ok(vm.status()))
    }

    async fn start_vm(&self, id: &str, namespace: &str) -> Result<(), Error> {
        let ip = self.mutate(id, namespace, |vm, next_ip| {
            if vm.phase == VmPhase::Running {
                return Err(Error::conflict(
                    ConflictReason::AlreadyRunning,
                    namespace,
                    id,
                ));
            }
            vm.phase = VmPhase::Running;
            vm.vm.status = VmPhase::Running.to_string();
            vm.ip_address = Some(next_ip.to_string());
            Ok(next_ip.to_string())
        })?;
        info!(vm = %id, namespace = %namespace, ip = %ip, "started simulated VM");
        Ok(())
    }

    async fn stop_vm(&self, id: &str, namespace: &str) -> Result<(), Error> {
        self.mutate(id, namespace, |vm, _| {
            if vm.phase != VmPhase::Running {
                return Err(Error::conflict(
                    ConflictReason::AlreadyStopped,
                    namespace,
                    id,
                ));
            }
            vm.phase = VmPhase::Stopped;
            vm.vm.status = VmPhase::Stopped.to_string();
            vm.ip_address = None;
            Ok(())
        })?;
        info!(vm = %id, namespace = %namespace, "stopped simulated VM");
        Ok(())
    }

    async fn restart_vm(&self, id: &str, namespace: &str) -> Result<(), Error> {
        let ip = self.mutate(id, namespace, |vm, next_ip| {
            if vm.phase != VmPhase::Running {
                return Err(Error::conflict(ConflictReason::NotRunning, namespace, id));
            }
            vm.ip_address = Some(next_ip.to_string());
            Ok(next_ip.to_string())
        })?;
        info!(vm = %id, namespace = %namespace, ip = %ip, "restarted simulated VM");
        Ok(())
    }

    async fn delete_vm(&self, id: &str, namespace: &str) -> Result<(), Error> {
        let key = registry_key(namespace, id)?;
        let removed = self.registry.vms.write().remove(&key);
        match removed {
            Some(_) => {
                info!(vm = %id, namespace = %namespace, "deleted simulated VM");
                Ok(())
            }
            None => Err(Error::not_found("VirtualMachine", namespace, id)),
        }
    }

    async fn get_vm_ip_address(&self, id: &str, namespace: &str) -> Result<String, Error> {
        self.read(id, namespace, |vm| {
            vm.ip_address
                .clone()
                .ok_or_else(|| Error::conflict(ConflictReason::NoIpAssigned, namespace, id))
        })
    }

    async fn get_vm_console_url(&self, id: &str, namespace: &str) -> Result<String, Error> {
        self.read(id, namespace, |_| {
            Ok(format!("{}/{}/{}", SIMULATED_CONSOLE_BASE, namespace, id))
        })
    }

    async fn check_connection(&self) -> Result<(), Error> {
        debug!(vms = self.registry.len(), "simulated backend reachable");
        Ok(())
    }
}
