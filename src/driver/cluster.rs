//! KubeVirt-backed provisioning driver
//!
//! VMs are `kubevirt.io/v1 VirtualMachine` objects in the VDC's workload
//! namespace. Running state is `spec.running` (or `spec.runStrategy` when a
//! template set one); the transient `VirtualMachineInstance` carries phase,
//! node and interfaces. Every round-trip is bounded by the request timeout.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::ProvisioningDriver;
use crate::catalog::Template;
use crate::config::ProvisionerConfig;
use crate::crd::VirtualDataCenter;
use crate::document::Document;
use crate::error::ConflictReason;
use crate::kube_utils::{
    build_api_resource, is_conflict, is_not_found, map_kube_error, with_timeout, KNOWN_KINDS,
};
use crate::manifest::validate_vm_id;
use crate::status::normalize;
use crate::types::{VirtualMachine, VmStatus};
use crate::{
    Error, ANNOTATION_DISPLAY_NAME, LABEL_MANAGED_BY, LABEL_TEMPLATE_ID, LABEL_VDC_ID,
    LABEL_VM_ID, MANAGED_BY,
};

const KUBEVIRT_API_VERSION: &str = "kubevirt.io/v1";
const VM_KIND: &str = "VirtualMachine";
const VMI_KIND: &str = "VirtualMachineInstance";

/// Kinds removed with a VM, matched by the vm-id label
///
/// Every kind the manifest builder knows except the VM and its instance,
/// which the VM delete itself takes care of.
fn owned_kinds() -> Vec<(&'static str, &'static str)> {
    KNOWN_KINDS
        .iter()
        .filter(|(_, kind, _)| *kind != VM_KIND && *kind != VMI_KIND)
        .map(|(api_version, kind, _)| (*api_version, *kind))
        .collect()
}

/// Tunables for [`ClusterDriver`]
#[derive(Clone, Debug)]
pub struct ClusterDriverOptions {
    /// Upper bound for a single API round-trip
    pub request_timeout: Duration,
    /// Web console base URL; VNC subresource URLs are returned when unset
    pub console_base_url: Option<String>,
    /// API server URL used for VNC subresource URLs
    pub api_server_url: String,
    /// Field manager for server-side apply
    pub field_manager: String,
}

impl ClusterDriverOptions {
    /// Options from provisioner configuration
    pub fn from_config(config: &ProvisionerConfig, api_server_url: String) -> Self {
        Self {
            request_timeout: config.request_timeout,
            console_base_url: config.console_base_url.clone(),
            api_server_url,
            field_manager: config.field_manager.clone(),
        }
    }
}

/// Build the `VirtualMachine` manifest for a VM
///
/// The VM is created halted with a single root disk backed by a DataVolume
/// and one pod network interface. Used when the template carries no VM
/// object of its own.
pub fn build_vm_manifest(vm: &VirtualMachine, vdc: &VirtualDataCenter, template: &Template) -> Value {
    let name = vm.id.as_str();
    let root_disk = format!("{}-rootdisk", name);

    let source = match template.image.as_deref() {
        Some(image) if image.contains("://") => json!({ "registry": { "url": image } }),
        Some(image) => json!({ "registry": { "url": format!("docker://{}", image) } }),
        None => json!({ "blank": {} }),
    };

    json!({
        "apiVersion": KUBEVIRT_API_VERSION,
        "kind": VM_KIND,
        "metadata": {
            "name": name,
            "namespace": vdc.workload_namespace(),
            "labels": {
                LABEL_VM_ID: vm.id,
                LABEL_VDC_ID: vdc.id(),
                LABEL_TEMPLATE_ID: template.id,
                LABEL_MANAGED_BY: MANAGED_BY,
            },
            "annotations": {
                ANNOTATION_DISPLAY_NAME: vm.name,
            },
        },
        "spec": {
            "running": false,
            "dataVolumeTemplates": [{
                "metadata": {
                    "name": root_disk,
                    "labels": { LABEL_VM_ID: vm.id },
                },
                "spec": {
                    "source": source,
                    "storage": {
                        "resources": { "requests": { "storage": vm.disk_size } },
                    },
                },
            }],
            "template": {
                "metadata": {
                    "labels": {
                        LABEL_VM_ID: vm.id,
                        "kubevirt.io/domain": name,
                    },
                },
                "spec": {
                    "domain": {
                        "cpu": { "cores": vm.cpu },
                        "resources": { "requests": { "memory": vm.memory } },
                        "devices": {
                            "disks": [{ "name": "rootdisk", "disk": { "bus": "virtio" } }],
                            "interfaces": [{ "name": "default", "masquerade": {} }],
                        },
                    },
                    "networks": [{ "name": "default", "pod": {} }],
                    "volumes": [{
                        "name": "rootdisk",
                        "dataVolume": { "name": root_disk },
                    }],
                },
            },
        },
    })
}

/// The manifest to create for a VM
///
/// A materialized template VM keeps its own disks, volumes, networks and
/// devices; identity, ownership labels, sizing and the halted run state are
/// laid over it. Without one, [`build_vm_manifest`] is used.
pub fn resolve_vm_manifest(
    vm: &VirtualMachine,
    vdc: &VirtualDataCenter,
    template: &Template,
    base: Option<Value>,
) -> Value {
    let Some(mut manifest) = base.filter(Value::is_object) else {
        return build_vm_manifest(vm, vdc, template);
    };

    let halted = if Document::new(&manifest)
        .non_empty_str(&["spec", "runStrategy"])
        .is_some()
    {
        json!({ "runStrategy": "Halted", "running": null })
    } else {
        json!({ "running": false })
    };

    merge(
        &mut manifest,
        json!({
            "apiVersion": KUBEVIRT_API_VERSION,
            "kind": VM_KIND,
            "metadata": {
                "name": vm.id,
                "namespace": vdc.workload_namespace(),
                "labels": {
                    LABEL_VM_ID: vm.id,
                    LABEL_VDC_ID: vdc.id(),
                    LABEL_TEMPLATE_ID: template.id,
                    LABEL_MANAGED_BY: MANAGED_BY,
                },
                "annotations": {
                    ANNOTATION_DISPLAY_NAME: vm.name,
                },
            },
            "spec": {
                "template": {
                    "metadata": { "labels": { LABEL_VM_ID: vm.id } },
                    "spec": {
                        "domain": {
                            "cpu": { "cores": vm.cpu },
                            "resources": { "requests": { "memory": vm.memory } },
                        },
                    },
                },
            },
        }),
    );
    merge(&mut manifest, json!({ "spec": halted }));
    manifest
}

/// JSON merge patch: objects merge recursively, `null` removes a key
fn merge(target: &mut Value, patch: Value) {
    let Value::Object(entries) = patch else {
        *target = patch;
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in entries {
            if value.is_null() {
                map.remove(&key);
            } else {
                merge(map.entry(key).or_insert(Value::Null), value);
            }
        }
    }
}

/// Whether the VM object asks for a running instance
fn wants_running(vm: &Value) -> bool {
    let doc = Document::new(vm);
    match doc.non_empty_str(&["spec", "runStrategy"]) {
        Some(strategy) => matches!(strategy, "Always" | "RerunOnFailure"),
        None => doc.bool(&["spec", "running"]).unwrap_or(false),
    }
}

/// Merge patch flipping the VM's desired running state
fn running_patch(vm: &Value, running: bool) -> Value {
    if Document::new(vm).non_empty_str(&["spec", "runStrategy"]).is_some() {
        let strategy = if running { "Always" } else { "Halted" };
        json!({ "spec": { "runStrategy": strategy } })
    } else {
        json!({ "spec": { "running": running } })
    }
}

/// Provisioning driver talking to a KubeVirt control plane
#[derive(Clone)]
pub struct ClusterDriver {
    client: Client,
    options: ClusterDriverOptions,
    vm_resource: ApiResource,
    vmi_resource: ApiResource,
}

impl ClusterDriver {
    /// Create a driver over a kube client
    pub fn new(client: Client, options: ClusterDriverOptions) -> Self {
        Self {
            client,
            options,
            vm_resource: build_api_resource(KUBEVIRT_API_VERSION, VM_KIND),
            vmi_resource: build_api_resource(KUBEVIRT_API_VERSION, VMI_KIND),
        }
    }

    fn vm_api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.vm_resource)
    }

    fn vmi_api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.vmi_resource)
    }

    fn timeout(&self) -> Duration {
        self.options.request_timeout
    }

    /// Fetch the VM object as JSON
    async fn get_vm(&self, name: &str, namespace: &str) -> Result<Value, Error> {
        let api = self.vm_api(namespace);
        let obj = with_timeout(self.timeout(), "get VirtualMachine", async {
            api.get(name)
                .await
                .map_err(|e| map_kube_error(e, VM_KIND, namespace, name))
        })
        .await?;
        serde_json::to_value(&obj).map_err(|e| Error::serialization_for_kind(VM_KIND, e.to_string()))
    }

    /// Fetch the running instance, if any
    async fn get_vmi(&self, name: &str, namespace: &str) -> Result<Option<Value>, Error> {
        let api = self.vmi_api(namespace);
        let obj = with_timeout(self.timeout(), "get VirtualMachineInstance", async {
            api.get_opt(name)
                .await
                .map_err(|e| map_kube_error(e, VMI_KIND, namespace, name))
        })
        .await?;
        obj.map(|o| {
            serde_json::to_value(&o)
                .map_err(|e| Error::serialization_for_kind(VMI_KIND, e.to_string()))
        })
        .transpose()
    }

    async fn patch_running(
        &self,
        name: &str,
        namespace: &str,
        vm: &Value,
        running: bool,
    ) -> Result<(), Error> {
        let api = self.vm_api(namespace);
        let patch = running_patch(vm, running);
        with_timeout(self.timeout(), "patch VirtualMachine", async {
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map(|_| ())
                .map_err(|e| map_kube_error(e, VM_KIND, namespace, name))
        })
        .await
    }

    /// Delete every object of `kind` labelled with the VM id
    async fn delete_owned(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        selector: &str,
    ) -> Result<usize, Error> {
        let ar = build_api_resource(api_version, kind);
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);

        let list = with_timeout(self.timeout(), "list owned objects", async {
            api.list(&ListParams::default().labels(selector))
                .await
                .map_err(|e| map_kube_error(e, kind, namespace, selector))
        })
        .await;
        let list = match list {
            Ok(list) => list,
            // CDI may not be installed; nothing of that kind can exist
            Err(e) if e.is_not_found() => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut deleted = 0;
        for obj in list.items {
            let Some(name) = obj.metadata.name else {
                continue;
            };
            let result = with_timeout(self.timeout(), "delete owned object", async {
                match api.delete(&name, &DeleteParams::background()).await {
                    Ok(_) => Ok(true),
                    Err(e) if is_not_found(&e) => Ok(false),
                    Err(e) => Err(map_kube_error(e, kind, namespace, &name)),
                }
            })
            .await?;
            if result {
                debug!(kind = %kind, name = %name, namespace = %namespace, "deleted owned object");
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn console_url(&self, name: &str, namespace: &str) -> String {
        match self.options.console_base_url.as_deref() {
            Some(base) => format!(
                "{}/k8s/ns/{}/kubevirt.io~v1~VirtualMachine/{}/console/standalone",
                base.trim_end_matches('/'),
                namespace,
                name
            ),
            None => format!(
                "{}/apis/subresources.kubevirt.io/v1/namespaces/{}/virtualmachineinstances/{}/vnc",
                self.options.api_server_url.trim_end_matches('/'),
                namespace,
                name
            ),
        }
    }
}

#[async_trait]
impl ProvisioningDriver for ClusterDriver {
    fn backend(&self) -> &'static str {
        "cluster"
    }

    async fn create_vm(
        &self,
        vm: &VirtualMachine,
        vdc: &VirtualDataCenter,
        template: &Template,
        manifest: Option<Value>,
    ) -> Result<(), Error> {
        validate_vm_id(&vm.id)?;
        let namespace = vdc.workload_namespace();
        let manifest = resolve_vm_manifest(vm, vdc, template, manifest);
        let obj: DynamicObject = serde_json::from_value(manifest)
            .map_err(|e| Error::serialization_for_kind(VM_KIND, e.to_string()))?;
        let api = self.vm_api(namespace);

        with_timeout(self.timeout(), "create VirtualMachine", async {
            match api.create(&PostParams::default(), &obj).await {
                Ok(_) => Ok(()),
                Err(e) if is_conflict(&e) => Err(Error::conflict(
                    ConflictReason::AlreadyExists,
                    namespace,
                    &vm.id,
                )),
                Err(e) => Err(map_kube_error(e, VM_KIND, namespace, &vm.id)),
            }
        })
        .await?;

        info!(vm = %vm.id, namespace = %namespace, template = %template.id, "created VirtualMachine");
        Ok(())
    }

    async fn get_vm_status(&self, id: &str, namespace: &str) -> Result<VmStatus, Error> {
        validate_vm_id(id)?;
        let vm = self.get_vm(id, namespace).await?;
        let vmi = self.get_vmi(id, namespace).await?;
        normalize(&vm, vmi.as_ref())
    }

    async fn start_vm(&self, id: &str, namespace: &str) -> Result<(), Error> {
        validate_vm_id(id)?;
        let vm = self.get_vm(id, namespace).await?;
        if wants_running(&vm) {
            return Err(Error::conflict(ConflictReason::AlreadyRunning, namespace, id));
        }
        self.patch_running(id, namespace, &vm, true).await?;
        info!(vm = %id, namespace = %namespace, "started VirtualMachine");
        Ok(())
    }

    async fn stop_vm(&self, id: &str, namespace: &str) -> Result<(), Error> {
        validate_vm_id(id)?;
        let vm = self.get_vm(id, namespace).await?;
        if !wants_running(&vm) {
            return Err(Error::conflict(ConflictReason::AlreadyStopped, namespace, id));
        }
        self.patch_running(id, namespace, &vm, false).await?;
        info!(vm = %id, namespace = %namespace, "stopped VirtualMachine");
        Ok(())
    }

    async fn restart_vm(&self, id: &str, namespace: &str) -> Result<(), Error> {
        validate_vm_id(id)?;
        let vm = self.get_vm(id, namespace).await?;
        if !wants_running(&vm) || self.get_vmi(id, namespace).await?.is_none() {
            return Err(Error::conflict(ConflictReason::NotRunning, namespace, id));
        }

        // KubeVirt recreates the instance for a VM that still wants to run
        let api = self.vmi_api(namespace);
        with_timeout(self.timeout(), "delete VirtualMachineInstance", async {
            match api.delete(id, &DeleteParams::default()).await {
                Ok(_) => Ok(()),
                Err(e) if is_not_found(&e) => Err(Error::conflict(
                    ConflictReason::NotRunning,
                    namespace,
                    id,
                )),
                Err(e) => Err(map_kube_error(e, VMI_KIND, namespace, id)),
            }
        })
        .await?;
        info!(vm = %id, namespace = %namespace, "restarted VirtualMachine");
        Ok(())
    }

    async fn delete_vm(&self, id: &str, namespace: &str) -> Result<(), Error> {
        validate_vm_id(id)?;
        let api = self.vm_api(namespace);
        with_timeout(self.timeout(), "delete VirtualMachine", async {
            api.delete(id, &DeleteParams::background())
                .await
                .map(|_| ())
                .map_err(|e| map_kube_error(e, VM_KIND, namespace, id))
        })
        .await?;

        let selector = format!("{}={}", LABEL_VM_ID, id);
        let kinds = owned_kinds();
        let counts = try_join_all(
            kinds
                .iter()
                .map(|(api_version, kind)| self.delete_owned(api_version, kind, namespace, &selector)),
        )
        .await?;
        for ((_, kind), deleted) in kinds.iter().zip(counts) {
            if deleted > 0 {
                debug!(vm = %id, kind = %kind, count = deleted, "removed objects owned by VM");
            }
        }

        info!(vm = %id, namespace = %namespace, "deleted VirtualMachine");
        Ok(())
    }

    async fn get_vm_ip_address(&self, id: &str, namespace: &str) -> Result<String, Error> {
        self.get_vm_status(id, namespace)
            .await?
            .ip_address
            .ok_or_else(|| Error::conflict(ConflictReason::NoIpAssigned, namespace, id))
    }

    async fn get_vm_console_url(&self, id: &str, namespace: &str) -> Result<String, Error> {
        validate_vm_id(id)?;
        self.get_vm(id, namespace).await?;
        Ok(self.console_url(id, namespace))
    }

    async fn check_connection(&self) -> Result<(), Error> {
        let client = self.client.clone();
        let version = with_timeout(self.timeout(), "get apiserver version", async move {
            client
                .apiserver_version()
                .await
                .map_err(|e| Error::backend_unavailable(e.to_string()))
        })
        .await
        .inspect_err(|e| warn!(error = %e, "control plane unreachable"))?;
        debug!(version = %version.git_version, "control plane reachable");
        Ok(())
    }
}
