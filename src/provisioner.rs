//! Deploy pipeline
//!
//! [`Provisioner`] composes the catalog, quota validation, the manifest
//! builder and a driver into one `deploy` call. The driver and sink are fixed
//! at construction.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::catalog::{Template, TemplateCatalog};
use crate::crd::VirtualDataCenter;
use crate::driver::ProvisioningDriver;
use crate::manifest::{sanitize_name, ManifestBuilder, MaterializedObject, ObjectSink};
use crate::quota::validate_resources;
use crate::types::{DeployRequest, VirtualMachine};
use crate::Error;

/// Outcome of a successful deploy
#[derive(Clone, Debug)]
pub struct Deployment {
    /// The VM as registered with the driver
    pub vm: VirtualMachine,
    /// Namespace the VM lives in
    pub namespace: String,
    /// Template the VM was built from
    pub template: Template,
    /// Companion objects submitted after the VM, in order
    pub objects: Vec<MaterializedObject>,
}

/// Runs deploy requests end to end
#[derive(Clone)]
pub struct Provisioner {
    catalog: TemplateCatalog,
    driver: Arc<dyn ProvisioningDriver>,
    sink: Arc<dyn ObjectSink>,
    builder: ManifestBuilder,
}

impl Provisioner {
    /// Compose a provisioner
    pub fn new(
        catalog: TemplateCatalog,
        driver: Arc<dyn ProvisioningDriver>,
        sink: Arc<dyn ObjectSink>,
    ) -> Self {
        Self {
            catalog,
            driver,
            sink,
            builder: ManifestBuilder::new(),
        }
    }

    /// The driver lifecycle calls go to
    pub fn driver(&self) -> &Arc<dyn ProvisioningDriver> {
        &self.driver
    }

    /// The template catalog
    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    /// Deploy a VM from a catalog template into a VDC
    ///
    /// Quota is checked before anything is created. The template's first
    /// `VirtualMachine` object is handed to the driver as the base manifest of
    /// the VM; the remaining objects are submitted after it. If a submission
    /// fails the VM is deleted again before the error is returned.
    #[instrument(skip(self, vdc), fields(vdc = %vdc.id(), template = %request.template_id))]
    pub async fn deploy(
        &self,
        request: &DeployRequest,
        vdc: &VirtualDataCenter,
    ) -> Result<Deployment, Error> {
        let vdc_id = vdc.id();
        if request.vdc_id != vdc_id {
            return Err(Error::validation(format!(
                "request targets VDC {} but {} was supplied",
                request.vdc_id, vdc_id
            )));
        }
        let namespace = vdc.workload_namespace().to_string();
        if !request.namespace.is_empty() && request.namespace != namespace {
            return Err(Error::validation(format!(
                "namespace {} is not the workload namespace {} of VDC {}",
                request.namespace, namespace, vdc_id
            )));
        }

        let template = self.catalog.get_template(&request.template_id).await?;
        let disk_size = request
            .disk_size
            .clone()
            .unwrap_or_else(|| template.disk_size.clone());

        let vm = VirtualMachine::new(
            sanitize_name(&request.vm_name),
            request.vm_name.clone(),
            template.cpu,
            template.memory.clone(),
            disk_size,
        );
        validate_resources(&vm, vdc)?;

        let mut targeted = request.clone();
        targeted.namespace = namespace.clone();
        let materialized = self.builder.materialize(&template, &targeted)?;

        let mut base = None;
        let mut objects = Vec::with_capacity(materialized.objects.len());
        for object in materialized.objects {
            if object.is_virtual_machine() && base.is_none() {
                base = Some(object.object);
            } else if !object.is_virtual_machine() {
                objects.push(object);
            }
        }

        self.driver.create_vm(&vm, vdc, &template, base).await?;

        if let Err(e) = self.builder.submit(&objects, self.sink.as_ref()).await {
            if let Err(cleanup) = self.driver.delete_vm(&vm.id, &namespace).await {
                warn!(vm = %vm.id, error = %cleanup, "failed to remove VM after aborted deploy");
            }
            return Err(e);
        }

        info!(
            vm = %vm.id,
            namespace = %namespace,
            backend = self.driver.backend(),
            objects = objects.len(),
            "deployed VM"
        );
        Ok(Deployment {
            vm,
            namespace,
            template,
            objects,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticTemplateStore;
    use crate::crd::{QuotaSpec, VirtualDataCenterSpec};
    use crate::driver::MockProvisioningDriver;
    use crate::error::ResourceDimension;
    use crate::manifest::{MockObjectSink, RecordingSink};
    use serde_json::json;

    fn vdc(cpu: u32) -> VirtualDataCenter {
        VirtualDataCenter::new(
            "acme-dev",
            VirtualDataCenterSpec {
                organization: "acme".to_string(),
                workload_namespace: "acme-dev".to_string(),
                quota: QuotaSpec {
                    cpu,
                    memory_gi: 16,
                    storage_gi: 100,
                },
                limit_range: None,
            },
        )
    }

    fn catalog() -> TemplateCatalog {
        let template = json!({
            "metadata": {
                "name": "rhel9-server-large",
                "labels": {"flavor.template.kubevirt.io/large": "true"}
            },
            "objects": [
                {
                    "apiVersion": "kubevirt.io/v1",
                    "kind": "VirtualMachine",
                    "metadata": {"name": "${NAME}"},
                    "spec": {"template": {"spec": {"volumes": [
                        {"name": "cloudinit", "cloudInitNoCloud": {"secretRef": {"name": "${NAME}-cloudinit"}}}
                    ]}}}
                },
                {"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "${NAME}-cloudinit"}}
            ]
        });
        TemplateCatalog::new(Arc::new(StaticTemplateStore::new("openshift", vec![template])))
    }

    fn request() -> DeployRequest {
        DeployRequest {
            template_id: "rhel9-server-large".to_string(),
            vm_name: "DB 01".to_string(),
            namespace: "acme-dev".to_string(),
            disk_size: None,
            vdc_id: "acme-dev".to_string(),
        }
    }

    /// Story: a quota violation stops the deploy before the driver is touched
    #[tokio::test]
    async fn story_quota_checked_before_create() {
        let mut driver = MockProvisioningDriver::new();
        driver.expect_create_vm().never();
        let provisioner = Provisioner::new(
            catalog(),
            Arc::new(driver),
            Arc::new(RecordingSink::new()),
        );

        // large flavor asks for 2 cores
        let err = provisioner.deploy(&request(), &vdc(1)).await.unwrap_err();
        assert_eq!(err.exceeded_dimension(), Some(ResourceDimension::Cpu));
    }

    #[tokio::test]
    async fn test_deploy_creates_vm_then_companions() {
        let mut driver = MockProvisioningDriver::new();
        driver
            .expect_create_vm()
            .withf(|vm, vdc, template, _| {
                vm.id == "db-01"
                    && vm.cpu == 2
                    && vm.memory == "8Gi"
                    && vm.disk_size == "30Gi"
                    && vdc.workload_namespace() == "acme-dev"
                    && template.id == "rhel9-server-large"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        driver.expect_backend().return_const("mock");

        let sink = Arc::new(RecordingSink::new());
        let provisioner = Provisioner::new(catalog(), Arc::new(driver), sink.clone());
        let deployment = provisioner.deploy(&request(), &vdc(8)).await.unwrap();

        assert_eq!(deployment.vm.name, "DB 01");
        let kinds: Vec<_> = sink.objects().into_iter().map(|o| o.kind).collect();
        assert_eq!(kinds, vec!["Secret"]);
    }

    /// Story: the template's own VM object reaches the driver with its volumes
    #[tokio::test]
    async fn story_template_vm_becomes_base_manifest() {
        let mut driver = MockProvisioningDriver::new();
        driver
            .expect_create_vm()
            .withf(|_, _, _, manifest| {
                manifest.as_ref().is_some_and(|m| {
                    m["kind"] == "VirtualMachine"
                        && m["metadata"]["namespace"] == "acme-dev"
                        && m["spec"]["template"]["spec"]["volumes"][0]["cloudInitNoCloud"]
                            ["secretRef"]["name"]
                            == "db-01-cloudinit"
                })
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        driver.expect_backend().return_const("mock");

        let sink = Arc::new(RecordingSink::new());
        let provisioner = Provisioner::new(catalog(), Arc::new(driver), sink.clone());
        let deployment = provisioner.deploy(&request(), &vdc(8)).await.unwrap();

        assert!(deployment.objects.iter().all(|o| !o.is_virtual_machine()));
        assert_eq!(sink.objects().len(), 1);
    }

    #[tokio::test]
    async fn test_template_without_vm_passes_no_manifest() {
        let template = json!({
            "metadata": {"name": "bare-small"},
            "objects": [{"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "${NAME}-cfg"}}]
        });
        let catalog =
            TemplateCatalog::new(Arc::new(StaticTemplateStore::new("openshift", vec![template])));

        let mut driver = MockProvisioningDriver::new();
        driver
            .expect_create_vm()
            .withf(|_, _, _, manifest| manifest.is_none())
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        driver.expect_backend().return_const("mock");

        let provisioner = Provisioner::new(catalog, Arc::new(driver), Arc::new(RecordingSink::new()));
        let mut req = request();
        req.template_id = "bare-small".to_string();
        provisioner.deploy(&req, &vdc(8)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_submission_removes_vm() {
        let mut driver = MockProvisioningDriver::new();
        driver.expect_create_vm().returning(|_, _, _, _| Ok(()));
        driver
            .expect_delete_vm()
            .withf(|id, ns| id == "db-01" && ns == "acme-dev")
            .times(1)
            .returning(|_, _| Ok(()));

        let mut sink = MockObjectSink::new();
        sink.expect_create()
            .returning(|_| Err(Error::backend_unavailable("api down")));

        let provisioner = Provisioner::new(catalog(), Arc::new(driver), Arc::new(sink));
        let err = provisioner.deploy(&request(), &vdc(8)).await.unwrap_err();
        assert!(matches!(err, Error::Materialization { .. }));
    }

    #[tokio::test]
    async fn test_mismatched_vdc_rejected() {
        let provisioner = Provisioner::new(
            catalog(),
            Arc::new(MockProvisioningDriver::new()),
            Arc::new(RecordingSink::new()),
        );
        let mut req = request();
        req.vdc_id = "other".to_string();
        assert!(matches!(
            provisioner.deploy(&req, &vdc(8)).await.unwrap_err(),
            Error::Validation(_)
        ));

        let mut req = request();
        req.namespace = "elsewhere".to_string();
        assert!(matches!(
            provisioner.deploy(&req, &vdc(8)).await.unwrap_err(),
            Error::Validation(_)
        ));
    }
}
