//! Template materialization
//!
//! [`ManifestBuilder`] turns a catalog [`Template`] plus a [`DeployRequest`]
//! into concrete cluster objects:
//!
//! 1. sanitize the VM name into a DNS label
//! 2. bind `NAME`, `NAMESPACE` and `DISK_SIZE` over the declared parameters
//! 3. substitute placeholders in each embedded object
//! 4. resolve each kind to its plural resource
//! 5. target the objects at the namespace and label them as owned by the VM
//!
//! Submission goes through an [`ObjectSink`] and stops at the first failure.

mod params;
mod sanitize;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::catalog::Template;
use crate::document::Document;
use crate::kube_utils::{build_api_resource, map_kube_error, pluralize_kind, with_timeout};
use crate::types::DeployRequest;
use crate::{Error, LABEL_MANAGED_BY, LABEL_TEMPLATE_ID, LABEL_VDC_ID, LABEL_VM_ID, MANAGED_BY};

pub use params::{
    bind_parameters, generate_from_expression, substitute, substitute_str, GENERATE_EXPRESSION,
};
pub use sanitize::{sanitize_name, validate_vm_id, DEFAULT_NAME, MAX_NAME_LEN};

/// Parameter bound to the sanitized VM name
pub const PARAM_NAME: &str = "NAME";
/// Parameter bound to the target namespace
pub const PARAM_NAMESPACE: &str = "NAMESPACE";
/// Parameter bound to the root disk size override
pub const PARAM_DISK_SIZE: &str = "DISK_SIZE";

/// One object ready for submission
#[derive(Clone, Debug, PartialEq)]
pub struct MaterializedObject {
    /// `apiVersion` of the object
    pub api_version: String,
    /// `kind` of the object
    pub kind: String,
    /// Plural resource the kind is addressed by
    pub plural: String,
    /// `metadata.name`
    pub name: String,
    /// Target namespace
    pub namespace: String,
    /// The full object
    pub object: Value,
}

impl MaterializedObject {
    /// True for KubeVirt `VirtualMachine` objects
    pub fn is_virtual_machine(&self) -> bool {
        self.kind == "VirtualMachine" && self.api_version.starts_with("kubevirt.io/")
    }

    /// ApiResource addressing this object's collection
    pub fn api_resource(&self) -> ApiResource {
        let mut ar = build_api_resource(&self.api_version, &self.kind);
        ar.plural = self.plural.clone();
        ar
    }
}

/// Result of materializing a template for one VM
#[derive(Clone, Debug)]
pub struct Materialized {
    /// Sanitized VM name, also the VM id
    pub vm_name: String,
    /// Every bound parameter
    pub parameters: BTreeMap<String, String>,
    /// Objects in template order
    pub objects: Vec<MaterializedObject>,
}

/// Destination for materialized objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectSink: Send + Sync {
    /// Create one object
    async fn create(&self, object: &MaterializedObject) -> Result<(), Error>;
}

/// Sink creating objects on the cluster
#[derive(Clone)]
pub struct ClusterObjectSink {
    client: Client,
    request_timeout: Duration,
}

impl ClusterObjectSink {
    /// Create a sink over a kube client
    pub fn new(client: Client, request_timeout: Duration) -> Self {
        Self {
            client,
            request_timeout,
        }
    }
}

#[async_trait]
impl ObjectSink for ClusterObjectSink {
    async fn create(&self, object: &MaterializedObject) -> Result<(), Error> {
        let ar = object.api_resource();
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &object.namespace, &ar);
        let obj: DynamicObject = serde_json::from_value(object.object.clone())
            .map_err(|e| Error::serialization_for_kind(&object.kind, e.to_string()))?;

        with_timeout(self.request_timeout, "create object", async {
            api.create(&PostParams::default(), &obj)
                .await
                .map(|_| ())
                .map_err(|e| map_kube_error(e, &object.kind, &object.namespace, &object.name))
        })
        .await?;
        debug!(kind = %object.kind, name = %object.name, namespace = %object.namespace, "created object");
        Ok(())
    }
}

/// Sink that only records what it was given
///
/// Used by the simulated backend, which persists nothing beyond its VMs.
#[derive(Debug, Default)]
pub struct RecordingSink {
    objects: Mutex<Vec<MaterializedObject>>,
}

impl RecordingSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Objects submitted so far, in order
    pub fn objects(&self) -> Vec<MaterializedObject> {
        self.objects.lock().clone()
    }
}

#[async_trait]
impl ObjectSink for RecordingSink {
    async fn create(&self, object: &MaterializedObject) -> Result<(), Error> {
        self.objects.lock().push(object.clone());
        Ok(())
    }
}

/// Materializes templates into namespaced, owned objects
#[derive(Clone, Debug, Default)]
pub struct ManifestBuilder;

impl ManifestBuilder {
    /// Create a builder
    pub fn new() -> Self {
        Self
    }

    /// Materialize every object of `template` for `request`
    pub fn materialize(
        &self,
        template: &Template,
        request: &DeployRequest,
    ) -> Result<Materialized, Error> {
        let vm_name = sanitize_name(&request.vm_name);

        let mut overrides = BTreeMap::from([
            (PARAM_NAME.to_string(), vm_name.clone()),
            (PARAM_NAMESPACE.to_string(), request.namespace.clone()),
        ]);
        if let Some(disk) = &request.disk_size {
            overrides.insert(PARAM_DISK_SIZE.to_string(), disk.clone());
        }
        let parameters = bind_parameters(
            &template.id,
            &template.parameters,
            &overrides,
            &mut rand::thread_rng(),
        )?;

        let labels = BTreeMap::from([
            (LABEL_VM_ID, vm_name.as_str()),
            (LABEL_VDC_ID, request.vdc_id.as_str()),
            (LABEL_TEMPLATE_ID, template.id.as_str()),
            (LABEL_MANAGED_BY, MANAGED_BY),
        ]);

        let objects = template
            .objects
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                let object = substitute(raw, &parameters);
                finish_object(object, index, &template.id, &request.namespace, &labels)
            })
            .collect::<Result<Vec<_>, Error>>()?;

        debug!(
            template = %template.id,
            vm = %vm_name,
            objects = objects.len(),
            "materialized template"
        );
        Ok(Materialized {
            vm_name,
            parameters,
            objects,
        })
    }

    /// Submit objects in order, stopping at the first failure
    ///
    /// The failure is reported as a materialization error naming the
    /// object's kind and name.
    pub async fn submit(&self, objects: &[MaterializedObject], sink: &dyn ObjectSink) -> Result<(), Error> {
        for object in objects {
            sink.create(object).await.map_err(|e| {
                Error::materialization(&object.kind, &object.name, e.to_string())
            })?;
            info!(kind = %object.kind, name = %object.name, namespace = %object.namespace, "submitted object");
        }
        Ok(())
    }
}

/// Validate one substituted object and stamp namespace and ownership labels
fn finish_object(
    mut object: Value,
    index: usize,
    template_id: &str,
    namespace: &str,
    labels: &BTreeMap<&str, &str>,
) -> Result<MaterializedObject, Error> {
    let doc = Document::new(&object);
    let placeholder = format!("{}[{}]", template_id, index);
    let kind = doc
        .non_empty_str(&["kind"])
        .ok_or_else(|| Error::materialization("Unknown", &placeholder, "object has no kind"))?
        .to_string();
    let api_version = doc
        .non_empty_str(&["apiVersion"])
        .ok_or_else(|| Error::materialization(&kind, &placeholder, "object has no apiVersion"))?
        .to_string();
    let name = doc
        .non_empty_str(&["metadata", "name"])
        .ok_or_else(|| Error::materialization(&kind, &placeholder, "object has no metadata.name"))?
        .to_string();

    let Some(root) = object.as_object_mut() else {
        return Err(Error::materialization(&kind, &name, "object is not a map"));
    };
    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| Error::materialization(&kind, &name, "metadata is not a map"))?;
    metadata.insert("namespace".to_string(), Value::String(namespace.to_string()));

    let label_map = metadata
        .entry("labels")
        .or_insert_with(|| Value::Object(Map::new()));
    if !label_map.is_object() {
        *label_map = Value::Object(Map::new());
    }
    if let Some(label_map) = label_map.as_object_mut() {
        for (key, value) in labels {
            label_map.insert((*key).to_string(), Value::String((*value).to_string()));
        }
    }

    Ok(MaterializedObject {
        plural: pluralize_kind(&kind),
        api_version,
        kind,
        name,
        namespace: namespace.to_string(),
        object,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TemplateParameter;
    use serde_json::json;

    fn template() -> Template {
        let mut template = Template::new("fedora-server-small");
        template.parameters = vec![
            TemplateParameter {
                name: "NAME".to_string(),
                required: true,
                ..Default::default()
            },
            TemplateParameter {
                name: "DISK_SIZE".to_string(),
                value: Some("30Gi".to_string()),
                ..Default::default()
            },
        ];
        template.objects = vec![
            json!({
                "apiVersion": "kubevirt.io/v1",
                "kind": "VirtualMachine",
                "metadata": {"name": "${NAME}", "labels": {"app": "${NAME}"}},
                "spec": {"running": false}
            }),
            json!({
                "apiVersion": "cdi.kubevirt.io/v1beta1",
                "kind": "DataVolume",
                "metadata": {"name": "${NAME}-rootdisk"},
                "spec": {"storage": {"resources": {"requests": {"storage": "${DISK_SIZE}"}}}}
            }),
            json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": "${NAME}-cloudinit", "namespace": "somewhere-else"},
                "stringData": {"userdata": "#cloud-config\nhostname: ${NAME}\n"}
            }),
        ];
        template
    }

    fn request(name: &str, disk: Option<&str>) -> DeployRequest {
        DeployRequest {
            template_id: "fedora-server-small".to_string(),
            vm_name: name.to_string(),
            namespace: "acme-dev".to_string(),
            disk_size: disk.map(str::to_string),
            vdc_id: "acme-dev-vdc".to_string(),
        }
    }

    /// Story: every object comes out named after the VM, in the target namespace, owned by it
    #[test]
    fn story_objects_are_targeted_and_owned() {
        let out = ManifestBuilder::new()
            .materialize(&template(), &request("Web Server", None))
            .unwrap();
        assert_eq!(out.vm_name, "web-server");
        assert_eq!(out.objects.len(), 3);

        for obj in &out.objects {
            assert_eq!(obj.namespace, "acme-dev");
            assert_eq!(obj.object["metadata"]["namespace"], "acme-dev");
            assert_eq!(obj.object["metadata"]["labels"][LABEL_VM_ID], "web-server");
            assert_eq!(obj.object["metadata"]["labels"][LABEL_VDC_ID], "acme-dev-vdc");
            assert_eq!(obj.object["metadata"]["labels"][LABEL_MANAGED_BY], MANAGED_BY);
        }

        assert_eq!(out.objects[0].name, "web-server");
        assert!(out.objects[0].is_virtual_machine());
        assert_eq!(out.objects[0].object["metadata"]["labels"]["app"], "web-server");
        assert_eq!(out.objects[1].plural, "datavolumes");
        assert_eq!(
            out.objects[1].object["spec"]["storage"]["resources"]["requests"]["storage"],
            "30Gi"
        );
        assert_eq!(
            out.objects[2].object["stringData"]["userdata"],
            "#cloud-config\nhostname: web-server\n"
        );
    }

    #[test]
    fn test_disk_override_wins() {
        let out = ManifestBuilder::new()
            .materialize(&template(), &request("db", Some("80Gi")))
            .unwrap();
        assert_eq!(out.parameters[PARAM_DISK_SIZE], "80Gi");
        assert_eq!(
            out.objects[1].object["spec"]["storage"]["resources"]["requests"]["storage"],
            "80Gi"
        );
    }

    #[test]
    fn test_object_without_kind_fails() {
        let mut t = template();
        t.objects.push(json!({"apiVersion": "v1", "metadata": {"name": "x"}}));
        let err = ManifestBuilder::new()
            .materialize(&t, &request("db", None))
            .unwrap_err();
        assert!(matches!(err, Error::Materialization { .. }));
        assert!(err.to_string().contains("fedora-server-small[3]"));
    }

    #[test]
    fn test_unknown_kind_plural_fallback() {
        let mut t = template();
        t.objects = vec![json!({
            "apiVersion": "k8s.cni.cncf.io/v1",
            "kind": "NetworkAttachmentDefinition",
            "metadata": {"name": "${NAME}-net"}
        })];
        let out = ManifestBuilder::new().materialize(&t, &request("db", None)).unwrap();
        assert_eq!(out.objects[0].plural, "networkattachmentdefinitions");
        assert!(!out.objects[0].is_virtual_machine());
    }

    /// Story: the first failed submission stops the rest and names the object
    #[tokio::test]
    async fn story_submit_aborts_on_first_failure() {
        let out = ManifestBuilder::new()
            .materialize(&template(), &request("db", None))
            .unwrap();

        let mut sink = MockObjectSink::new();
        let mut seq = mockall::Sequence::new();
        sink.expect_create()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        sink.expect_create()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|o| Err(Error::backend_unavailable(format!("{} rejected", o.name))));

        let err = ManifestBuilder::new()
            .submit(&out.objects, &sink)
            .await
            .unwrap_err();
        match err {
            Error::Materialization { kind, name, .. } => {
                assert_eq!(kind, "DataVolume");
                assert_eq!(name, "db-rootdisk");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_recording_sink_keeps_order() {
        let out = ManifestBuilder::new()
            .materialize(&template(), &request("db", None))
            .unwrap();
        let sink = RecordingSink::new();
        ManifestBuilder::new().submit(&out.objects, &sink).await.unwrap();
        let kinds: Vec<_> = sink.objects().into_iter().map(|o| o.kind).collect();
        assert_eq!(kinds, vec!["VirtualMachine", "DataVolume", "Secret"]);
    }
}
