//! Template catalog
//!
//! Reads raw template definitions from a [`TemplateStore`] and normalizes
//! them into [`Template`]s with the ordered rules in [`rules`]. Templates
//! are rebuilt on every read and never cached here.

pub mod rules;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams};
use kube::discovery::ApiResource;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::document::Document;
use crate::kube_utils::{build_api_resource, map_kube_error, with_timeout};
use crate::Error;

/// apiVersion of platform templates
pub const TEMPLATE_API_VERSION: &str = "template.openshift.io/v1";

/// Kind of platform templates
pub const TEMPLATE_KIND: &str = "Template";

/// Label marking a template as a VM template
pub const VM_TEMPLATE_SELECTOR: &str = "template.kubevirt.io/type=vm";

/// A declared template parameter
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateParameter {
    /// Parameter name as referenced by `${NAME}`
    pub name: String,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Default value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Generator; only `expression` is supported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate: Option<String>,
    /// Generator input, e.g. `[a-z0-9]{8}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Whether a value must be present after binding
    #[serde(default)]
    pub required: bool,
}

/// Normalized VM template
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// Template object name
    pub id: String,
    /// Name shown to users
    pub display_name: String,
    /// Description
    pub description: String,
    /// OS type (Fedora, RHEL, Windows, ...)
    pub os_type: String,
    /// OS version, empty when unknown
    pub os_version: String,
    /// Default CPU cores
    pub cpu: u32,
    /// Default memory quantity
    pub memory: String,
    /// Default root disk quantity
    pub disk_size: String,
    /// Namespace the template was read from
    pub namespace: String,
    /// Image reference for the root disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Icon class for UIs
    pub icon_class: String,
    /// Raw embedded objects, placeholders unresolved
    #[serde(default, skip_serializing)]
    pub objects: Vec<Value>,
    /// Declared parameters
    #[serde(default, skip_serializing)]
    pub parameters: Vec<TemplateParameter>,
}

impl Template {
    /// A bare template with default sizing
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: rules::clean_name(&id),
            description: String::new(),
            os_type: rules::DEFAULT_OS.to_string(),
            os_version: String::new(),
            cpu: rules::DEFAULT_FLAVOR.cpu,
            memory: rules::DEFAULT_FLAVOR.memory.to_string(),
            disk_size: rules::DEFAULT_DISK_SIZE.to_string(),
            namespace: String::new(),
            image: None,
            icon_class: rules::DEFAULT_ICON.to_string(),
            objects: Vec::new(),
            parameters: Vec::new(),
            id,
        }
    }

    /// Set the image reference
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Set CPU and memory
    pub fn with_sizing(mut self, cpu: u32, memory: impl Into<String>) -> Self {
        self.cpu = cpu;
        self.memory = memory.into();
        self
    }

    /// Set the embedded objects
    pub fn with_objects(mut self, objects: Vec<Value>) -> Self {
        self.objects = objects;
        self
    }

    /// Set the declared parameters
    pub fn with_parameters(mut self, parameters: Vec<TemplateParameter>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Normalize a raw platform template
    ///
    /// Only a missing `metadata.name` is an error; everything else falls back
    /// to rule defaults. Parameters without a name are dropped.
    pub fn from_raw(raw: &Value) -> Result<Self, Error> {
        let doc = Document::new(raw);
        let id = doc
            .non_empty_str(&["metadata", "name"])
            .ok_or_else(|| Error::materialization(TEMPLATE_KIND, "<unnamed>", "template has no metadata.name"))?
            .to_string();
        let annotations = doc.string_map(&["metadata", "annotations"]);
        let labels = doc.string_map(&["metadata", "labels"]);
        let objects = doc.array(&["objects"]).to_vec();

        let parameters = doc
            .array(&["parameters"])
            .iter()
            .filter_map(|p| serde_json::from_value::<TemplateParameter>(p.clone()).ok())
            .filter(|p| !p.name.is_empty())
            .collect();

        let (os_type, os_version) = rules::resolve_os(&id, &annotations, &labels);
        let flavor = rules::resolve_flavor(&id, &labels);
        let description = non_empty_annotation(&annotations, rules::ANNOTATION_DESCRIPTION)
            .or_else(|| non_empty_annotation(&annotations, rules::ANNOTATION_LONG_DESCRIPTION))
            .unwrap_or_default();

        Ok(Self {
            display_name: rules::resolve_display_name(&id, &annotations),
            description,
            os_type,
            os_version,
            cpu: flavor.cpu,
            memory: flavor.memory.to_string(),
            disk_size: rules::resolve_disk_size(&objects),
            namespace: doc
                .str(&["metadata", "namespace"])
                .unwrap_or_default()
                .to_string(),
            image: rules::resolve_image(&annotations),
            icon_class: rules::resolve_icon(&id, &annotations),
            objects,
            parameters,
            id,
        })
    }
}

fn non_empty_annotation(annotations: &BTreeMap<String, String>, key: &str) -> Option<String> {
    annotations.get(key).filter(|v| !v.trim().is_empty()).cloned()
}

/// Source of raw template definitions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// All raw templates
    async fn list(&self) -> Result<Vec<Value>, Error>;

    /// One raw template by name
    async fn get(&self, id: &str) -> Result<Value, Error>;
}

/// Templates read from the cluster's template API
#[derive(Clone)]
pub struct KubeTemplateStore {
    client: Client,
    namespace: String,
    selector: Option<String>,
    request_timeout: Duration,
    resource: ApiResource,
}

impl KubeTemplateStore {
    /// Read VM templates from `namespace`
    pub fn new(client: Client, namespace: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            selector: Some(VM_TEMPLATE_SELECTOR.to_string()),
            request_timeout,
            resource: build_api_resource(TEMPLATE_API_VERSION, TEMPLATE_KIND),
        }
    }

    /// Replace the label selector; `None` lists every template
    pub fn with_selector(mut self, selector: Option<String>) -> Self {
        self.selector = selector;
        self
    }

    fn api(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &self.resource)
    }
}

fn to_value(obj: &DynamicObject) -> Result<Value, Error> {
    serde_json::to_value(obj).map_err(|e| Error::serialization_for_kind(TEMPLATE_KIND, e.to_string()))
}

#[async_trait]
impl TemplateStore for KubeTemplateStore {
    async fn list(&self) -> Result<Vec<Value>, Error> {
        let api = self.api();
        let mut params = ListParams::default();
        if let Some(selector) = &self.selector {
            params = params.labels(selector);
        }
        let list = with_timeout(self.request_timeout, "list templates", async {
            api.list(&params)
                .await
                .map_err(|e| map_kube_error(e, TEMPLATE_KIND, &self.namespace, "*"))
        })
        .await?;
        debug!(namespace = %self.namespace, count = list.items.len(), "listed templates");
        list.items.iter().map(to_value).collect()
    }

    async fn get(&self, id: &str) -> Result<Value, Error> {
        let api = self.api();
        let obj = with_timeout(self.request_timeout, "get template", async {
            api.get(id)
                .await
                .map_err(|e| map_kube_error(e, TEMPLATE_KIND, &self.namespace, id))
        })
        .await?;
        to_value(&obj)
    }
}

/// Templates held in memory, keyed by name
#[derive(Clone, Debug, Default)]
pub struct StaticTemplateStore {
    namespace: String,
    templates: BTreeMap<String, Value>,
}

impl StaticTemplateStore {
    /// Build a store from raw templates; entries without a name are skipped
    pub fn new(namespace: impl Into<String>, templates: Vec<Value>) -> Self {
        let templates = templates
            .into_iter()
            .filter_map(|t| {
                let name = Document::new(&t).non_empty_str(&["metadata", "name"])?.to_string();
                Some((name, t))
            })
            .collect();
        Self {
            namespace: namespace.into(),
            templates,
        }
    }

    /// Parse one or more YAML documents
    ///
    /// Each document is either a template or a `List` whose `items` are
    /// templates.
    pub fn from_yaml(namespace: impl Into<String>, yaml: &str) -> Result<Self, Error> {
        let mut templates = Vec::new();
        for document in serde_yaml::Deserializer::from_str(yaml) {
            let value = Value::deserialize(document)
                .map_err(|e| Error::serialization_for_kind(TEMPLATE_KIND, e.to_string()))?;
            if value.is_null() {
                continue;
            }
            match Document::new(&value).str(&["kind"]) {
                Some("List") | Some("TemplateList") => {
                    templates.extend(Document::new(&value).array(&["items"]).iter().cloned())
                }
                _ => templates.push(value),
            }
        }
        Ok(Self::new(namespace, templates))
    }
}

#[async_trait]
impl TemplateStore for StaticTemplateStore {
    async fn list(&self) -> Result<Vec<Value>, Error> {
        Ok(self.templates.values().cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Value, Error> {
        self.templates
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(TEMPLATE_KIND, &self.namespace, id))
    }
}

/// Normalized view over a template store
#[derive(Clone)]
pub struct TemplateCatalog {
    store: Arc<dyn TemplateStore>,
}

impl TemplateCatalog {
    /// Create a catalog over a store
    pub fn new(store: Arc<dyn TemplateStore>) -> Self {
        Self { store }
    }

    /// Every template that normalizes, sorted by display name
    ///
    /// Templates that fail to normalize are skipped with a warning.
    pub async fn list_templates(&self) -> Result<Vec<Template>, Error> {
        let mut templates: Vec<Template> = self
            .store
            .list()
            .await?
            .iter()
            .filter_map(|raw| match Template::from_raw(raw) {
                Ok(t) => Some(t),
                Err(e) => {
                    warn!(error = %e, "skipping malformed template");
                    None
                }
            })
            .collect();
        templates.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        Ok(templates)
    }

    /// One template by id
    pub async fn get_template(&self, id: &str) -> Result<Template, Error> {
        let raw = self.store.get(id).await?;
        Template::from_raw(&raw)
    }
}
