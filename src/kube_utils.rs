//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction, `ApiResource` building for untyped objects, and the
//! translation of kube errors into the crate's error kinds.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tracing::debug;

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Load client configuration from an optional kubeconfig path with custom timeouts
///
/// Without a path the configuration is inferred (in-cluster, then
/// `$KUBECONFIG`). Failures are reported as `BackendUnavailable`.
pub async fn load_client_config(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Config, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::backend_unavailable(format!("failed to read kubeconfig: {}", e))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::backend_unavailable(format!("failed to load kubeconfig: {}", e))
                })?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::backend_unavailable(format!("failed to infer config: {}", e)))?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Ok(config)
}

/// Create a kube client from an optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let config = load_client_config(kubeconfig, connect_timeout, read_timeout).await?;
    Client::try_from(config)
        .map_err(|e| Error::backend_unavailable(format!("failed to create client: {}", e)))
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use vdc_provisioner::kube_utils::parse_api_version;
///
/// assert_eq!(parse_api_version("kubevirt.io/v1"), ("kubevirt.io".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an ApiResource from a known apiVersion and kind.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Kinds templates and drivers create, as `(apiVersion, kind, plural)`
pub const KNOWN_KINDS: &[(&str, &str, &str)] = &[
    // KubeVirt
    ("kubevirt.io/v1", "VirtualMachine", "virtualmachines"),
    ("kubevirt.io/v1", "VirtualMachineInstance", "virtualmachineinstances"),
    // CDI
    ("cdi.kubevirt.io/v1beta1", "DataVolume", "datavolumes"),
    // Core
    ("v1", "PersistentVolumeClaim", "persistentvolumeclaims"),
    ("v1", "Secret", "secrets"),
    ("v1", "ConfigMap", "configmaps"),
    ("v1", "Service", "services"),
    ("v1", "ServiceAccount", "serviceaccounts"),
    ("v1", "Pod", "pods"),
    // RBAC
    ("rbac.authorization.k8s.io/v1", "Role", "roles"),
    ("rbac.authorization.k8s.io/v1", "RoleBinding", "rolebindings"),
    // Apps
    ("apps/v1", "Deployment", "deployments"),
];

/// Resolve a kind to its addressable plural resource name
///
/// Kinds in [`KNOWN_KINDS`] use the table; anything else is
/// `lowercase(kind) + "s"`.
pub fn pluralize_kind(kind: &str) -> String {
    KNOWN_KINDS
        .iter()
        .find(|(_, known, _)| known.eq_ignore_ascii_case(kind))
        .map(|(_, _, plural)| (*plural).to_string())
        .unwrap_or_else(|| format!("{}s", kind.to_lowercase()))
}

/// True when the kube error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// True when the kube error is an API 409
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Translate a kube error for a named object into the crate's error kinds
///
/// 404 becomes `NotFound`, transport-level failures become
/// `BackendUnavailable`, everything else stays a `Kube` error.
pub fn map_kube_error(err: kube::Error, kind: &str, namespace: &str, name: &str) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(kind, namespace, name),
        kube::Error::Api(ae) if ae.code == 503 || ae.code == 504 => {
            Error::backend_unavailable(format!("{} {}/{}: {}", kind, namespace, name, ae.message))
        }
        kube::Error::HyperError(e) => Error::backend_unavailable(e.to_string()),
        kube::Error::Service(e) => Error::backend_unavailable(e.to_string()),
        other => Error::Kube(other),
    }
}

/// Bound a single control-plane round-trip by `timeout`
///
/// Elapsed timeouts surface as `BackendUnavailable`. Dropping the returned
/// future cancels the request.
pub async fn with_timeout<T, F>(timeout: Duration, operation: &str, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            debug!(operation, timeout_ms = timeout.as_millis() as u64, "request timed out");
            Err(Error::backend_unavailable(format!(
                "{} timed out after {:?}",
                operation, timeout
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn test_pluralize_known_kinds() {
        assert_eq!(pluralize_kind("VirtualMachine"), "virtualmachines");
        assert_eq!(
            pluralize_kind("VirtualMachineInstance"),
            "virtualmachineinstances"
        );
        assert_eq!(pluralize_kind("DataVolume"), "datavolumes");
        assert_eq!(
            pluralize_kind("PersistentVolumeClaim"),
            "persistentvolumeclaims"
        );
        assert_eq!(pluralize_kind("RoleBinding"), "rolebindings");
        assert_eq!(pluralize_kind("ServiceAccount"), "serviceaccounts");
    }

    #[test]
    fn test_pluralize_unknown_kind_falls_back() {
        assert_eq!(pluralize_kind("NetworkAttachmentDefinition"), "networkattachmentdefinitions");
        assert_eq!(pluralize_kind("Ingress"), "ingresss");
    }

    #[test]
    fn test_build_api_resource() {
        let ar = build_api_resource("cdi.kubevirt.io/v1beta1", "DataVolume");
        assert_eq!(ar.group, "cdi.kubevirt.io");
        assert_eq!(ar.version, "v1beta1");
        assert_eq!(ar.plural, "datavolumes");

        let ar = build_api_resource("v1", "Secret");
        assert_eq!(ar.group, "");
        assert_eq!(ar.plural, "secrets");
    }

    #[test]
    fn test_map_kube_error_not_found() {
        let err = map_kube_error(api_error(404), "VirtualMachine", "ns", "vm-1");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_map_kube_error_unavailable() {
        let err = map_kube_error(api_error(503), "VirtualMachine", "ns", "vm-1");
        assert!(matches!(err, Error::BackendUnavailable { .. }));
    }

    #[test]
    fn test_map_kube_error_passthrough() {
        let err = map_kube_error(api_error(422), "VirtualMachine", "ns", "vm-1");
        assert!(matches!(err, Error::Kube(_)));
        assert!(is_conflict(&api_error(409)));
        assert!(is_not_found(&api_error(404)));
    }

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed() {
        let result: Result<(), Error> = with_timeout(
            Duration::from_millis(10),
            "slow_call",
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable { .. }));
        assert!(err.to_string().contains("slow_call"));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result() {
        let result = with_timeout(Duration::from_secs(1), "fast", async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
