//! VM status normalization
//!
//! Folds the durable `VirtualMachine` (primary) and its transient
//! `VirtualMachineInstance` into one [`VmStatus`]. Parsing is lenient: missing
//! or mistyped fields read as empty, and a malformed condition or interface
//! entry yields a partially filled record instead of an error.

use serde_json::Value;

use crate::document::Document;
use crate::types::{VmCondition, VmInterface, VmPhase, VmStatus};
use crate::Error;

fn parse_condition(entry: &Value) -> VmCondition {
    let doc = Document::new(entry);
    let field = |name: &str| doc.str(&[name]).unwrap_or_default().to_string();
    VmCondition {
        type_: field("type"),
        status: field("status"),
        reason: field("reason"),
    }
}

fn parse_interface(entry: &Value) -> VmInterface {
    let doc = Document::new(entry);
    let field = |name: &str| doc.str(&[name]).unwrap_or_default().to_string();
    VmInterface {
        name: field("name"),
        ip_address: field("ipAddress"),
        mac: field("mac"),
    }
}

/// Phase from the instance, falling back to the primary's readiness
fn resolve_phase(instance: Option<Document<'_>>, ready: bool) -> VmPhase {
    match instance {
        None => VmPhase::Stopped,
        Some(vmi) => match vmi.non_empty_str(&["status", "phase"]) {
            Some(phase) => VmPhase::from(phase),
            None if ready => VmPhase::Running,
            None => VmPhase::Stopped,
        },
    }
}

/// Normalize a VM's primary object and optional running instance
///
/// Only a primary that is not a JSON object is an error.
pub fn normalize(primary: &Value, instance: Option<&Value>) -> Result<VmStatus, Error> {
    let vm = Document::new(primary);
    if !vm.is_object() {
        return Err(Error::serialization_for_kind(
            "VirtualMachine",
            "primary object is not a map",
        ));
    }
    let vmi = instance.map(Document::new).filter(Document::is_object);

    let ready = vm.bool(&["status", "ready"]).unwrap_or(false);
    let conditions = vm
        .array(&["status", "conditions"])
        .iter()
        .map(parse_condition)
        .collect();

    let interfaces: Vec<VmInterface> = vmi
        .map(|d| d.array(&["status", "interfaces"]))
        .unwrap_or_default()
        .iter()
        .map(parse_interface)
        .collect();
    let ip_address = interfaces
        .iter()
        .find(|i| !i.ip_address.is_empty())
        .map(|i| i.ip_address.clone());

    Ok(VmStatus {
        phase: resolve_phase(vmi, ready),
        ready,
        ip_address,
        node_name: vmi
            .and_then(|d| d.non_empty_str(&["status", "nodeName"]))
            .map(str::to_string),
        conditions,
        interfaces,
        annotations: vm.string_map(&["metadata", "annotations"]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn primary(ready: bool) -> Value {
        let ready_status = if ready { "True" } else { "False" };
        json!({
            "metadata": {"name": "web-1", "annotations": {"vdc.dev/display-name": "Web"}},
            "status": {
                "ready": ready,
                "conditions": [
                    {"type": "Ready", "status": ready_status, "reason": ""}
                ]
            }
        })
    }

    #[test]
    fn test_no_instance_is_stopped() {
        let status = normalize(&primary(false), None).unwrap();
        assert_eq!(status.phase, VmPhase::Stopped);
        assert!(!status.ready);
        assert!(status.ip_address.is_none());
        assert_eq!(status.conditions[0].type_, "Ready");
        assert_eq!(status.annotations["vdc.dev/display-name"], "Web");
    }

    /// Story: a running instance reports its own phase, node and first real IP
    #[test]
    fn story_running_instance() {
        let vmi = json!({
            "status": {
                "phase": "Running",
                "nodeName": "worker-2",
                "interfaces": [
                    {"name": "default", "ipAddress": "", "mac": "02:00:00:00:00:01"},
                    {"name": "secondary", "ipAddress": "10.128.0.7", "mac": "02:00:00:00:00:02"}
                ]
            }
        });
        let status = normalize(&primary(true), Some(&vmi)).unwrap();
        assert_eq!(status.phase, VmPhase::Running);
        assert!(status.ready);
        assert_eq!(status.ip_address.as_deref(), Some("10.128.0.7"));
        assert_eq!(status.node_name.as_deref(), Some("worker-2"));
        assert_eq!(status.interfaces.len(), 2);
    }

    #[test]
    fn test_other_phases_pass_through() {
        let vmi = json!({"status": {"phase": "Scheduling"}});
        let status = normalize(&primary(false), Some(&vmi)).unwrap();
        assert_eq!(status.phase, VmPhase::Other("Scheduling".to_string()));
    }

    #[test]
    fn test_instance_without_phase_uses_readiness() {
        let vmi = json!({"status": {}});
        assert_eq!(
            normalize(&primary(true), Some(&vmi)).unwrap().phase,
            VmPhase::Running
        );
        assert_eq!(
            normalize(&primary(false), Some(&vmi)).unwrap().phase,
            VmPhase::Stopped
        );
    }

    #[test]
    fn test_malformed_entries_are_partial() {
        let vm = json!({
            "status": {
                "ready": "yes",
                "conditions": [{"type": "Paused"}, "garbage", {"status": 1}]
            }
        });
        let vmi = json!({"status": {"phase": "Running", "interfaces": [{"mac": "aa"}, 7]}});
        let status = normalize(&vm, Some(&vmi)).unwrap();
        assert!(!status.ready);
        assert_eq!(status.conditions.len(), 3);
        assert_eq!(status.conditions[0].type_, "Paused");
        assert_eq!(status.conditions[0].status, "");
        assert_eq!(status.conditions[1], VmCondition::default());
        assert_eq!(status.interfaces[0].mac, "aa");
        assert!(status.ip_address.is_none());
    }

    #[test]
    fn test_empty_primary_object() {
        let status = normalize(&json!({}), None).unwrap();
        assert_eq!(status, VmStatus::default());
    }

    #[test]
    fn test_non_object_primary_is_error() {
        assert!(normalize(&json!("nope"), None).is_err());
        assert!(normalize(&json!([1, 2]), None).is_err());
        assert!(normalize(&Value::Null, None).is_err());
    }
}
