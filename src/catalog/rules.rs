//! Ordered classification tables for template normalization
//!
//! Each resolver walks its rules top to bottom and returns the first match.
//! Tables are plain data so individual rules can be tested in isolation.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::document::Document;

/// Explicit display name
pub const ANNOTATION_DISPLAY_NAME: &str = "openshift.io/display-name";
/// Prefix of per-OS display name annotations
pub const ANNOTATION_OS_NAME_PREFIX: &str = "name.os.template.kubevirt.io/";
/// Free-form long description
pub const ANNOTATION_LONG_DESCRIPTION: &str = "openshift.io/long-description";
/// Short description
pub const ANNOTATION_DESCRIPTION: &str = "description";
/// Dedicated OS name
pub const ANNOTATION_OS_NAME: &str = "template.kubevirt.io/os-name";
/// Dedicated OS version
pub const ANNOTATION_OS_VERSION: &str = "template.kubevirt.io/os-version";
/// Generic operating system key (annotation or label)
pub const KEY_GENERIC_OS: &str = "vm.kubevirt.io/os";
/// Prefix of OS boolean labels
pub const LABEL_OS_PREFIX: &str = "os.template.kubevirt.io/";
/// Prefix of flavor boolean labels
pub const LABEL_FLAVOR_PREFIX: &str = "flavor.template.kubevirt.io/";
/// Explicit image reference
pub const ANNOTATION_IMAGE: &str = "vdc.dev/image";
/// Container disk images published with the template
pub const ANNOTATION_CONTAINER_DISKS: &str = "template.kubevirt.io/containerdisks";
/// Explicit icon class
pub const ANNOTATION_ICON_CLASS: &str = "iconClass";
/// Comma separated tags
pub const ANNOTATION_TAGS: &str = "tags";

/// Longest long-description still usable as a display name
const MAX_DESCRIPTION_AS_NAME: usize = 80;

/// Longest all-caps token kept verbatim when cleaning names
const MAX_ACRONYM_LEN: usize = 4;

/// Root disk size when the template does not request one
pub const DEFAULT_DISK_SIZE: &str = "30Gi";

/// Icon when nothing matches
pub const DEFAULT_ICON: &str = "icon-linux";

/// OS when nothing matches
pub const DEFAULT_OS: &str = "Linux";

/// Sizing when nothing matches
pub const DEFAULT_FLAVOR: Flavor = Flavor {
    cpu: 1,
    memory: "2Gi",
};

/// OS families by substring, as (needle, OS type)
const OS_FAMILIES: &[(&str, &str)] = &[
    ("rhel", "RHEL"),
    ("centos", "CentOS"),
    ("fedora", "Fedora"),
    ("ubuntu", "Ubuntu"),
    ("windows", "Windows"),
];

/// Extra prefixes recognised only in OS labels (`win2k22`, `win10`)
const OS_LABEL_ALIASES: &[(&str, &str)] = &[("win", "Windows")];

/// CPU and memory of a flavor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Flavor {
    /// CPU cores
    pub cpu: u32,
    /// Memory quantity
    pub memory: &'static str,
}

/// Flavors by name; also the substrings searched for in template names
const FLAVORS: &[(&str, Flavor)] = &[
    ("tiny", Flavor { cpu: 1, memory: "1Gi" }),
    ("small", Flavor { cpu: 1, memory: "2Gi" }),
    ("medium", Flavor { cpu: 1, memory: "4Gi" }),
    ("large", Flavor { cpu: 2, memory: "8Gi" }),
];

/// Icons by substring of tags or name
const ICONS: &[(&str, &str)] = &[
    ("rhel", "icon-rhel"),
    ("centos", "icon-centos"),
    ("fedora", "icon-fedora"),
    ("ubuntu", "icon-ubuntu"),
    ("debian", "icon-debian"),
    ("windows", "icon-windows"),
];

fn is_true(labels: &BTreeMap<String, String>, key: &str) -> bool {
    labels.get(key).map(|v| v == "true").unwrap_or(false)
}

fn non_empty<'a>(map: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    map.get(key).map(String::as_str).filter(|v| !v.trim().is_empty())
}

/// Turn `rhel9-server-small` into `Rhel9 Server Small VM`
///
/// Short all-caps tokens (`RHEL`, `VM`) are kept; a trailing `VM` is forced.
pub fn clean_name(name: &str) -> String {
    let mut words: Vec<String> = name
        .split(['-', '_', ' '])
        .filter(|w| !w.is_empty())
        .map(|word| {
            if word.eq_ignore_ascii_case("vm") {
                "VM".to_string()
            } else if word.len() <= MAX_ACRONYM_LEN
                && word.chars().any(|c| c.is_ascii_uppercase())
                && word
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
            {
                word.to_string()
            } else {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                }
            }
        })
        .collect();

    if words.last().map(String::as_str) != Some("VM") {
        words.push("VM".to_string());
    }
    words.join(" ")
}

/// Display name, first match wins
pub fn resolve_display_name(name: &str, annotations: &BTreeMap<String, String>) -> String {
    if let Some(display) = non_empty(annotations, ANNOTATION_DISPLAY_NAME) {
        return display.to_string();
    }
    let os_name = annotations
        .iter()
        .find(|(k, v)| k.starts_with(ANNOTATION_OS_NAME_PREFIX) && !v.trim().is_empty());
    if let Some((_, os_name)) = os_name {
        return os_name.clone();
    }
    if let Some(description) = non_empty(annotations, ANNOTATION_LONG_DESCRIPTION) {
        if description.chars().count() < MAX_DESCRIPTION_AS_NAME {
            return description.to_string();
        }
    }
    clean_name(name)
}

/// OS family matched in `haystack` and whatever follows the match
fn os_family(haystack: &str, table: &[(&str, &'static str)]) -> Option<(&'static str, String)> {
    let lower = haystack.to_lowercase();
    table.iter().find_map(|(needle, os)| {
        lower
            .find(needle)
            .map(|at| (*os, lower[at + needle.len()..].to_string()))
    })
}

/// OS type and version, first match wins
pub fn resolve_os(
    name: &str,
    annotations: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> (String, String) {
    if let Some(os) = non_empty(annotations, ANNOTATION_OS_NAME) {
        let version = non_empty(annotations, ANNOTATION_OS_VERSION).unwrap_or_default();
        return (os.to_string(), version.to_string());
    }

    if let Some(os) = non_empty(annotations, KEY_GENERIC_OS).or_else(|| non_empty(labels, KEY_GENERIC_OS)) {
        return match os_family(os, OS_FAMILIES) {
            Some((family, rest)) => (family.to_string(), rest.trim_matches('-').to_string()),
            None => (os.to_string(), String::new()),
        };
    }

    let os_label = labels
        .iter()
        .find(|(k, v)| k.starts_with(LABEL_OS_PREFIX) && v.as_str() == "true")
        .map(|(k, _)| k[LABEL_OS_PREFIX.len()..].replace('_', ""));
    if let Some(suffix) = os_label {
        let table: Vec<(&str, &'static str)> =
            OS_FAMILIES.iter().chain(OS_LABEL_ALIASES).copied().collect();
        return match os_family(&suffix, &table) {
            Some((family, rest)) => (family.to_string(), rest),
            None => (suffix, String::new()),
        };
    }

    if let Some((family, _)) = os_family(name, OS_FAMILIES) {
        return (family.to_string(), String::new());
    }

    (DEFAULT_OS.to_string(), String::new())
}

/// CPU/memory flavor, first match wins
pub fn resolve_flavor(name: &str, labels: &BTreeMap<String, String>) -> Flavor {
    let by_label = FLAVORS
        .iter()
        .find(|(flavor, _)| is_true(labels, &format!("{}{}", LABEL_FLAVOR_PREFIX, flavor)));
    if let Some((_, flavor)) = by_label {
        return *flavor;
    }

    let lower = name.to_lowercase();
    FLAVORS
        .iter()
        .find(|(flavor, _)| lower.contains(flavor))
        .map(|(_, flavor)| *flavor)
        .unwrap_or(DEFAULT_FLAVOR)
}

/// Root disk size requested by the first embedded VirtualMachine
pub fn resolve_disk_size(objects: &[Value]) -> String {
    objects
        .iter()
        .map(Document::new)
        .filter(|doc| doc.str(&["kind"]) == Some("VirtualMachine"))
        .flat_map(|doc| doc.array(&["spec", "dataVolumeTemplates"]).iter())
        .find_map(|dv| {
            let dv = Document::new(dv);
            dv.non_empty_str(&["spec", "storage", "resources", "requests", "storage"])
                .or_else(|| dv.non_empty_str(&["spec", "pvc", "resources", "requests", "storage"]))
        })
        // placeholders are only resolved at materialization time
        .filter(|size| !size.contains("${"))
        .unwrap_or(DEFAULT_DISK_SIZE)
        .to_string()
}

/// Image reference, explicit annotation before container disks
pub fn resolve_image(annotations: &BTreeMap<String, String>) -> Option<String> {
    non_empty(annotations, ANNOTATION_IMAGE)
        .map(str::to_string)
        .or_else(|| {
            non_empty(annotations, ANNOTATION_CONTAINER_DISKS).and_then(|disks| {
                disks
                    .split(['\n', ','])
                    .map(str::trim)
                    .find(|d| !d.is_empty())
                    .map(str::to_string)
            })
        })
}

/// Icon class: explicit annotation, then tags, then name
pub fn resolve_icon(name: &str, annotations: &BTreeMap<String, String>) -> String {
    if let Some(icon) = non_empty(annotations, ANNOTATION_ICON_CLASS) {
        return icon.to_string();
    }
    let lookup = |haystack: &str| {
        let lower = haystack.to_lowercase();
        ICONS
            .iter()
            .find(|(needle, _)| lower.contains(needle))
            .map(|(_, icon)| (*icon).to_string())
    };
    non_empty(annotations, ANNOTATION_TAGS)
        .and_then(lookup)
        .or_else(|| lookup(name))
        .unwrap_or_else(|| DEFAULT_ICON.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Story: an explicit display name beats every other source
    #[test]
    fn story_display_name_annotation_wins() {
        let annotations = map(&[
            (ANNOTATION_DISPLAY_NAME, "Fedora Server"),
            (ANNOTATION_LONG_DESCRIPTION, "Short text"),
            ("name.os.template.kubevirt.io/fedora40", "Fedora 40"),
        ]);
        assert_eq!(
            resolve_display_name("fedora-server-small", &annotations),
            "Fedora Server"
        );
    }

    #[test]
    fn test_display_name_fallbacks() {
        let os = map(&[("name.os.template.kubevirt.io/rhel9.2", "Red Hat Enterprise Linux 9.2")]);
        assert_eq!(resolve_display_name("x", &os), "Red Hat Enterprise Linux 9.2");

        let short = map(&[(ANNOTATION_LONG_DESCRIPTION, "Tiny web box")]);
        assert_eq!(resolve_display_name("x", &short), "Tiny web box");

        let long_text = "x".repeat(80);
        let long = map(&[(ANNOTATION_LONG_DESCRIPTION, long_text.as_str())]);
        assert_eq!(resolve_display_name("web-server", &long), "Web Server VM");
    }

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("rhel9-server-small"), "Rhel9 Server Small VM");
        assert_eq!(clean_name("RHEL-server"), "RHEL Server VM");
        assert_eq!(clean_name("ubuntu-vm"), "Ubuntu VM");
        assert_eq!(clean_name("windows_2022-desktop"), "Windows 2022 Desktop VM");
        assert_eq!(clean_name(""), "VM");
    }

    #[test]
    fn test_os_dedicated_annotations() {
        let annotations = map(&[(ANNOTATION_OS_NAME, "Fedora"), (ANNOTATION_OS_VERSION, "40")]);
        assert_eq!(
            resolve_os("centos-x", &annotations, &BTreeMap::new()),
            ("Fedora".to_string(), "40".to_string())
        );
    }

    #[test]
    fn test_os_generic_key_and_labels() {
        let labels = map(&[(KEY_GENERIC_OS, "rhel9")]);
        assert_eq!(
            resolve_os("x", &BTreeMap::new(), &labels),
            ("RHEL".to_string(), "9".to_string())
        );

        let labels = map(&[("os.template.kubevirt.io/win2k22", "true")]);
        assert_eq!(
            resolve_os("x", &BTreeMap::new(), &labels),
            ("Windows".to_string(), "2k22".to_string())
        );

        let labels = map(&[("os.template.kubevirt.io/ubuntu22_04", "true")]);
        assert_eq!(
            resolve_os("x", &BTreeMap::new(), &labels),
            ("Ubuntu".to_string(), "2204".to_string())
        );

        let labels = map(&[("os.template.kubevirt.io/fedora", "false")]);
        assert_eq!(resolve_os("x", &BTreeMap::new(), &labels).0, "Linux");
    }

    #[test]
    fn test_os_name_heuristic_and_default() {
        let none = BTreeMap::new();
        assert_eq!(resolve_os("centos-stream9", &none, &none).0, "CentOS");
        assert_eq!(resolve_os("my-windows-box", &none, &none).0, "Windows");
        assert_eq!(resolve_os("alpine", &none, &none).0, "Linux");
    }

    #[test]
    fn test_flavor_resolution() {
        let labels = map(&[("flavor.template.kubevirt.io/large", "true")]);
        assert_eq!(resolve_flavor("tiny-box", &labels), Flavor { cpu: 2, memory: "8Gi" });
        assert_eq!(
            resolve_flavor("fedora-medium", &BTreeMap::new()),
            Flavor { cpu: 1, memory: "4Gi" }
        );
        assert_eq!(resolve_flavor("fedora", &BTreeMap::new()), DEFAULT_FLAVOR);
    }

    #[test]
    fn test_disk_from_embedded_vm() {
        let objects = vec![
            json!({"kind": "Secret"}),
            json!({"kind": "VirtualMachine", "spec": {"dataVolumeTemplates": [
                {"spec": {"storage": {"resources": {"requests": {"storage": "50Gi"}}}}}
            ]}}),
        ];
        assert_eq!(resolve_disk_size(&objects), "50Gi");

        let templated = vec![json!({"kind": "VirtualMachine", "spec": {"dataVolumeTemplates": [
            {"spec": {"pvc": {"resources": {"requests": {"storage": "${DISK_SIZE}"}}}}}
        ]}})];
        assert_eq!(resolve_disk_size(&templated), DEFAULT_DISK_SIZE);
        assert_eq!(resolve_disk_size(&[]), DEFAULT_DISK_SIZE);
    }

    #[test]
    fn test_image_resolution() {
        let annotations = map(&[
            (ANNOTATION_CONTAINER_DISKS, "quay.io/containerdisks/fedora:40\nquay.io/x:1"),
        ]);
        assert_eq!(
            resolve_image(&annotations).as_deref(),
            Some("quay.io/containerdisks/fedora:40")
        );

        let annotations = map(&[
            (ANNOTATION_IMAGE, "registry.local/golden/rhel9:latest"),
            (ANNOTATION_CONTAINER_DISKS, "quay.io/x:1"),
        ]);
        assert_eq!(
            resolve_image(&annotations).as_deref(),
            Some("registry.local/golden/rhel9:latest")
        );
        assert!(resolve_image(&BTreeMap::new()).is_none());
    }

    #[test]
    fn test_icon_resolution() {
        let explicit = map(&[(ANNOTATION_ICON_CLASS, "icon-custom"), (ANNOTATION_TAGS, "fedora")]);
        assert_eq!(resolve_icon("rhel", &explicit), "icon-custom");

        let tags = map(&[(ANNOTATION_TAGS, "hidden,kubevirt,virtualmachine,linux,centos")]);
        assert_eq!(resolve_icon("rhel9", &tags), "icon-centos");

        assert_eq!(resolve_icon("ubuntu-server", &BTreeMap::new()), "icon-ubuntu");
        assert_eq!(resolve_icon("alpine", &BTreeMap::new()), DEFAULT_ICON);
    }
}
