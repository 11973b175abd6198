//! Defensive field access over untyped cluster objects
//!
//! Cluster objects arrive as loosely-typed JSON (`DynamicObject`, template
//! payloads). All lookups go through [`Document`], which returns `None` (or an
//! empty collection) for anything missing or of the wrong type, so parsing
//! code never has to unwrap its way through nested maps.

use std::collections::BTreeMap;

use serde_json::Value;

/// Read-only path accessor over a JSON document
#[derive(Clone, Copy, Debug)]
pub struct Document<'a> {
    value: &'a Value,
}

impl<'a> Document<'a> {
    /// Wrap a JSON value
    pub fn new(value: &'a Value) -> Self {
        Self { value }
    }

    /// The wrapped value
    pub fn value(&self) -> &'a Value {
        self.value
    }

    /// True when the root is a JSON object
    pub fn is_object(&self) -> bool {
        self.value.is_object()
    }

    /// Look up a nested field by path segments
    pub fn get(&self, path: &[&str]) -> Option<&'a Value> {
        path.iter()
            .try_fold(self.value, |current, segment| current.get(*segment))
    }

    /// Nested document at `path`, if present
    pub fn child(&self, path: &[&str]) -> Option<Document<'a>> {
        self.get(path).map(Document::new)
    }

    /// String at `path`
    pub fn str(&self, path: &[&str]) -> Option<&'a str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Non-empty string at `path`
    pub fn non_empty_str(&self, path: &[&str]) -> Option<&'a str> {
        self.str(path).filter(|s| !s.is_empty())
    }

    /// Boolean at `path`
    pub fn bool(&self, path: &[&str]) -> Option<bool> {
        self.get(path).and_then(Value::as_bool)
    }

    /// Array at `path`, empty when absent or not an array
    pub fn array(&self, path: &[&str]) -> &'a [Value] {
        self.get(path)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// String-valued map at `path` (labels, annotations); non-string values are skipped
    pub fn string_map(&self, path: &[&str]) -> BTreeMap<String, String> {
        self.get(path)
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_lookup() {
        let v = json!({"status": {"phase": "Running", "ready": true}});
        let doc = Document::new(&v);
        assert_eq!(doc.str(&["status", "phase"]), Some("Running"));
        assert_eq!(doc.bool(&["status", "ready"]), Some(true));
        assert!(doc.get(&["status", "missing"]).is_none());
    }

    #[test]
    fn test_wrong_types_read_as_absent() {
        let v = json!({"status": {"ready": "yes", "interfaces": {"not": "a list"}}});
        let doc = Document::new(&v);
        assert_eq!(doc.bool(&["status", "ready"]), None);
        assert!(doc.array(&["status", "interfaces"]).is_empty());
        assert_eq!(doc.str(&["status", "ready", "deeper"]), None);
    }

    #[test]
    fn test_string_map_skips_non_strings() {
        let v = json!({"metadata": {"annotations": {"a": "1", "b": 2, "openshift.io/display-name": "X"}}});
        let map = Document::new(&v).string_map(&["metadata", "annotations"]);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("openshift.io/display-name").map(String::as_str), Some("X"));
    }

    #[test]
    fn test_non_empty_str() {
        let v = json!({"ip": ""});
        assert_eq!(Document::new(&v).non_empty_str(&["ip"]), None);
    }
}
