//! DNS label sanitization for generated object names

use crate::Error;

/// Name used when sanitization leaves nothing
pub const DEFAULT_NAME: &str = "vm";

/// Maximum length of a DNS label
pub const MAX_NAME_LEN: usize = 63;

/// Turn arbitrary input into a valid DNS label
///
/// Lowercases, maps anything outside `[a-z0-9-]` to `-`, collapses runs of
/// `-`, trims `-` from both ends and truncates to 63 characters. Never fails:
/// input that sanitizes to nothing yields [`DEFAULT_NAME`].
pub fn sanitize_name(input: &str) -> String {
    let mut name = String::with_capacity(input.len().min(MAX_NAME_LEN));
    for c in input.chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && (name.is_empty() || name.ends_with('-')) {
            continue;
        }
        name.push(c);
    }

    // output is ASCII, so byte truncation is char-safe
    name.truncate(MAX_NAME_LEN);
    let trimmed = name.trim_end_matches('-');

    if trimmed.is_empty() {
        DEFAULT_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Check that `id` can be used as a VM id
///
/// A VM id is the object name, the registry key and the `vdc.dev/vm-id`
/// label value at once, so it must already be a DNS label; callers sanitize
/// user input before it becomes an id.
pub fn validate_vm_id(id: &str) -> Result<(), Error> {
    if !id.is_empty() && sanitize_name(id) == id {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "VM id {:?} is not a DNS label (try {:?})",
            id,
            sanitize_name(id)
        )))
    }
}
