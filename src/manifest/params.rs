//! Template parameter binding and placeholder substitution
//!
//! Substitution walks the parsed document and rewrites string values (and
//! object keys) in a single left-to-right pass. Replacement text is never
//! re-scanned, so a parameter whose value looks like `${OTHER}` stays
//! literal, and values never need JSON escaping.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{Map, Value};

use crate::catalog::TemplateParameter;
use crate::Error;

/// `generate` value that requests a random value from the `from` pattern
pub const GENERATE_EXPRESSION: &str = "expression";

/// Upper bound on a single `{n}` repeat count
const MAX_REPEAT: usize = 255;

const WORD_CHARS: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_";
const DIGIT_CHARS: &str = "0123456789";
const ALPHA_CHARS: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const SYMBOL_CHARS: &str = "~!@#$%^&*()-_+={}[]\\|<,>.?/\"';:`";

/// Resolve every declared parameter to a value
///
/// Precedence: caller override, declared value, generated value. A required
/// parameter that ends up empty is a materialization error; optional ones
/// bind to the empty string. Overrides for undeclared names are bound too.
pub fn bind_parameters<R: Rng + ?Sized>(
    template_id: &str,
    declared: &[TemplateParameter],
    overrides: &BTreeMap<String, String>,
    rng: &mut R,
) -> Result<BTreeMap<String, String>, Error> {
    let mut bound = BTreeMap::new();

    for param in declared {
        let value = match overrides.get(&param.name) {
            Some(v) => v.clone(),
            None => match param.value.as_deref().filter(|v| !v.is_empty()) {
                Some(v) => v.to_string(),
                None if param.generate.as_deref() == Some(GENERATE_EXPRESSION) => {
                    let pattern = param.from.as_deref().unwrap_or_default();
                    generate_from_expression(pattern, rng).map_err(|e| {
                        Error::materialization(
                            "Template",
                            template_id,
                            format!("parameter {}: {}", param.name, e),
                        )
                    })?
                }
                None => String::new(),
            },
        };

        if param.required && value.is_empty() {
            return Err(Error::materialization(
                "Template",
                template_id,
                format!("required parameter {} has no value", param.name),
            ));
        }
        bound.insert(param.name.clone(), value);
    }

    for (name, value) in overrides {
        bound
            .entry(name.clone())
            .or_insert_with(|| value.clone());
    }

    Ok(bound)
}

/// Characters a backslash class stands for
fn escape_class(c: char) -> Option<&'static str> {
    match c {
        'w' => Some(WORD_CHARS),
        'd' => Some(DIGIT_CHARS),
        'a' => Some(ALPHA_CHARS),
        'A' => Some(SYMBOL_CHARS),
        _ => None,
    }
}

/// Expand a bracket body like `a-zA-Z0-9\d` into its characters
fn parse_charset(body: &str) -> Result<Vec<char>, String> {
    let chars: Vec<char> = body.chars().collect();
    let mut set = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' && i + 1 < chars.len() {
            match escape_class(chars[i + 1]) {
                Some(class) => set.extend(class.chars()),
                None => set.push(chars[i + 1]),
            }
            i += 2;
        } else if i + 2 < chars.len() && chars[i + 1] == '-' {
            let (lo, hi) = (c, chars[i + 2]);
            if lo > hi {
                return Err(format!("invalid range {}-{}", lo, hi));
            }
            set.extend(lo..=hi);
            i += 3;
        } else {
            set.push(c);
            i += 1;
        }
    }
    set.sort_unstable();
    set.dedup();
    if set.is_empty() {
        return Err("empty character class".to_string());
    }
    Ok(set)
}

/// Read an optional `{n}` quantifier at the start of `rest`
fn parse_repeat(rest: &str) -> Result<(usize, usize), String> {
    let Some(body) = rest.strip_prefix('{') else {
        return Ok((1, 0));
    };
    let end = body
        .find('}')
        .ok_or_else(|| "unterminated repeat count".to_string())?;
    let count: usize = body[..end]
        .parse()
        .map_err(|_| format!("invalid repeat count {:?}", &body[..end]))?;
    if count > MAX_REPEAT {
        return Err(format!("repeat count {} exceeds {}", count, MAX_REPEAT));
    }
    Ok((count, end + 2))
}

/// Generate a random value from an expression like `[a-z0-9]{8}`
///
/// Supports bracket classes with ranges, the `\w \d \a \A` classes, literal
/// characters and `{n}` repeat counts.
pub fn generate_from_expression<R: Rng + ?Sized>(pattern: &str, rng: &mut R) -> Result<String, String> {
    if pattern.is_empty() {
        return Err("empty generator expression".to_string());
    }

    let mut out = String::new();
    let mut rest = pattern;
    while let Some(c) = rest.chars().next() {
        let (set, consumed): (Vec<char>, usize) = match c {
            '[' => {
                let end = rest
                    .find(']')
                    .ok_or_else(|| "unterminated character class".to_string())?;
                (parse_charset(&rest[1..end])?, end + 1)
            }
            '\\' => {
                let next = rest[1..]
                    .chars()
                    .next()
                    .ok_or_else(|| "dangling escape".to_string())?;
                let set = match escape_class(next) {
                    Some(class) => class.chars().collect(),
                    None => vec![next],
                };
                (set, 1 + next.len_utf8())
            }
            literal => (vec![literal], literal.len_utf8()),
        };
        rest = &rest[consumed..];

        let (count, consumed) = parse_repeat(rest)?;
        rest = &rest[consumed..];
        for _ in 0..count {
            if let Some(ch) = set.choose(rng) {
                out.push(*ch);
            }
        }
    }
    Ok(out)
}

fn is_param_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Replace `${NAME}` and `${{NAME}}` references inside one string
///
/// Unknown or malformed references are kept verbatim.
pub fn substitute_str(input: &str, params: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let (name, tail) = match after.strip_prefix('{') {
            Some(inner) => match inner.find("}}") {
                Some(end) => (&inner[..end], &inner[end + 2..]),
                None => ("", after),
            },
            None => match after.find('}') {
                Some(end) => (&after[..end], &after[end + 1..]),
                None => ("", after),
            },
        };

        match params.get(name).filter(|_| is_param_name(name)) {
            Some(value) => {
                out.push_str(value);
                rest = tail;
            }
            None => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Substitute parameters throughout a parsed document
///
/// A string that is exactly `${{NAME}}` becomes the parameter parsed as JSON
/// (so `"${{REPLICAS}}"` can yield the number `3`), falling back to a string.
pub fn substitute(value: &Value, params: &BTreeMap<String, String>) -> Value {
    match value {
        Value::String(s) => {
            let typed = s
                .strip_prefix("${{")
                .and_then(|r| r.strip_suffix("}}"))
                .filter(|name| is_param_name(name))
                .and_then(|name| params.get(name));
            match typed {
                Some(raw) => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone())),
                None => Value::String(substitute_str(s, params)),
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, params)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (substitute_str(k, params), substitute(v, params)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn param(name: &str) -> TemplateParameter {
        TemplateParameter {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_substitute_inside_strings() {
        let p = params(&[("NAME", "web-1"), ("NAMESPACE", "acme")]);
        assert_eq!(substitute_str("${NAME}-disk", &p), "web-1-disk");
        assert_eq!(substitute_str("${NAMESPACE}/${NAME}", &p), "acme/web-1");
        assert_eq!(substitute_str("no refs", &p), "no refs");
    }

    /// Story: a value that looks like a placeholder is never expanded again
    #[test]
    fn story_replacement_is_single_pass() {
        let p = params(&[("NAME", "${PASSWORD}"), ("PASSWORD", "hunter2")]);
        assert_eq!(substitute_str("vm-${NAME}", &p), "vm-${PASSWORD}");
    }

    #[test]
    fn test_values_need_no_escaping() {
        let p = params(&[("MOTD", "say \"hi\"\n")]);
        let out = substitute(&json!({"data": {"motd": "${MOTD}"}}), &p);
        assert_eq!(out["data"]["motd"], "say \"hi\"\n");
    }

    #[test]
    fn test_unknown_and_malformed_refs_kept() {
        let p = params(&[("NAME", "x")]);
        assert_eq!(substitute_str("${OTHER}", &p), "${OTHER}");
        assert_eq!(substitute_str("${NAME", &p), "${NAME");
        assert_eq!(substitute_str("$${NAME}", &p), "$x");
        assert_eq!(substitute_str("${na me}", &p), "${na me}");
    }

    #[test]
    fn test_typed_substitution() {
        let p = params(&[("REPLICAS", "3"), ("ENABLED", "true"), ("LABEL", "abc")]);
        let doc = json!({"replicas": "${{REPLICAS}}", "on": "${{ENABLED}}", "l": "${{LABEL}}", "s": "n=${{REPLICAS}}"});
        let out = substitute(&doc, &p);
        assert_eq!(out["replicas"], json!(3));
        assert_eq!(out["on"], json!(true));
        assert_eq!(out["l"], json!("abc"));
        assert_eq!(out["s"], json!("n=3"));
    }

    #[test]
    fn test_keys_and_arrays_substituted() {
        let p = params(&[("NAME", "web")]);
        let out = substitute(&json!({"${NAME}-key": ["${NAME}", 1, null]}), &p);
        assert_eq!(out, json!({"web-key": ["web", 1, null]}));
    }

    #[test]
    fn test_bind_precedence() {
        let mut declared = vec![param("NAME"), param("DISK_SIZE")];
        declared[1].value = Some("30Gi".to_string());
        let overrides = params(&[("NAME", "web-1"), ("NAMESPACE", "acme")]);

        let mut rng = StdRng::seed_from_u64(7);
        let bound = bind_parameters("t", &declared, &overrides, &mut rng).unwrap();
        assert_eq!(bound["NAME"], "web-1");
        assert_eq!(bound["DISK_SIZE"], "30Gi");
        assert_eq!(bound["NAMESPACE"], "acme");
    }

    #[test]
    fn test_generated_parameter() {
        let mut p = param("PASSWORD");
        p.generate = Some("expression".to_string());
        p.from = Some("[a-z0-9]{12}".to_string());

        let mut rng = StdRng::seed_from_u64(42);
        let bound = bind_parameters("t", &[p], &BTreeMap::new(), &mut rng).unwrap();
        let value = &bound["PASSWORD"];
        assert_eq!(value.len(), 12);
        assert!(value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_required_parameter_missing() {
        let mut p = param("CLOUD_USER_PASSWORD");
        p.required = true;
        let mut rng = StdRng::seed_from_u64(1);
        let err = bind_parameters("fedora", &[p], &BTreeMap::new(), &mut rng).unwrap_err();
        assert!(matches!(err, Error::Materialization { .. }));
        assert!(err.to_string().contains("CLOUD_USER_PASSWORD"));
    }

    #[test]
    fn test_expression_forms() {
        let mut rng = StdRng::seed_from_u64(3);
        let v = generate_from_expression("user-\\d{4}", &mut rng).unwrap();
        assert!(v.starts_with("user-"));
        assert_eq!(v.len(), 9);
        assert!(v[5..].chars().all(|c| c.is_ascii_digit()));

        let v = generate_from_expression("[\\a]{6}", &mut rng).unwrap();
        assert!(v.chars().all(|c| c.is_ascii_alphabetic()));

        assert!(generate_from_expression("[a-z", &mut rng).is_err());
        assert!(generate_from_expression("[z-a]{2}", &mut rng).is_err());
        assert!(generate_from_expression("[a]{9999}", &mut rng).is_err());
        assert!(generate_from_expression("", &mut rng).is_err());
    }
}
