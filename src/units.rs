//! Kubernetes resource quantity helpers
//!
//! Only the subset of the quantity grammar that VM sizing uses: integer or
//! decimal numbers with binary (`Ki`..`Pi`), decimal (`k`..`P`) or milli (`m`)
//! suffixes.

use crate::Error;

/// Bytes in one GiB
pub const GIB: u64 = 1024 * 1024 * 1024;

const MIB: u64 = 1024 * 1024;

/// Suffix multipliers, longest suffixes first so `Mi` wins over `M`.
const BYTE_SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1024.0 * 1024.0),
    ("Gi", 1024.0 * 1024.0 * 1024.0),
    ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("k", 1e3),
    ("K", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
];

fn parse_number(number: &str, original: &str) -> Result<f64, Error> {
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| Error::validation(format!("invalid quantity: {:?}", original)))?;
    if !value.is_finite() || value < 0.0 {
        return Err(Error::validation(format!(
            "quantity must be a non-negative number: {:?}",
            original
        )));
    }
    Ok(value)
}

/// Parse a memory/storage quantity such as `4Gi`, `512Mi` or `1.5Gi` into bytes
pub fn parse_quantity_bytes(quantity: &str) -> Result<u64, Error> {
    let q = quantity.trim();
    if q.is_empty() {
        return Err(Error::validation("empty quantity"));
    }

    for (suffix, multiplier) in BYTE_SUFFIXES {
        if let Some(number) = q.strip_suffix(suffix) {
            let value = parse_number(number, quantity)?;
            return Ok((value * multiplier).round() as u64);
        }
    }

    Ok(parse_number(q, quantity)?.round() as u64)
}

/// Parse a CPU quantity (`2`, `1.5`, `500m`) into milli-cores
pub fn parse_cpu_millis(quantity: &str) -> Result<u64, Error> {
    let q = quantity.trim();
    if let Some(millis) = q.strip_suffix('m') {
        return Ok(parse_number(millis, quantity)?.round() as u64);
    }
    Ok((parse_number(q, quantity)? * 1000.0).round() as u64)
}

/// Render milli-cores as whole cores when exact, otherwise as `<n>m`
pub fn format_cpu(millis: u64) -> String {
    if millis % 1000 == 0 {
        (millis / 1000).to_string()
    } else {
        format!("{}m", millis)
    }
}

/// Render a GiB count as a binary quantity
pub fn format_gib(gib: u64) -> String {
    format!("{}Gi", gib)
}

/// Render bytes using the largest exact binary unit (Gi, Mi, or bytes)
pub fn format_bytes(bytes: u64) -> String {
    if bytes > 0 && bytes % GIB == 0 {
        format!("{}Gi", bytes / GIB)
    } else if bytes > 0 && bytes % MIB == 0 {
        format!("{}Mi", bytes / MIB)
    } else {
        bytes.to_string()
    }
}
