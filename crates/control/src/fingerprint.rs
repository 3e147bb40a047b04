//! Deterministic fingerprints of calculation inputs.
//!
//! A fingerprint is the hex SHA-256 of a resource identity plus a canonical
//! rendering of the inputs:
//!
//! - object keys are sorted
//! - integral numbers print without a fractional part (`1.0` → `1`)
//! - other numbers print in shortest round-trip form
//! - strings that parse as finite numbers are treated as numbers
//!   (`"1.0"` ≡ `1`)
//!
//! Logically equal inputs therefore share a cache key regardless of key
//! order or number formatting.

use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

use crate::compute::Values;

const DOMAIN_TAG: &[u8] = b"calcplane.fingerprint.v1\0";

/// Largest magnitude at which every integer is exactly representable in f64.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Hex-encoded SHA-256 cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Fingerprints `inputs` evaluated against `resource_key`.
#[must_use]
pub fn fingerprint(resource_key: &str, inputs: &Values) -> Fingerprint {
    let mut canonical = String::new();
    write_object(inputs, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_TAG);
    hasher.update(resource_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Canonical text form of `value`.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(n, out),
        Value::String(s) => match parse_numeric(s) {
            Some(f) => write_f64(f, out),
            None => write_string(s, out),
        },
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        },
        Value::Object(map) => write_object(map, out),
    }
}

fn write_object(map: &Values, out: &mut String) {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

    out.push('{');
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(key, out);
        out.push(':');
        write_value(value, out);
    }
    out.push('}');
}

fn write_string(s: &str, out: &mut String) {
    // Display on a JSON string value yields its escaped, quoted form.
    let _ = write!(out, "{}", Value::from(s));
}

fn write_number(n: &Number, out: &mut String) {
    if let Some(i) = n.as_i64() {
        let _ = write!(out, "{i}");
    } else if let Some(u) = n.as_u64() {
        let _ = write!(out, "{u}");
    } else if let Some(f) = n.as_f64() {
        write_f64(f, out);
    }
}

fn write_f64(f: f64, out: &mut String) {
    if f.fract() == 0.0 && f.abs() < MAX_SAFE_INTEGER {
        let _ = write!(out, "{}", f as i64);
    } else {
        let _ = write!(out, "{f}");
    }
}

fn parse_numeric(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    if !trimmed.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|f| f.is_finite())
}
