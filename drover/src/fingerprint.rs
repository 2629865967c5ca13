//! Idempotency fingerprints for submitted jobs.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex SHA-256 over `job_type`, a newline, and the canonical JSON of `payload`.
///
/// Object keys are sorted at every depth, so two payloads differing only in
/// key order produce the same key.
pub fn idempotency_key(job_type: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_json(payload).as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialize `value` with object keys sorted recursively and no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Serializing a string cannot fail.
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
