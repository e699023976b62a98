//! Deterministic cache keys.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use serde_json::Value;

use super::{CacheKind, Result};

/// Serialize `value` with object keys sorted at every depth.
///
/// Two descriptors that differ only in key order produce the same string.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
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

/// `{kind}:{base64(canonical_json(descriptor))}`
pub fn logical_key<D: Serialize + ?Sized>(kind: CacheKind, descriptor: &D) -> Result<String> {
    let value = serde_json::to_value(descriptor)?;
    Ok(format!(
        "{}:{}",
        kind.prefix(),
        STANDARD.encode(canonical_json(&value))
    ))
}

/// Dependency index set for `tag`: `{kind}:table:{tag}`.
pub fn dependency_key(kind: CacheKind, tag: &str) -> String {
    format!("{}:table:{}", kind.prefix(), tag)
}
