//! Deterministic cache keys.
//!
//! Keys are SHA-256 hex digests over a canonical JSON rendering in which object
//! keys are sorted at every depth, so structurally equal values hash equally no
//! matter how their fields were ordered on the wire. Each key family mixes in
//! its own domain tag so a context key can never collide with a query key.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use chartdata_error::Result;

use crate::query_context::{QueryContext, QueryObject, ResultType};

const CONTEXT_DOMAIN: &str = "chartdata:context:v1";
const QUERY_DOMAIN: &str = "chartdata:query:v1";

/// Key under which a whole (raw) query context is cached.
///
/// `force` only affects how a request is served, so it is left out.
pub fn context_key(context: &QueryContext) -> Result<String> {
    let mut value = serde_json::to_value(context)?;
    if let Value::Object(map) = &mut value {
        map.remove("force");
    }
    Ok(digest(CONTEXT_DOMAIN, &value))
}

/// Key under which one query object's result is cached.
pub fn query_key(datasource_id: i64, query: &QueryObject, result_type: ResultType) -> Result<String> {
    #[derive(Serialize)]
    struct QueryKeyInput<'a> {
        datasource: i64,
        query: &'a QueryObject,
        result_type: ResultType,
    }

    let value = serde_json::to_value(QueryKeyInput {
        datasource: datasource_id,
        query,
        result_type,
    })?;
    Ok(digest(QUERY_DOMAIN, &value))
}

/// SHA-256 over `domain` and the canonical form of `value`.
pub fn digest(domain: &str, value: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Canonical JSON text: sorted object keys, no insignificant whitespace.
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
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(val, out);
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
