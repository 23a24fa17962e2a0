//! Normalize candidate signatures into stable key/value pairs for
//! fingerprinting.
//!
//! Repeated occurrences of "the same" condition must collapse to one dedup
//! key, so volatile fields (timestamps, free text) are stripped and the rest
//! is flattened, lowercased, and sorted.

use serde_json::Value;

use crate::config::Config;
use crate::error::EngineError;
use crate::types::Candidate;

/// Validate a candidate and reduce its signature to sorted `(key, value)`
/// pairs suitable for hashing.
///
/// Rejects non-object signatures and signatures with no stable fields left
/// after stripping — both would collapse unrelated conditions into one key.
pub fn normalize_signature(
  candidate: &Candidate,
  config: &Config,
) -> Result<Vec<(String, String)>, EngineError> {
  if candidate.source_module.is_empty() {
    return Err(EngineError::InvalidSignature("source_module must not be empty".into()));
  }
  if candidate.source_record_id.is_empty() {
    return Err(EngineError::InvalidSignature("source_record_id must not be empty".into()));
  }

  let obj = match &candidate.signature {
    Value::Object(map) => map,
    other => {
      return Err(EngineError::InvalidSignature(format!(
        "signature must be a JSON object, got {}",
        json_type_name(other)
      )))
    }
  };

  let mut pairs = Vec::new();
  for (key, value) in obj {
    flatten(&normalize_key(key), value, config, &mut pairs);
  }
  if pairs.is_empty() {
    return Err(EngineError::InvalidSignature(
      "signature has no stable fields after stripping volatile keys".into(),
    ));
  }
  pairs.sort();
  Ok(pairs)
}

/// Depth-first flatten: nested objects become dotted keys, scalar arrays keep
/// their order, nulls and volatile keys are dropped.
fn flatten(key: &str, value: &Value, config: &Config, out: &mut Vec<(String, String)>) {
  let leaf = key.rsplit('.').next().unwrap_or(key);
  if config.volatile_signature_keys.contains(leaf) {
    return;
  }
  match value {
    Value::Null => {}
    Value::Bool(b) => out.push((key.to_string(), b.to_string())),
    Value::Number(n) => out.push((key.to_string(), n.to_string())),
    Value::String(s) => {
      let trimmed = s.trim().to_ascii_lowercase();
      if !trimmed.is_empty() {
        out.push((key.to_string(), trimmed));
      }
    }
    Value::Array(items) => {
      let rendered: Vec<String> = items
        .iter()
        .filter_map(|v| match v {
          Value::Bool(b) => Some(b.to_string()),
          Value::Number(n) => Some(n.to_string()),
          Value::String(s) => Some(s.trim().to_ascii_lowercase()),
          _ => None,
        })
        .collect();
      if !rendered.is_empty() {
        out.push((key.to_string(), rendered.join(",")));
      }
    }
    Value::Object(map) => {
      for (child_key, child) in map {
        let nested = format!("{}.{}", key, normalize_key(child_key));
        flatten(&nested, child, config, out);
      }
    }
  }
}

/// Lowercase and collapse camelCase to snake_case so `breakType` and
/// `break_type` land on the same key.
fn normalize_key(key: &str) -> String {
  let mut out = String::with_capacity(key.len());
  for ch in key.trim().chars() {
    if ch.is_ascii_uppercase() {
      if !out.is_empty() && !out.ends_with('_') {
        out.push('_');
      }
      out.push(ch.to_ascii_lowercase());
    } else {
      out.push(ch);
    }
  }
  out
}

fn json_type_name(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "bool",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}
