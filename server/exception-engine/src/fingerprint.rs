//! Stable dedup key computation for grouping exceptions into clusters.

use crate::types::DedupKey;

/// Compute a stable dedup key from a category and normalized signature pairs.
///
/// Uses blake3 for a fast, deterministic hash; pairs must already be sorted
/// (see [`crate::normalize::normalize_signature`]). Every field is
/// length-prefixed so no byte sequence inside a key or value can shift the
/// field boundaries.
pub fn compute(category: &str, pairs: &[(String, String)]) -> DedupKey {
  let mut hasher = blake3::Hasher::new();
  hasher.update(&(category.len() as u64).to_le_bytes());
  hasher.update(category.as_bytes());
  for (key, value) in pairs {
    hasher.update(&(key.len() as u64).to_le_bytes());
    hasher.update(key.as_bytes());
    hasher.update(&(value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
  }

  let hash = hasher.finalize();
  // First 16 bytes (32 hex chars) for a compact but collision-resistant key.
  let hex = hash.to_hex();
  DedupKey(hex[..32].to_string())
}
