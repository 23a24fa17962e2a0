//! Engine configuration with sane defaults: routing table, SLA table,
//! auto-closable categories, signature normalization knobs.

use std::collections::{HashMap, HashSet};

use crate::error::EngineError;
use crate::types::Severity;

/// Tunable tables for routing, SLA timing, and auto-close.
#[derive(Debug, Clone)]
pub struct Config {
  /// category -> default owning role for newly routed exceptions.
  pub routing: HashMap<String, String>,
  /// (category, severity) -> hours until SLA breach. Missing entries fall
  /// back to `default_sla_hours`.
  pub sla_hours: HashMap<(String, Severity), i64>,
  pub default_sla_hours: i64,
  /// Categories the engine may close without a human once the source clears.
  pub auto_close_categories: HashSet<String>,
  /// Signature keys stripped before fingerprinting (timestamps, free text).
  pub volatile_signature_keys: HashSet<String>,
  /// Bounded retry count for compare-and-swap writes.
  pub max_write_attempts: u32,
}

impl Config {
  /// Default role for a category, or `UnknownCategory` — the routing table is
  /// the category taxonomy, so an unrouted category is an invalid ingest.
  pub fn default_role(&self, category: &str) -> Result<&str, EngineError> {
    self
      .routing
      .get(category)
      .map(String::as_str)
      .ok_or_else(|| EngineError::UnknownCategory(category.to_string()))
  }

  pub fn sla_hours(&self, category: &str, severity: Severity) -> i64 {
    self
      .sla_hours
      .get(&(category.to_string(), severity))
      .copied()
      .unwrap_or(self.default_sla_hours)
  }

  pub fn is_auto_closable(&self, category: &str) -> bool {
    self.auto_close_categories.contains(category)
  }
}

impl Default for Config {
  fn default() -> Self {
    let routing: HashMap<String, String> = [
      ("data_quality", "data_steward"),
      ("reconciliation", "ops_analyst"),
      ("compliance", "compliance_officer"),
      ("workflow_failure", "platform_engineer"),
    ]
    .into_iter()
    .map(|(c, r)| (c.to_string(), r.to_string()))
    .collect();

    let mut sla_hours = HashMap::new();
    for category in routing.keys() {
      sla_hours.insert((category.clone(), Severity::Critical), 4);
      sla_hours.insert((category.clone(), Severity::Warning), 24);
      sla_hours.insert((category.clone(), Severity::Ok), 72);
    }
    // Compliance flags get a tighter clock at every level.
    sla_hours.insert(("compliance".to_string(), Severity::Critical), 2);
    sla_hours.insert(("compliance".to_string(), Severity::Warning), 8);

    let auto_close_categories: HashSet<String> =
      ["data_quality", "reconciliation", "workflow_failure"]
        .into_iter()
        .map(str::to_string)
        .collect();

    let volatile_signature_keys: HashSet<String> = [
      "timestamp", "time", "ts", "observed_at", "raised_at", "created_at",
      "updated_at", "message", "detail", "details", "description", "note",
      "notes", "free_text", "text",
    ]
    .into_iter()
    .map(str::to_string)
    .collect();

    Self {
      routing,
      sla_hours,
      default_sla_hours: 48,
      auto_close_categories,
      volatile_signature_keys,
      max_write_attempts: 3,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn known_categories_route() {
    let config = Config::default();
    assert_eq!(config.default_role("reconciliation").unwrap(), "ops_analyst");
    assert_eq!(config.default_role("compliance").unwrap(), "compliance_officer");
  }

  #[test]
  fn unknown_category_is_rejected() {
    let config = Config::default();
    let err = config.default_role("mystery").unwrap_err();
    assert!(err.to_string().contains("mystery"));
  }

  #[test]
  fn sla_table_and_fallback() {
    let config = Config::default();
    assert_eq!(config.sla_hours("compliance", Severity::Critical), 2);
    assert_eq!(config.sla_hours("reconciliation", Severity::Warning), 24);
    // Unknown pairs fall back rather than panicking.
    assert_eq!(config.sla_hours("mystery", Severity::Warning), 48);
  }

  #[test]
  fn compliance_is_not_auto_closable_by_default() {
    let config = Config::default();
    assert!(config.is_auto_closable("reconciliation"));
    assert!(!config.is_auto_closable("compliance"));
  }
}
