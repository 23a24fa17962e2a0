//! Audit events emitted by every mutation, consumed by the system-wide audit
//! log (an external collaborator — only the record shape is fixed here).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;

use crate::types::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditCollection {
  #[serde(rename = "exceptions")]
  Exceptions,
  #[serde(rename = "exceptionClusters")]
  ExceptionClusters,
}

/// One audit record: what happened, to which record, by whom.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
  /// Dotted action tag, e.g. `exception.created`, `exception.sla_breached`.
  pub action: String,
  pub collection: AuditCollection,
  pub record_id: String,
  /// Human-readable old -> new summary of the changed field(s).
  pub summary: String,
  pub actor_id: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub severity: Option<Severity>,
  pub created_at: DateTime<Utc>,
}

impl AuditEvent {
  pub fn exception(
    action: &str,
    record_id: impl Into<String>,
    summary: impl Into<String>,
    actor_id: &str,
    severity: Severity,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      action: action.to_string(),
      collection: AuditCollection::Exceptions,
      record_id: record_id.into(),
      summary: summary.into(),
      actor_id: actor_id.to_string(),
      severity: Some(severity),
      created_at: now,
    }
  }

  pub fn cluster(
    action: &str,
    record_id: impl Into<String>,
    summary: impl Into<String>,
    actor_id: &str,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      action: action.to_string(),
      collection: AuditCollection::ExceptionClusters,
      record_id: record_id.into(),
      summary: summary.into(),
      actor_id: actor_id.to_string(),
      severity: None,
      created_at: now,
    }
  }
}

/// Where committed audit events go. Events are recorded only after the
/// winning write, so a retried compare-and-swap never double-records.
pub trait AuditSink: Send + Sync {
  fn record(&self, event: AuditEvent);
}

/// In-memory sink for tests and embedded use.
#[derive(Default)]
pub struct MemoryAuditSink {
  events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn events(&self) -> Vec<AuditEvent> {
    self.events.lock().unwrap().clone()
  }

  pub fn actions(&self) -> Vec<String> {
    self.events.lock().unwrap().iter().map(|e| e.action.clone()).collect()
  }
}

impl AuditSink for MemoryAuditSink {
  fn record(&self, event: AuditEvent) {
    self.events.lock().unwrap().push(event);
  }
}

/// Writes each event as a JSON line to stderr; used by the binary.
#[derive(Default)]
pub struct StderrAuditSink;

impl AuditSink for StderrAuditSink {
  fn record(&self, event: AuditEvent) {
    if let Ok(line) = serde_json::to_string(&event) {
      eprintln!("{}", line);
    }
  }
}
