//! Core types for the exception engine (JSON contracts + internal models).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers (opaque, immutable)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExceptionId(pub String);

impl ExceptionId {
  pub fn mint() -> Self {
    Self(format!("exc-{}", Uuid::new_v4().simple()))
  }
}

impl std::fmt::Display for ExceptionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterId(pub String);

impl ClusterId {
  pub fn mint() -> Self {
    Self(format!("clu-{}", Uuid::new_v4().simple()))
  }
}

impl std::fmt::Display for ClusterId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
  pub fn mint() -> Self {
    Self(format!("step-{}", Uuid::new_v4().simple()))
  }
}

impl std::fmt::Display for StepId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

/// A stable hex string identifying a unique dedup group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey(pub String);

impl std::fmt::Display for DedupKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

// ---------------------------------------------------------------------------
// Severity / status enums
// ---------------------------------------------------------------------------

/// Severity ladder. `Ord` so escalation comparisons read directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Ok,
  Warning,
  Critical,
}

impl Severity {
  /// One step up the ladder; `Critical` saturates.
  pub fn escalated(self) -> Self {
    match self {
      Self::Ok => Self::Warning,
      Self::Warning | Self::Critical => Self::Critical,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Ok => "ok",
      Self::Warning => "warning",
      Self::Critical => "critical",
    }
  }
}

/// Exception lifecycle states. `Closed` is terminal; the only way back out is
/// the auto-close reopen path in [`crate::autoclose`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
  Open,
  Triage,
  InProgress,
  Closed,
}

impl Status {
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Closed)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Open => "open",
      Self::Triage => "triage",
      Self::InProgress => "in_progress",
      Self::Closed => "closed",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
  Pending,
  InProgress,
  Done,
  Skipped,
}

impl StepStatus {
  /// Done and skipped steps no longer block auto-close.
  pub fn is_settled(self) -> bool {
    matches!(self, Self::Done | Self::Skipped)
  }
}

// ---------------------------------------------------------------------------
// Inbound candidate (JSON contract — what a producing module sends)
// ---------------------------------------------------------------------------

/// Raw ingest payload. The `signature` is a free-form JSON object used for
/// fingerprinting after volatile fields are stripped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
  pub source_module: String,
  pub source_record_id: String,
  pub category: String,
  pub severity: Severity,
  pub signature: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Exception record
// ---------------------------------------------------------------------------

/// One remediation step. Steps carry a stable id minted at creation; updates
/// address steps by id so concurrent editors cannot clash via stale positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationStep {
  pub id: StepId,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub owner_role: Option<String>,
  pub status: StepStatus,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// Append-only annotation. Comments are never deleted or edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
  pub author: String,
  pub text: String,
  pub created_at: DateTime<Utc>,
}

/// A single occurrence of an anomalous condition raised by a producing module.
///
/// Invariants: `closed_at` is set iff `status == Closed`; `remediation_steps`
/// and `comments` are append-only; records are never deleted (audit history).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exception {
  pub id: ExceptionId,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cluster_id: Option<ClusterId>,
  pub source_module: String,
  pub source_record_id: String,
  pub category: String,
  pub severity: Severity,
  pub status: Status,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub assigned_to_role: Option<String>,
  #[serde(default)]
  pub remediation_steps: Vec<RemediationStep>,
  #[serde(default)]
  pub comments: Vec<Comment>,
  #[serde(default)]
  pub source_resolved: bool,
  /// Set by the sweep when a critical exception overruns its SLA.
  #[serde(default)]
  pub sla_breached: bool,
  /// True when the engine (not a human) closed this exception. Only
  /// engine-closed exceptions may be reopened by a recurring source signal.
  #[serde(default)]
  pub auto_closed: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sla_due_at: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub closed_at: Option<DateTime<Utc>>,
  /// Optimistic-concurrency version; bumped by the store on every committed write.
  #[serde(default)]
  pub version: u64,
}

impl Exception {
  /// All remediation steps are done or skipped (vacuously true when empty).
  pub fn steps_settled(&self) -> bool {
    self.remediation_steps.iter().all(|s| s.status.is_settled())
  }
}

// ---------------------------------------------------------------------------
// Cluster record
// ---------------------------------------------------------------------------

/// A group of exceptions sharing a dedup fingerprint — recurring instances of
/// the same underlying issue. Never deleted; a cluster whose members are all
/// closed counts as resolved but is retained for audit history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionCluster {
  pub id: ClusterId,
  pub dedup_key: DedupKey,
  /// Insertion-ordered; all members share `dedup_key`.
  pub member_ids: Vec<ExceptionId>,
  /// Oldest member, used for display and routing inheritance.
  pub representative_id: ExceptionId,
  /// Derived count of members not yet closed. Recomputed from ground truth
  /// after bulk operations, never trusted incrementally across them.
  pub open_member_count: u64,
  pub created_at: DateTime<Utc>,
  pub last_member_added_at: DateTime<Utc>,
  #[serde(default)]
  pub version: u64,
}

impl ExceptionCluster {
  pub fn is_open(&self) -> bool {
    self.open_member_count > 0
  }
}

// ---------------------------------------------------------------------------
// Operation results
// ---------------------------------------------------------------------------

/// Result of `ExceptionRouter::ingest`.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
  pub exception: Exception,
  pub cluster: ExceptionCluster,
  /// False when the candidate joined an existing open cluster.
  pub created_new_cluster: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkFailure {
  pub id: ExceptionId,
  pub error: String,
}

/// Outcome of a cluster bulk operation. Failures are per-member and never
/// abort the rest of the batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkResult {
  pub succeeded: Vec<ExceptionId>,
  pub failed: Vec<BulkFailure>,
}

/// Outcome of one `AutoCloseEngine::sweep` pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
  pub escalated: Vec<ExceptionId>,
  pub closed: Vec<ExceptionId>,
  pub failed: Vec<BulkFailure>,
}

impl SweepReport {
  /// No writes happened this pass.
  pub fn is_quiet(&self) -> bool {
    self.escalated.is_empty() && self.closed.is_empty() && self.failed.is_empty()
  }
}

// ---------------------------------------------------------------------------
// CLI stream wrappers
// ---------------------------------------------------------------------------

/// Structured error output for rejected commands.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorOutput {
  pub error: bool,
  pub kind: String,
  pub message: String,
}

impl ErrorOutput {
  pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      error: true,
      kind: kind.into(),
      message: message.into(),
    }
  }
}
