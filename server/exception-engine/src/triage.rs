//! Triage state machine: every lifecycle mutation of a single exception goes
//! through here, so the transition rules live in exactly one place.
//!
//! Operations are pure transforms: they take the previous exception value and
//! return a new one (plus audit entries) without touching storage. Re-applying
//! an operation that changes nothing returns the input unchanged, which the
//! commit layer turns into "no write".

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::audit::AuditEvent;
use crate::config::Config;
use crate::error::EngineError;
use crate::store::Mutation;
use crate::types::{
  Comment, Exception, RemediationStep, Severity, Status, StepId, StepStatus,
};

/// Partial update for a remediation step; absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepUpdate {
  #[serde(default)]
  pub title: Option<String>,
  #[serde(default)]
  pub owner_role: Option<String>,
  #[serde(default)]
  pub status: Option<StepStatus>,
}

/// Allowed status transitions. `Closed` is terminal here; the auto-close
/// reopen path is the one sanctioned way back out and lives in
/// [`crate::autoclose`].
fn transition_allowed(from: Status, to: Status) -> bool {
  match (from, to) {
    (Status::Closed, _) => false,
    // Fast-track resolution from any non-terminal state.
    (_, Status::Closed) => true,
    // Reassessment: back (or forward) to triage from any non-terminal state.
    (_, Status::Triage) => true,
    (Status::Triage, Status::InProgress) => true,
    _ => false,
  }
}

pub struct TriageEngine {
  config: Arc<Config>,
}

impl TriageEngine {
  pub fn new(config: Arc<Config>) -> Self {
    Self { config }
  }

  /// Set the owning role. Idempotent: assigning the current role is a no-op.
  pub fn assign(
    &self,
    exc: &Exception,
    role: &str,
    actor: &str,
    now: DateTime<Utc>,
  ) -> Result<Mutation<Exception>, EngineError> {
    if exc.status.is_terminal() {
      return Err(EngineError::invalid_transition(format!(
        "cannot assign closed exception {}",
        exc.id
      )));
    }
    if exc.assigned_to_role.as_deref() == Some(role) {
      return Ok(Mutation::unchanged(exc.clone()));
    }

    let mut next = exc.clone();
    let old = next.assigned_to_role.replace(role.to_string());
    next.updated_at = now;

    let audit = AuditEvent::exception(
      "exception.assigned",
      exc.id.0.clone(),
      format!(
        "assigned_to_role: {} -> {}",
        old.as_deref().unwrap_or("(none)"),
        role
      ),
      actor,
      next.severity,
      now,
    );
    Ok(Mutation::changed(next, vec![audit]))
  }

  /// Re-classify severity. An upgrade re-escalates the SLA clock from the
  /// table; a downgrade leaves `sla_due_at` alone.
  pub fn change_severity(
    &self,
    exc: &Exception,
    new_severity: Severity,
    actor: &str,
    now: DateTime<Utc>,
  ) -> Result<Mutation<Exception>, EngineError> {
    if exc.status.is_terminal() {
      return Err(EngineError::invalid_transition(format!(
        "cannot re-classify closed exception {}",
        exc.id
      )));
    }
    if exc.severity == new_severity {
      return Ok(Mutation::unchanged(exc.clone()));
    }

    let mut next = exc.clone();
    let old = next.severity;
    next.severity = new_severity;
    if new_severity > old {
      let hours = self.config.sla_hours(&next.category, new_severity);
      next.sla_due_at = Some(now + Duration::hours(hours));
    }
    next.updated_at = now;

    let audit = AuditEvent::exception(
      "exception.severity_changed",
      exc.id.0.clone(),
      format!("severity: {} -> {}", old.as_str(), new_severity.as_str()),
      actor,
      new_severity,
      now,
    );
    Ok(Mutation::changed(next, vec![audit]))
  }

  /// Move through the state machine. Setting `Closed` stamps `closed_at`;
  /// same-state changes are no-ops; anything out of `Closed` is rejected.
  pub fn change_status(
    &self,
    exc: &Exception,
    new_status: Status,
    actor: &str,
    now: DateTime<Utc>,
  ) -> Result<Mutation<Exception>, EngineError> {
    if exc.status == new_status {
      return Ok(Mutation::unchanged(exc.clone()));
    }
    if !transition_allowed(exc.status, new_status) {
      return Err(EngineError::invalid_transition(format!(
        "{} -> {} is not allowed for {}",
        exc.status.as_str(),
        new_status.as_str(),
        exc.id
      )));
    }

    let mut next = exc.clone();
    let old = next.status;
    next.status = new_status;
    if new_status == Status::Closed {
      next.closed_at = Some(now);
    }
    next.updated_at = now;

    let audit = AuditEvent::exception(
      "exception.status_changed",
      exc.id.0.clone(),
      format!("status: {} -> {}", old.as_str(), new_status.as_str()),
      actor,
      next.severity,
      now,
    );
    Ok(Mutation::changed(next, vec![audit]))
  }

  /// Append a remediation step (status starts at `Pending`). Steps are never
  /// deleted afterwards, only status-updated.
  pub fn add_remediation_step(
    &self,
    exc: &Exception,
    title: &str,
    owner_role: Option<&str>,
    actor: &str,
    now: DateTime<Utc>,
  ) -> Result<Mutation<Exception>, EngineError> {
    if exc.status.is_terminal() {
      return Err(EngineError::invalid_transition(format!(
        "cannot add remediation step to closed exception {}",
        exc.id
      )));
    }

    let step = RemediationStep {
      id: StepId::mint(),
      title: title.to_string(),
      owner_role: owner_role.map(str::to_string),
      status: StepStatus::Pending,
      created_at: now,
      updated_at: now,
    };
    let step_id = step.id.clone();

    let mut next = exc.clone();
    next.remediation_steps.push(step);
    next.updated_at = now;

    let audit = AuditEvent::exception(
      "exception.step_added",
      exc.id.0.clone(),
      format!("remediation step {} added: {}", step_id, title),
      actor,
      next.severity,
      now,
    );
    Ok(Mutation::changed(next, vec![audit]))
  }

  /// Update a step addressed by its stable id (positional indices clash under
  /// concurrent edits). Unknown id is `StepNotFound`.
  pub fn update_remediation_step(
    &self,
    exc: &Exception,
    step_id: &StepId,
    update: &StepUpdate,
    actor: &str,
    now: DateTime<Utc>,
  ) -> Result<Mutation<Exception>, EngineError> {
    if exc.status.is_terminal() {
      return Err(EngineError::invalid_transition(format!(
        "cannot update remediation step on closed exception {}",
        exc.id
      )));
    }

    let mut next = exc.clone();
    let step = next
      .remediation_steps
      .iter_mut()
      .find(|s| s.id == *step_id)
      .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))?;

    let mut changes = Vec::new();
    if let Some(title) = &update.title {
      if *title != step.title {
        changes.push(format!("title: {} -> {}", step.title, title));
        step.title = title.clone();
      }
    }
    if let Some(role) = &update.owner_role {
      if step.owner_role.as_deref() != Some(role) {
        changes.push(format!(
          "owner_role: {} -> {}",
          step.owner_role.as_deref().unwrap_or("(none)"),
          role
        ));
        step.owner_role = Some(role.clone());
      }
    }
    if let Some(status) = update.status {
      if step.status != status {
        changes.push(format!("status: {:?} -> {:?}", step.status, status));
        step.status = status;
      }
    }
    if changes.is_empty() {
      return Ok(Mutation::unchanged(exc.clone()));
    }
    step.updated_at = now;
    next.updated_at = now;

    let audit = AuditEvent::exception(
      "exception.step_updated",
      exc.id.0.clone(),
      format!("step {}: {}", step_id, changes.join("; ")),
      actor,
      next.severity,
      now,
    );
    Ok(Mutation::changed(next, vec![audit]))
  }

  /// Append a comment. Allowed in every state, including `Closed` — comments
  /// are historical annotations, not workflow actions.
  pub fn add_comment(
    &self,
    exc: &Exception,
    text: &str,
    actor: &str,
    now: DateTime<Utc>,
  ) -> Result<Mutation<Exception>, EngineError> {
    let mut next = exc.clone();
    next.comments.push(Comment {
      author: actor.to_string(),
      text: text.to_string(),
      created_at: now,
    });
    next.updated_at = now;

    let audit = AuditEvent::exception(
      "exception.comment_added",
      exc.id.0.clone(),
      format!("comment by {}", actor),
      actor,
      next.severity,
      now,
    );
    Ok(Mutation::changed(next, vec![audit]))
  }
}
