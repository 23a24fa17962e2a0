//! Auto-close engine: source-resolution signals and the periodic SLA sweep.
//!
//! The sweep is meant to run on a fixed interval on a single scheduler
//! instance. Each exception commits as a complete unit before the next one is
//! touched, so an interrupted sweep never leaves partial state, and a second
//! pass over unchanged state performs zero writes.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::audit::{AuditEvent, AuditSink};
use crate::cluster;
use crate::config::Config;
use crate::error::EngineError;
use crate::store::{commit_with_retry, ExceptionStore, Mutation};
use crate::types::{BulkFailure, Exception, ExceptionId, Severity, Status, SweepReport};

/// Actor id recorded on engine-driven mutations.
pub const SYSTEM_ACTOR: &str = "system:auto-close";

pub struct AutoCloseEngine {
  store: Arc<dyn ExceptionStore>,
  audit: Arc<dyn AuditSink>,
  config: Arc<Config>,
}

impl AutoCloseEngine {
  pub fn new(
    store: Arc<dyn ExceptionStore>,
    audit: Arc<dyn AuditSink>,
    config: Arc<Config>,
  ) -> Self {
    Self { store, audit, config }
  }

  /// Record a source-resolution signal from the producing module.
  ///
  /// `resolved = true` closes the exception in the same operation when its
  /// category is auto-closable and every remediation step is settled;
  /// otherwise the flag is recorded for the next sweep. `resolved = false` on
  /// an engine-closed exception reopens it to `Triage` — the one sanctioned
  /// path back out of `Closed`.
  pub fn mark_source_resolved(
    &self,
    id: &ExceptionId,
    resolved: bool,
    actor: &str,
    now: DateTime<Utc>,
  ) -> Result<Exception, EngineError> {
    let before = self.store.get_exception(id)?;
    let updated = commit_with_retry(
      self.store.as_ref(),
      self.audit.as_ref(),
      id,
      self.config.max_write_attempts,
      |current| self.apply_source_resolved(current, resolved, actor, now),
    )?;

    if before.status != updated.status {
      if let Some(cluster_id) = &updated.cluster_id {
        // The exception write already won; a recount that cannot commit is
        // logged and left to the next recount, never surfaced as a failure.
        if let Err(err) = cluster::recount_open_members(
          self.store.as_ref(),
          self.audit.as_ref(),
          cluster_id,
          self.config.max_write_attempts,
          actor,
          now,
        ) {
          tracing::warn!(cluster = %cluster_id, error = %err, "recount failed after status change");
        }
      }
    }
    Ok(updated)
  }

  /// Pure transform behind [`Self::mark_source_resolved`].
  pub fn apply_source_resolved(
    &self,
    exc: &Exception,
    resolved: bool,
    actor: &str,
    now: DateTime<Utc>,
  ) -> Result<Mutation<Exception>, EngineError> {
    let mut next = exc.clone();
    let mut audit = Vec::new();

    if next.source_resolved != resolved {
      next.source_resolved = resolved;
      audit.push(AuditEvent::exception(
        "exception.source_resolved",
        exc.id.0.clone(),
        format!("source_resolved: {} -> {}", exc.source_resolved, resolved),
        actor,
        next.severity,
        now,
      ));
    }

    if resolved {
      if !next.status.is_terminal()
        && self.config.is_auto_closable(&next.category)
        && next.steps_settled()
      {
        next.status = Status::Closed;
        next.closed_at = Some(now);
        next.auto_closed = true;
        audit.push(AuditEvent::exception(
          "exception.auto_closed",
          exc.id.0.clone(),
          format!("status: {} -> closed (source resolved)", exc.status.as_str()),
          actor,
          next.severity,
          now,
        ));
      }
    } else if next.status.is_terminal() && next.auto_closed {
      // The underlying condition recurred: reopen rather than spawning a
      // duplicate exception.
      next.status = Status::Triage;
      next.closed_at = None;
      next.auto_closed = false;
      // Fresh SLA clock; the pre-close deadline is long stale by now.
      let hours = self.config.sla_hours(&next.category, next.severity);
      next.sla_due_at = Some(now + Duration::hours(hours));
      audit.push(AuditEvent::exception(
        "exception.reopened",
        exc.id.0.clone(),
        "status: closed -> triage (source condition recurred)".to_string(),
        actor,
        next.severity,
        now,
      ));
    }

    if audit.is_empty() {
      return Ok(Mutation::unchanged(exc.clone()));
    }
    next.updated_at = now;
    Ok(Mutation::changed(next, audit))
  }

  /// One sweep pass over all non-closed exceptions: SLA escalation, then
  /// auto-close for resolved sources with settled steps. Fully idempotent.
  pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, EngineError> {
    let mut report = SweepReport::default();

    for snapshot in self.store.list_open_exceptions()? {
      let committed = commit_with_retry(
        self.store.as_ref(),
        self.audit.as_ref(),
        &snapshot.id,
        self.config.max_write_attempts,
        |current| self.sweep_one(current, now),
      );

      match committed {
        Ok(updated) => {
          let escalated = updated.severity != snapshot.severity
            || updated.sla_breached != snapshot.sla_breached;
          let closed = updated.status.is_terminal() && !snapshot.status.is_terminal();
          if escalated {
            report.escalated.push(updated.id.clone());
          }
          if closed {
            report.closed.push(updated.id.clone());
            if let Some(cluster_id) = &updated.cluster_id {
              if let Err(err) = cluster::recount_open_members(
                self.store.as_ref(),
                self.audit.as_ref(),
                cluster_id,
                self.config.max_write_attempts,
                SYSTEM_ACTOR,
                now,
              ) {
                // The close itself committed; report the stale count as a
                // per-item failure and keep sweeping.
                tracing::warn!(cluster = %cluster_id, error = %err, "recount failed after sweep close");
                report.failed.push(BulkFailure {
                  id: updated.id.clone(),
                  error: err.to_string(),
                });
              }
            }
          }
        }
        Err(err) => {
          report.failed.push(BulkFailure {
            id: snapshot.id.clone(),
            error: err.to_string(),
          });
        }
      }
    }

    if report.is_quiet() {
      tracing::debug!("sweep pass made no changes");
    } else {
      tracing::info!(
        escalated = report.escalated.len(),
        closed = report.closed.len(),
        failed = report.failed.len(),
        "sweep pass complete"
      );
    }
    Ok(report)
  }

  /// Sweep transform for one exception.
  fn sweep_one(
    &self,
    exc: &Exception,
    now: DateTime<Utc>,
  ) -> Result<Mutation<Exception>, EngineError> {
    if exc.status.is_terminal() {
      return Ok(Mutation::unchanged(exc.clone()));
    }

    let mut next = exc.clone();
    let mut audit = Vec::new();

    // SLA breach: escalate one level; critical saturates and flags instead.
    if let Some(due) = next.sla_due_at {
      if due < now {
        if next.severity < Severity::Critical {
          let old = next.severity;
          next.severity = old.escalated();
          // Re-escalate the clock so the breach is not re-reported every pass.
          let hours = self.config.sla_hours(&next.category, next.severity);
          next.sla_due_at = Some(now + Duration::hours(hours));
          audit.push(AuditEvent::exception(
            "exception.sla_breached",
            exc.id.0.clone(),
            format!(
              "sla breached; severity: {} -> {}",
              old.as_str(),
              next.severity.as_str()
            ),
            SYSTEM_ACTOR,
            next.severity,
            now,
          ));
        } else if !next.sla_breached {
          next.sla_breached = true;
          audit.push(AuditEvent::exception(
            "exception.sla_breached",
            exc.id.0.clone(),
            "sla breached at critical severity".to_string(),
            SYSTEM_ACTOR,
            next.severity,
            now,
          ));
        }
      }
    }

    // Auto-close once the source signal is in and nothing is left to do.
    if next.source_resolved
      && self.config.is_auto_closable(&next.category)
      && next.steps_settled()
    {
      next.status = Status::Closed;
      next.closed_at = Some(now);
      next.auto_closed = true;
      audit.push(AuditEvent::exception(
        "exception.auto_closed",
        exc.id.0.clone(),
        format!("status: {} -> closed (swept)", exc.status.as_str()),
        SYSTEM_ACTOR,
        next.severity,
        now,
      ));
    }

    if audit.is_empty() {
      return Ok(Mutation::unchanged(exc.clone()));
    }
    next.updated_at = now;
    Ok(Mutation::changed(next, audit))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::audit::MemoryAuditSink;
  use crate::router::ExceptionRouter;
  use crate::store::MemoryStore;
  use crate::types::Candidate;
  use chrono::TimeZone;
  use serde_json::json;

  fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 26, 9, 0, 0).unwrap()
  }

  struct Fixture {
    store: Arc<MemoryStore>,
    audit: Arc<MemoryAuditSink>,
    router: ExceptionRouter,
    engine: AutoCloseEngine,
  }

  fn setup() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let config = Arc::new(Config::default());
    Fixture {
      store: store.clone(),
      audit: audit.clone(),
      router: ExceptionRouter::new(store.clone(), audit.clone(), config.clone()),
      engine: AutoCloseEngine::new(store, audit, config),
    }
  }

  fn ingest(fx: &Fixture, category: &str, severity: Severity) -> Exception {
    let candidate = Candidate {
      source_module: "recon".into(),
      source_record_id: "r-1".into(),
      category: category.into(),
      severity,
      signature: json!({"account": "A1", "break_type": "price"}),
    };
    fx.router.ingest(&candidate, "recon", t0()).unwrap().exception
  }

  #[test]
  fn resolved_signal_closes_auto_closable_immediately() {
    let fx = setup();
    let exc = ingest(&fx, "reconciliation", Severity::Warning);

    let closed = fx.engine.mark_source_resolved(&exc.id, true, "recon", t0()).unwrap();
    assert_eq!(closed.status, Status::Closed);
    assert!(closed.closed_at.is_some());
    assert!(closed.auto_closed);
    assert!(fx.audit.actions().contains(&"exception.auto_closed".to_string()));

    // Owning cluster reflects the close.
    let cluster = fx.store.get_cluster(closed.cluster_id.as_ref().unwrap()).unwrap();
    assert_eq!(cluster.open_member_count, 0);
  }

  #[test]
  fn open_steps_defer_the_close() {
    let fx = setup();
    let exc = ingest(&fx, "reconciliation", Severity::Warning);
    let triage = crate::triage::TriageEngine::new(Arc::new(Config::default()));
    let with_step = commit_with_retry(fx.store.as_ref(), fx.audit.as_ref(), &exc.id, 3, |cur| {
      triage.add_remediation_step(cur, "re-run batch", None, "alice", t0())
    })
    .unwrap();

    let flagged = fx.engine.mark_source_resolved(&with_step.id, true, "recon", t0()).unwrap();
    assert_eq!(flagged.status, Status::Open);
    assert!(flagged.source_resolved);

    // Steps settle, next sweep closes it.
    let step_id = flagged.remediation_steps[0].id.clone();
    commit_with_retry(fx.store.as_ref(), fx.audit.as_ref(), &flagged.id, 3, |cur| {
      triage.update_remediation_step(
        cur,
        &step_id,
        &crate::triage::StepUpdate {
          status: Some(crate::types::StepStatus::Skipped),
          ..Default::default()
        },
        "alice",
        t0(),
      )
    })
    .unwrap();

    let report = fx.engine.sweep(t0() + Duration::hours(1)).unwrap();
    assert_eq!(report.closed, vec![flagged.id.clone()]);
    let after = fx.store.get_exception(&flagged.id).unwrap();
    assert_eq!(after.status, Status::Closed);
  }

  #[test]
  fn non_auto_closable_category_waits_for_a_human() {
    let fx = setup();
    let exc = ingest(&fx, "compliance", Severity::Warning);

    let flagged = fx.engine.mark_source_resolved(&exc.id, true, "compliance", t0()).unwrap();
    assert_eq!(flagged.status, Status::Open);
    assert!(flagged.source_resolved);

    // The sweep does not close it either; compliance closes by hand.
    let report = fx.engine.sweep(t0() + Duration::minutes(5)).unwrap();
    assert!(report.closed.is_empty());
  }

  #[test]
  fn recurrence_reopens_auto_closed_exception() {
    let fx = setup();
    let exc = ingest(&fx, "reconciliation", Severity::Warning);
    let closed = fx.engine.mark_source_resolved(&exc.id, true, "recon", t0()).unwrap();
    assert_eq!(closed.status, Status::Closed);

    let reopened = fx
      .engine
      .mark_source_resolved(&exc.id, false, "recon", t0() + Duration::hours(2))
      .unwrap();
    assert_eq!(reopened.status, Status::Triage);
    assert_eq!(reopened.closed_at, None);
    assert!(!reopened.auto_closed);
    assert!(fx.audit.actions().contains(&"exception.reopened".to_string()));

    let cluster = fx.store.get_cluster(reopened.cluster_id.as_ref().unwrap()).unwrap();
    assert_eq!(cluster.open_member_count, 1);
  }

  #[test]
  fn human_closed_exception_is_not_reopened_by_signal() {
    let fx = setup();
    let exc = ingest(&fx, "reconciliation", Severity::Warning);
    let triage = crate::triage::TriageEngine::new(Arc::new(Config::default()));
    commit_with_retry(fx.store.as_ref(), fx.audit.as_ref(), &exc.id, 3, |cur| {
      triage.change_status(cur, Status::Closed, "alice", t0())
    })
    .unwrap();

    let after = fx.engine.mark_source_resolved(&exc.id, false, "recon", t0()).unwrap();
    assert_eq!(after.status, Status::Closed);
  }

  #[test]
  fn sweep_escalates_overdue_warning_to_critical() {
    let fx = setup();
    let exc = ingest(&fx, "reconciliation", Severity::Warning);
    // warning/reconciliation SLA is 24h; sweep at +25h.
    let now = t0() + Duration::hours(25);
    let report = fx.engine.sweep(now).unwrap();

    assert_eq!(report.escalated, vec![exc.id.clone()]);
    let after = fx.store.get_exception(&exc.id).unwrap();
    assert_eq!(after.severity, Severity::Critical);
    // Clock re-escalated: critical/reconciliation = 4h from sweep time.
    assert_eq!(after.sla_due_at, Some(now + Duration::hours(4)));
    assert!(fx.audit.actions().contains(&"exception.sla_breached".to_string()));
  }

  #[test]
  fn sweep_flags_overdue_critical_without_changing_severity() {
    let fx = setup();
    let exc = ingest(&fx, "reconciliation", Severity::Critical);
    let now = t0() + Duration::hours(5);
    let report = fx.engine.sweep(now).unwrap();

    assert_eq!(report.escalated, vec![exc.id.clone()]);
    let after = fx.store.get_exception(&exc.id).unwrap();
    assert_eq!(after.severity, Severity::Critical);
    assert!(after.sla_breached);
  }

  #[test]
  fn sweep_is_idempotent() {
    let fx = setup();
    ingest(&fx, "reconciliation", Severity::Warning);
    let now = t0() + Duration::hours(25);

    let first = fx.engine.sweep(now).unwrap();
    assert!(!first.is_quiet());
    let events_after_first = fx.audit.events().len();

    let second = fx.engine.sweep(now).unwrap();
    assert!(second.is_quiet());
    assert_eq!(fx.audit.events().len(), events_after_first);
  }

  #[test]
  fn sweep_before_due_time_does_nothing() {
    let fx = setup();
    ingest(&fx, "reconciliation", Severity::Warning);
    let report = fx.engine.sweep(t0() + Duration::hours(1)).unwrap();
    assert!(report.is_quiet());
  }
}
