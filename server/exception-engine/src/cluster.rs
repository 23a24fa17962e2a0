//! Cluster bulk operations: assign or close every open member, tolerating
//! per-member failures, then recompute the open-member count from ground
//! truth so partial failures cannot leave the count drifted.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::audit::{AuditEvent, AuditSink};
use crate::config::Config;
use crate::error::EngineError;
use crate::store::{
  commit_cluster_with_retry, commit_with_retry, ExceptionStore, Mutation,
};
use crate::triage::TriageEngine;
use crate::types::{BulkFailure, BulkResult, ClusterId, Exception, ExceptionCluster, Status};

/// Recompute `open_member_count` from a fresh read of the members. Writes
/// only when the count actually changed.
pub fn recount_open_members(
  store: &dyn ExceptionStore,
  audit: &dyn AuditSink,
  cluster_id: &ClusterId,
  max_attempts: u32,
  actor: &str,
  now: DateTime<Utc>,
) -> Result<ExceptionCluster, EngineError> {
  commit_cluster_with_retry(store, audit, cluster_id, max_attempts, |current| {
    let members = store.cluster_members(&current.id)?;
    let open = members.iter().filter(|m| !m.status.is_terminal()).count() as u64;
    if open == current.open_member_count {
      return Ok(Mutation::unchanged(current.clone()));
    }
    let mut next = current.clone();
    let event = AuditEvent::cluster(
      "cluster.recounted",
      current.id.0.clone(),
      format!("open_member_count: {} -> {}", current.open_member_count, open),
      actor,
      now,
    );
    next.open_member_count = open;
    Ok(Mutation::changed(next, vec![event]))
  })
}

pub struct ClusterManager {
  store: Arc<dyn ExceptionStore>,
  audit: Arc<dyn AuditSink>,
  config: Arc<Config>,
  triage: TriageEngine,
}

impl ClusterManager {
  pub fn new(
    store: Arc<dyn ExceptionStore>,
    audit: Arc<dyn AuditSink>,
    config: Arc<Config>,
  ) -> Self {
    let triage = TriageEngine::new(config.clone());
    Self { store, audit, config, triage }
  }

  /// Assign every open member of the cluster to `role`.
  pub fn assign_all(
    &self,
    cluster_id: &ClusterId,
    role: &str,
    actor: &str,
    now: DateTime<Utc>,
  ) -> Result<BulkResult, EngineError> {
    self.for_each_open_member(cluster_id, actor, now, |current| {
      self.triage.assign(current, role, actor, now)
    })
  }

  /// Close every open member of the cluster.
  pub fn close_all(
    &self,
    cluster_id: &ClusterId,
    actor: &str,
    now: DateTime<Utc>,
  ) -> Result<BulkResult, EngineError> {
    self.for_each_open_member(cluster_id, actor, now, |current| {
      self.triage.change_status(current, Status::Closed, actor, now)
    })
  }

  /// Bulk loop: each open member commits independently; a failure is recorded
  /// and never aborts the remaining members. Members that closed between the
  /// snapshot and the write are skipped, not errored. The recount at the end
  /// runs after every member write has settled.
  fn for_each_open_member<F>(
    &self,
    cluster_id: &ClusterId,
    actor: &str,
    now: DateTime<Utc>,
    op: F,
  ) -> Result<BulkResult, EngineError>
  where
    F: Fn(&Exception) -> Result<Mutation<Exception>, EngineError>,
  {
    let cluster = self.store.get_cluster(cluster_id)?;
    let members = self.store.cluster_members(&cluster.id)?;
    let mut result = BulkResult::default();

    for member in members.iter().filter(|m| !m.status.is_terminal()) {
      let committed = commit_with_retry(
        self.store.as_ref(),
        self.audit.as_ref(),
        &member.id,
        self.config.max_write_attempts,
        |current| {
          if current.status.is_terminal() {
            // Raced with another close; skipping is not a failure.
            return Ok(Mutation::unchanged(current.clone()));
          }
          op(current)
        },
      );

      match committed {
        Ok(_) => result.succeeded.push(member.id.clone()),
        Err(err) => {
          tracing::warn!(member = %member.id, error = %err, "bulk member operation failed");
          result.failed.push(BulkFailure {
            id: member.id.clone(),
            error: err.to_string(),
          });
        }
      }
    }

    // Member writes have settled; a recount that cannot commit leaves a stale
    // count for the next recount, it never discards the per-member results.
    if let Err(err) = recount_open_members(
      self.store.as_ref(),
      self.audit.as_ref(),
      cluster_id,
      self.config.max_write_attempts,
      actor,
      now,
    ) {
      tracing::warn!(cluster = %cluster_id, error = %err, "recount failed after bulk operation");
    }

    tracing::info!(
      cluster = %cluster_id,
      succeeded = result.succeeded.len(),
      failed = result.failed.len(),
      "bulk operation complete"
    );
    Ok(result)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::audit::MemoryAuditSink;
  use crate::router::ExceptionRouter;
  use crate::store::MemoryStore;
  use crate::types::{Candidate, Severity};
  use chrono::{Duration, TimeZone};
  use serde_json::json;

  fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 26, 9, 0, 0).unwrap()
  }

  struct Fixture {
    store: Arc<MemoryStore>,
    audit: Arc<MemoryAuditSink>,
    router: ExceptionRouter,
    manager: ClusterManager,
  }

  fn setup() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let config = Arc::new(Config::default());
    Fixture {
      store: store.clone(),
      audit: audit.clone(),
      router: ExceptionRouter::new(store.clone(), audit.clone(), config.clone()),
      manager: ClusterManager::new(store, audit, config),
    }
  }

  fn ingest_n(fx: &Fixture, n: usize) -> ClusterId {
    let mut cluster_id = None;
    for i in 0..n {
      let candidate = Candidate {
        source_module: "recon".into(),
        source_record_id: format!("r-{}", i),
        category: "reconciliation".into(),
        severity: Severity::Warning,
        signature: json!({"account": "A1", "break_type": "price"}),
      };
      let out = fx
        .router
        .ingest(&candidate, "recon", t0() + Duration::minutes(i as i64))
        .unwrap();
      cluster_id = Some(out.cluster.id);
    }
    cluster_id.unwrap()
  }

  #[test]
  fn assign_all_covers_every_open_member() {
    let fx = setup();
    let cluster_id = ingest_n(&fx, 3);

    let result = fx.manager.assign_all(&cluster_id, "risk_ops", "alice", t0()).unwrap();
    assert_eq!(result.succeeded.len(), 3);
    assert!(result.failed.is_empty());

    for member in fx.store.cluster_members(&cluster_id).unwrap() {
      assert_eq!(member.assigned_to_role.as_deref(), Some("risk_ops"));
    }
  }

  #[test]
  fn close_all_closes_open_members_and_recounts() {
    let fx = setup();
    let cluster_id = ingest_n(&fx, 3);

    let result = fx.manager.close_all(&cluster_id, "alice", t0()).unwrap();
    assert_eq!(result.succeeded.len(), 3);

    let cluster = fx.store.get_cluster(&cluster_id).unwrap();
    assert_eq!(cluster.open_member_count, 0);
    for member in fx.store.cluster_members(&cluster_id).unwrap() {
      assert_eq!(member.status, Status::Closed);
      assert!(member.closed_at.is_some());
    }
    // Resolved clusters are retained, never deleted.
    assert_eq!(cluster.member_ids.len(), 3);
  }

  #[test]
  fn closed_members_are_skipped_not_errored() {
    let fx = setup();
    let cluster_id = ingest_n(&fx, 2);

    // Close one member directly first.
    let members = fx.store.cluster_members(&cluster_id).unwrap();
    let triage = TriageEngine::new(Arc::new(Config::default()));
    commit_with_retry(fx.store.as_ref(), fx.audit.as_ref(), &members[0].id, 3, |cur| {
      triage.change_status(cur, Status::Closed, "bob", t0())
    })
    .unwrap();

    let result = fx.manager.close_all(&cluster_id, "alice", t0()).unwrap();
    // Only the remaining open member is touched.
    assert_eq!(result.succeeded, vec![members[1].id.clone()]);
    assert!(result.failed.is_empty());
  }

  #[test]
  fn recount_is_a_noop_when_count_is_accurate() {
    let fx = setup();
    let cluster_id = ingest_n(&fx, 2);
    let before = fx.store.get_cluster(&cluster_id).unwrap();

    let after = recount_open_members(
      fx.store.as_ref(),
      fx.audit.as_ref(),
      &cluster_id,
      3,
      "alice",
      t0(),
    )
    .unwrap();
    assert_eq!(after.version, before.version);
  }
}
