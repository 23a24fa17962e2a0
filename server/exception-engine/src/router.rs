//! Exception routing: validate a raw candidate, fingerprint it, attach it to
//! an open cluster (or start one), and assign initial role + SLA clock.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::audit::{AuditEvent, AuditSink};
use crate::config::Config;
use crate::error::EngineError;
use crate::fingerprint;
use crate::normalize;
use crate::store::{commit_cluster_with_retry, ExceptionStore, Mutation};
use crate::types::{
  Candidate, ClusterId, DedupKey, Exception, ExceptionCluster, ExceptionId, IngestOutcome, Status,
};

pub struct ExceptionRouter {
  store: Arc<dyn ExceptionStore>,
  audit: Arc<dyn AuditSink>,
  config: Arc<Config>,
}

impl ExceptionRouter {
  pub fn new(
    store: Arc<dyn ExceptionStore>,
    audit: Arc<dyn AuditSink>,
    config: Arc<Config>,
  ) -> Self {
    Self { store, audit, config }
  }

  /// Ingest one candidate.
  ///
  /// Validation happens before any write: an unknown category or malformed
  /// signature rejects the ingest with no partial records. A candidate whose
  /// dedup key matches an open cluster joins it and inherits the cluster's
  /// current role and severity floor; otherwise a new cluster is created with
  /// this exception as representative.
  pub fn ingest(
    &self,
    candidate: &Candidate,
    actor: &str,
    now: DateTime<Utc>,
  ) -> Result<IngestOutcome, EngineError> {
    let default_role = self.config.default_role(&candidate.category)?.to_string();
    let pairs = normalize::normalize_signature(candidate, &self.config)?;
    let dedup_key = fingerprint::compute(&candidate.category, &pairs);

    let open_cluster = self.store.find_open_cluster(&dedup_key)?;
    let id = ExceptionId::mint();

    let (severity, assigned_to_role) = match &open_cluster {
      Some(cluster) => {
        let members = self.store.cluster_members(&cluster.id)?;
        // Severity floor: never below the cluster's highest member severity.
        let ceiling = members
          .iter()
          .map(|m| m.severity)
          .max()
          .unwrap_or(candidate.severity);
        let inherited_role = members
          .iter()
          .find(|m| m.id == cluster.representative_id)
          .and_then(|rep| rep.assigned_to_role.clone())
          .unwrap_or(default_role);
        (candidate.severity.max(ceiling), inherited_role)
      }
      None => (candidate.severity, default_role),
    };

    let sla_hours = self.config.sla_hours(&candidate.category, severity);
    let exception = Exception {
      id: id.clone(),
      cluster_id: None, // set below once the owning cluster is known
      source_module: candidate.source_module.clone(),
      source_record_id: candidate.source_record_id.clone(),
      category: candidate.category.clone(),
      severity,
      status: Status::Open,
      assigned_to_role: Some(assigned_to_role),
      remediation_steps: Vec::new(),
      comments: Vec::new(),
      source_resolved: false,
      sla_breached: false,
      auto_closed: false,
      sla_due_at: Some(now + Duration::hours(sla_hours)),
      created_at: now,
      updated_at: now,
      closed_at: None,
      version: 0,
    };

    match open_cluster {
      Some(cluster) => self.join_cluster(exception, cluster, actor, now),
      None => self.start_cluster(exception, dedup_key, actor, now),
    }
  }

  fn start_cluster(
    &self,
    mut exception: Exception,
    dedup_key: DedupKey,
    actor: &str,
    now: DateTime<Utc>,
  ) -> Result<IngestOutcome, EngineError> {
    let cluster = ExceptionCluster {
      id: ClusterId::mint(),
      dedup_key,
      member_ids: vec![exception.id.clone()],
      representative_id: exception.id.clone(),
      open_member_count: 1,
      created_at: now,
      last_member_added_at: now,
      version: 0,
    };
    exception.cluster_id = Some(cluster.id.clone());

    self.store.insert_exception(exception.clone())?;
    self.store.insert_cluster(cluster.clone())?;

    tracing::info!(
      exception = %exception.id,
      cluster = %cluster.id,
      category = %exception.category,
      "exception created, new cluster"
    );
    self.audit.record(AuditEvent::exception(
      "exception.created",
      exception.id.0.clone(),
      format!("created in {} with severity {}", exception.category, exception.severity.as_str()),
      actor,
      exception.severity,
      now,
    ));
    self.audit.record(AuditEvent::cluster(
      "cluster.created",
      cluster.id.0.clone(),
      format!("created for dedup key {}", cluster.dedup_key),
      actor,
      now,
    ));

    Ok(IngestOutcome { exception, cluster, created_new_cluster: true })
  }

  fn join_cluster(
    &self,
    mut exception: Exception,
    cluster: ExceptionCluster,
    actor: &str,
    now: DateTime<Utc>,
  ) -> Result<IngestOutcome, EngineError> {
    // Cluster membership commits first: a join that loses its race for good
    // rejects the ingest with no exception record persisted.
    let member_id = exception.id.clone();
    let updated = commit_cluster_with_retry(
      self.store.as_ref(),
      self.audit.as_ref(),
      &cluster.id,
      self.config.max_write_attempts,
      |current| {
        let mut next = current.clone();
        next.member_ids.push(member_id.clone());
        next.open_member_count += 1;
        next.last_member_added_at = now;
        let audit = AuditEvent::cluster(
          "cluster.member_added",
          current.id.0.clone(),
          format!("member {} added ({} total)", member_id, next.member_ids.len()),
          actor,
          now,
        );
        Ok(Mutation::changed(next, vec![audit]))
      },
    )?;

    exception.cluster_id = Some(updated.id.clone());
    self.store.insert_exception(exception.clone())?;

    tracing::info!(
      exception = %exception.id,
      cluster = %updated.id,
      members = updated.member_ids.len(),
      "exception clustered"
    );
    self.audit.record(AuditEvent::exception(
      "exception.clustered",
      exception.id.0.clone(),
      format!("joined cluster {}", updated.id),
      actor,
      exception.severity,
      now,
    ));

    Ok(IngestOutcome { exception, cluster: updated, created_new_cluster: false })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::audit::MemoryAuditSink;
  use crate::store::MemoryStore;
  use crate::types::Severity;
  use chrono::TimeZone;
  use serde_json::json;

  fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 26, 9, 0, 0).unwrap()
  }

  fn setup() -> (Arc<MemoryStore>, Arc<MemoryAuditSink>, ExceptionRouter) {
    let store = Arc::new(MemoryStore::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let router = ExceptionRouter::new(store.clone(), audit.clone(), Arc::new(Config::default()));
    (store, audit, router)
  }

  fn recon_candidate(severity: Severity) -> Candidate {
    Candidate {
      source_module: "recon".into(),
      source_record_id: "r-1".into(),
      category: "reconciliation".into(),
      severity,
      signature: json!({"account": "A1", "break_type": "price"}),
    }
  }

  #[test]
  fn first_ingest_creates_exception_and_cluster() {
    let (_, audit, router) = setup();
    let out = router.ingest(&recon_candidate(Severity::Warning), "recon", t0()).unwrap();

    assert!(out.created_new_cluster);
    assert_eq!(out.cluster.representative_id, out.exception.id);
    assert_eq!(out.cluster.open_member_count, 1);
    assert_eq!(out.exception.cluster_id, Some(out.cluster.id.clone()));
    assert_eq!(out.exception.assigned_to_role.as_deref(), Some("ops_analyst"));
    // warning/reconciliation = 24h SLA.
    assert_eq!(out.exception.sla_due_at, Some(t0() + Duration::hours(24)));
    assert!(audit.actions().contains(&"exception.created".to_string()));
    assert!(audit.actions().contains(&"cluster.created".to_string()));
  }

  #[test]
  fn matching_signature_joins_open_cluster() {
    let (_, audit, router) = setup();
    let first = router.ingest(&recon_candidate(Severity::Warning), "recon", t0()).unwrap();
    let second = router
      .ingest(&recon_candidate(Severity::Warning), "recon", t0() + Duration::hours(1))
      .unwrap();

    assert!(!second.created_new_cluster);
    assert_eq!(second.cluster.id, first.cluster.id);
    assert_eq!(second.cluster.member_ids.len(), 2);
    assert_eq!(second.cluster.open_member_count, 2);
    assert_eq!(second.cluster.representative_id, first.exception.id);
    assert!(audit.actions().contains(&"exception.clustered".to_string()));
    assert!(audit.actions().contains(&"cluster.member_added".to_string()));
  }

  #[test]
  fn joined_member_inherits_severity_floor() {
    let (_, _, router) = setup();
    router.ingest(&recon_candidate(Severity::Critical), "recon", t0()).unwrap();
    let second = router
      .ingest(&recon_candidate(Severity::Warning), "recon", t0() + Duration::hours(1))
      .unwrap();
    // Never downgraded below the cluster's highest member severity.
    assert_eq!(second.exception.severity, Severity::Critical);
  }

  #[test]
  fn joined_member_inherits_representative_role() {
    let (store, audit, router) = setup();
    let first = router.ingest(&recon_candidate(Severity::Warning), "recon", t0()).unwrap();

    // Representative gets reassigned before the next occurrence arrives.
    let triage = crate::triage::TriageEngine::new(Arc::new(Config::default()));
    crate::store::commit_with_retry(
      store.as_ref(),
      audit.as_ref(),
      &first.exception.id,
      3,
      |cur| triage.assign(cur, "risk_ops", "alice", t0()),
    )
    .unwrap();

    let second = router
      .ingest(&recon_candidate(Severity::Warning), "recon", t0() + Duration::hours(1))
      .unwrap();
    assert_eq!(second.exception.assigned_to_role.as_deref(), Some("risk_ops"));
  }

  #[test]
  fn different_signature_starts_separate_cluster() {
    let (_, _, router) = setup();
    let first = router.ingest(&recon_candidate(Severity::Warning), "recon", t0()).unwrap();
    let mut other = recon_candidate(Severity::Warning);
    other.signature = json!({"account": "B7", "break_type": "quantity"});
    let second = router.ingest(&other, "recon", t0()).unwrap();

    assert!(second.created_new_cluster);
    assert_ne!(second.cluster.id, first.cluster.id);
  }

  #[test]
  fn unknown_category_rejected_without_partial_records() {
    let (store, audit, router) = setup();
    let mut candidate = recon_candidate(Severity::Warning);
    candidate.category = "mystery".into();

    let err = router.ingest(&candidate, "recon", t0()).unwrap_err();
    assert!(matches!(err, EngineError::UnknownCategory(_)));
    assert!(store.list_open_exceptions().unwrap().is_empty());
    assert!(audit.events().is_empty());
  }

  #[test]
  fn malformed_signature_rejected_without_partial_records() {
    let (store, _, router) = setup();
    let mut candidate = recon_candidate(Severity::Warning);
    candidate.signature = json!(42);

    let err = router.ingest(&candidate, "recon", t0()).unwrap_err();
    assert!(matches!(err, EngineError::InvalidSignature(_)));
    assert!(store.list_open_exceptions().unwrap().is_empty());
  }
}
