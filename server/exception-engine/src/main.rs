//! Binary entrypoint: read JSON command lines from stdin, write JSON result
//! lines to stdout.
//!
//! Each input line is one command (`op` tag selects the operation). Output
//! lines are either the operation's result or a structured ErrorOutput.
//! Audit events go to stderr as JSON lines.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use exception_engine::audit::StderrAuditSink;
use exception_engine::cluster::recount_open_members;
use exception_engine::store::commit_with_retry;
use exception_engine::triage::StepUpdate;
use exception_engine::types::{
  Candidate, ClusterId, ErrorOutput, ExceptionId, Severity, Status, StepId,
};
use exception_engine::{
  AutoCloseEngine, ClusterManager, Config, EngineError, ExceptionRouter, ExceptionStore,
  MemoryStore, TriageEngine,
};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Command {
  Ingest {
    candidate: Candidate,
    actor_id: String,
  },
  Assign {
    id: ExceptionId,
    role: String,
    actor_id: String,
  },
  ChangeSeverity {
    id: ExceptionId,
    severity: Severity,
    actor_id: String,
  },
  ChangeStatus {
    id: ExceptionId,
    status: Status,
    actor_id: String,
  },
  AddRemediationStep {
    id: ExceptionId,
    title: String,
    #[serde(default)]
    owner_role: Option<String>,
    actor_id: String,
  },
  UpdateRemediationStep {
    id: ExceptionId,
    step_id: StepId,
    update: StepUpdate,
    actor_id: String,
  },
  AddComment {
    id: ExceptionId,
    text: String,
    actor_id: String,
  },
  MarkSourceResolved {
    id: ExceptionId,
    resolved: bool,
    actor_id: String,
  },
  GetException {
    id: ExceptionId,
  },
  GetCluster {
    id: ClusterId,
  },
  GetClusterMembers {
    id: ClusterId,
  },
  AssignAll {
    cluster_id: ClusterId,
    role: String,
    actor_id: String,
  },
  CloseAll {
    cluster_id: ClusterId,
    actor_id: String,
  },
  Sweep,
}

struct Service {
  store: Arc<MemoryStore>,
  audit: Arc<StderrAuditSink>,
  config: Arc<Config>,
  router: ExceptionRouter,
  triage: TriageEngine,
  autoclose: AutoCloseEngine,
  clusters: ClusterManager,
}

impl Service {
  fn new() -> Self {
    let store = Arc::new(MemoryStore::new());
    let audit = Arc::new(StderrAuditSink);
    let config = Arc::new(Config::default());
    Self {
      router: ExceptionRouter::new(store.clone(), audit.clone(), config.clone()),
      triage: TriageEngine::new(config.clone()),
      autoclose: AutoCloseEngine::new(store.clone(), audit.clone(), config.clone()),
      clusters: ClusterManager::new(store.clone(), audit.clone(), config.clone()),
      store,
      audit,
      config,
    }
  }

  fn handle(&self, command: Command, now: DateTime<Utc>) -> Result<serde_json::Value, EngineError> {
    match command {
      Command::Ingest { candidate, actor_id } => {
        let outcome = self.router.ingest(&candidate, &actor_id, now)?;
        Ok(json!({
          "exception_id": outcome.exception.id,
          "cluster_id": outcome.cluster.id,
          "created_new_cluster": outcome.created_new_cluster,
        }))
      }
      Command::Assign { id, role, actor_id } => {
        let updated = self.commit(&id, |cur| self.triage.assign(cur, &role, &actor_id, now))?;
        Ok(serde_json::to_value(updated)?)
      }
      Command::ChangeSeverity { id, severity, actor_id } => {
        let updated =
          self.commit(&id, |cur| self.triage.change_severity(cur, severity, &actor_id, now))?;
        Ok(serde_json::to_value(updated)?)
      }
      Command::ChangeStatus { id, status, actor_id } => {
        let updated =
          self.commit(&id, |cur| self.triage.change_status(cur, status, &actor_id, now))?;
        // A single-member close changes the cluster's derived count too. The
        // status change already committed; a stale count waits for the next
        // recount rather than failing the command.
        if let Some(cluster_id) = &updated.cluster_id {
          if let Err(err) = recount_open_members(
            self.store.as_ref(),
            self.audit.as_ref(),
            cluster_id,
            self.config.max_write_attempts,
            &actor_id,
            now,
          ) {
            tracing::warn!(cluster = %cluster_id, error = %err, "recount failed after status change");
          }
        }
        Ok(serde_json::to_value(updated)?)
      }
      Command::AddRemediationStep { id, title, owner_role, actor_id } => {
        let updated = self.commit(&id, |cur| {
          self
            .triage
            .add_remediation_step(cur, &title, owner_role.as_deref(), &actor_id, now)
        })?;
        Ok(serde_json::to_value(updated)?)
      }
      Command::UpdateRemediationStep { id, step_id, update, actor_id } => {
        let updated = self.commit(&id, |cur| {
          self
            .triage
            .update_remediation_step(cur, &step_id, &update, &actor_id, now)
        })?;
        Ok(serde_json::to_value(updated)?)
      }
      Command::AddComment { id, text, actor_id } => {
        let updated = self.commit(&id, |cur| self.triage.add_comment(cur, &text, &actor_id, now))?;
        Ok(serde_json::to_value(updated)?)
      }
      Command::MarkSourceResolved { id, resolved, actor_id } => {
        let updated = self.autoclose.mark_source_resolved(&id, resolved, &actor_id, now)?;
        Ok(serde_json::to_value(updated)?)
      }
      Command::GetException { id } => {
        Ok(serde_json::to_value(self.store.get_exception(&id)?)?)
      }
      Command::GetCluster { id } => Ok(serde_json::to_value(self.store.get_cluster(&id)?)?),
      Command::GetClusterMembers { id } => {
        Ok(serde_json::to_value(self.store.cluster_members(&id)?)?)
      }
      Command::AssignAll { cluster_id, role, actor_id } => {
        let result = self.clusters.assign_all(&cluster_id, &role, &actor_id, now)?;
        Ok(serde_json::to_value(result)?)
      }
      Command::CloseAll { cluster_id, actor_id } => {
        let result = self.clusters.close_all(&cluster_id, &actor_id, now)?;
        Ok(serde_json::to_value(result)?)
      }
      Command::Sweep => {
        let report = self.autoclose.sweep(now)?;
        Ok(serde_json::to_value(report)?)
      }
    }
  }

  fn commit<F>(
    &self,
    id: &ExceptionId,
    apply: F,
  ) -> Result<exception_engine::Exception, EngineError>
  where
    F: Fn(
      &exception_engine::Exception,
    ) -> Result<exception_engine::store::Mutation<exception_engine::Exception>, EngineError>,
  {
    commit_with_retry(
      self.store.as_ref(),
      self.audit.as_ref(),
      id,
      self.config.max_write_attempts,
      apply,
    )
  }
}

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .with_writer(io::stderr)
    .init();

  let stdin = io::stdin();
  let stdout = io::stdout();
  let mut out = io::BufWriter::new(stdout.lock());
  let service = Service::new();

  for line in stdin.lock().lines() {
    let line = match line {
      Ok(l) => l,
      Err(e) => {
        let _ = writeln!(io::stderr(), "exception-engine: read error: {}", e);
        std::process::exit(1);
      }
    };

    // Skip blank lines.
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }

    let command: Command = match serde_json::from_str(trimmed) {
      Ok(v) => v,
      Err(e) => {
        let err = ErrorOutput::new("json", format!("json parse: {}", e));
        let _ = serde_json::to_writer(&mut out, &err);
        let _ = writeln!(out);
        continue;
      }
    };

    match service.handle(command, Utc::now()) {
      Ok(value) => {
        let _ = serde_json::to_writer(&mut out, &value);
        let _ = writeln!(out);
      }
      Err(e) => {
        let err = ErrorOutput::new(e.kind(), e.to_string());
        let _ = serde_json::to_writer(&mut out, &err);
        let _ = writeln!(out);
      }
    }
    let _ = out.flush();
  }

  let _ = out.flush();
}
