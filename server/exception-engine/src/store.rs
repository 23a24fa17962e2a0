//! Storage seam: the engine talks to a narrow trait, not a concrete
//! collection store, so the host system can plug in its own persistence.
//!
//! Writes are compare-and-swap on the record `version` (single writer per
//! exception); a lost race is `ConcurrentModificationError`, and
//! [`commit_with_retry`] re-reads and re-applies up to a bounded count.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::audit::{AuditEvent, AuditSink};
use crate::error::EngineError;
use crate::types::{ClusterId, DedupKey, Exception, ExceptionCluster, ExceptionId};

/// Result of a pure transform: the new value plus the audit entries that
/// describe it. Audit is recorded only after the value wins its write.
#[derive(Debug, Clone)]
pub struct Mutation<T> {
  pub value: T,
  pub audit: Vec<AuditEvent>,
}

impl<T> Mutation<T> {
  pub fn unchanged(value: T) -> Self {
    Self { value, audit: Vec::new() }
  }

  pub fn changed(value: T, audit: Vec<AuditEvent>) -> Self {
    Self { value, audit }
  }
}

/// Narrow persistence contract for exceptions and clusters.
///
/// `update_*` methods expect the caller to pass back the version it read;
/// they reject stale versions and bump the version on success. Records are
/// never deleted.
pub trait ExceptionStore: Send + Sync {
  fn insert_exception(&self, exception: Exception) -> Result<(), EngineError>;
  fn get_exception(&self, id: &ExceptionId) -> Result<Exception, EngineError>;
  /// Compare-and-swap write; `exception.version` must match the stored
  /// version. Returns the stored copy with its bumped version.
  fn update_exception(&self, exception: Exception) -> Result<Exception, EngineError>;
  /// All exceptions with a non-terminal status, ordered oldest first.
  fn list_open_exceptions(&self) -> Result<Vec<Exception>, EngineError>;

  fn insert_cluster(&self, cluster: ExceptionCluster) -> Result<(), EngineError>;
  fn get_cluster(&self, id: &ClusterId) -> Result<ExceptionCluster, EngineError>;
  fn update_cluster(&self, cluster: ExceptionCluster) -> Result<ExceptionCluster, EngineError>;
  /// The open cluster for a dedup key, if any. At most one cluster per key
  /// is open at a time; a closed key may be re-opened by a new cluster.
  fn find_open_cluster(&self, key: &DedupKey) -> Result<Option<ExceptionCluster>, EngineError>;
  fn cluster_members(&self, id: &ClusterId) -> Result<Vec<Exception>, EngineError>;
}

/// Read-transform-write loop with bounded retry on version conflicts.
///
/// A transform that returns its input unchanged performs no write and records
/// no audit, which is what makes sweep and idempotent re-applies free.
pub fn commit_with_retry<F>(
  store: &dyn ExceptionStore,
  audit: &dyn AuditSink,
  id: &ExceptionId,
  max_attempts: u32,
  apply: F,
) -> Result<Exception, EngineError>
where
  F: Fn(&Exception) -> Result<Mutation<Exception>, EngineError>,
{
  let mut attempts = 0;
  loop {
    let current = store.get_exception(id)?;
    let mutation = apply(&current)?;
    if mutation.value == current {
      return Ok(current);
    }
    match store.update_exception(mutation.value) {
      Ok(stored) => {
        for event in mutation.audit {
          audit.record(event);
        }
        return Ok(stored);
      }
      Err(err) if err.is_retryable() && attempts + 1 < max_attempts => {
        tracing::debug!(id = %id, attempt = attempts + 1, "write conflict, retrying");
        attempts += 1;
      }
      Err(err) => return Err(err),
    }
  }
}

/// Cluster counterpart of [`commit_with_retry`].
pub fn commit_cluster_with_retry<F>(
  store: &dyn ExceptionStore,
  audit: &dyn AuditSink,
  id: &ClusterId,
  max_attempts: u32,
  apply: F,
) -> Result<ExceptionCluster, EngineError>
where
  F: Fn(&ExceptionCluster) -> Result<Mutation<ExceptionCluster>, EngineError>,
{
  let mut attempts = 0;
  loop {
    let current = store.get_cluster(id)?;
    let mutation = apply(&current)?;
    if mutation.value == current {
      return Ok(current);
    }
    match store.update_cluster(mutation.value) {
      Ok(stored) => {
        for event in mutation.audit {
          audit.record(event);
        }
        return Ok(stored);
      }
      Err(err) if err.is_retryable() && attempts + 1 < max_attempts => {
        attempts += 1;
      }
      Err(err) => return Err(err),
    }
  }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
  exceptions: HashMap<ExceptionId, Exception>,
  clusters: HashMap<ClusterId, ExceptionCluster>,
}

/// In-memory `ExceptionStore` for the binary, embedded use, and tests.
#[derive(Default)]
pub struct MemoryStore {
  inner: Mutex<Inner>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl ExceptionStore for MemoryStore {
  fn insert_exception(&self, exception: Exception) -> Result<(), EngineError> {
    let mut inner = self.inner.lock().unwrap();
    inner.exceptions.insert(exception.id.clone(), exception);
    Ok(())
  }

  fn get_exception(&self, id: &ExceptionId) -> Result<Exception, EngineError> {
    let inner = self.inner.lock().unwrap();
    inner
      .exceptions
      .get(id)
      .cloned()
      .ok_or_else(|| EngineError::NotFound(format!("exception {}", id)))
  }

  fn update_exception(&self, mut exception: Exception) -> Result<Exception, EngineError> {
    let mut inner = self.inner.lock().unwrap();
    let stored = inner
      .exceptions
      .get(&exception.id)
      .ok_or_else(|| EngineError::NotFound(format!("exception {}", exception.id)))?;
    if stored.version != exception.version {
      return Err(EngineError::ConcurrentModification {
        id: exception.id.to_string(),
        expected: exception.version,
        found: stored.version,
      });
    }
    exception.version += 1;
    inner.exceptions.insert(exception.id.clone(), exception.clone());
    Ok(exception)
  }

  fn list_open_exceptions(&self) -> Result<Vec<Exception>, EngineError> {
    let inner = self.inner.lock().unwrap();
    let mut open: Vec<Exception> = inner
      .exceptions
      .values()
      .filter(|e| !e.status.is_terminal())
      .cloned()
      .collect();
    open.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.0.cmp(&b.id.0)));
    Ok(open)
  }

  fn insert_cluster(&self, cluster: ExceptionCluster) -> Result<(), EngineError> {
    let mut inner = self.inner.lock().unwrap();
    inner.clusters.insert(cluster.id.clone(), cluster);
    Ok(())
  }

  fn get_cluster(&self, id: &ClusterId) -> Result<ExceptionCluster, EngineError> {
    let inner = self.inner.lock().unwrap();
    inner
      .clusters
      .get(id)
      .cloned()
      .ok_or_else(|| EngineError::NotFound(format!("cluster {}", id)))
  }

  fn update_cluster(&self, mut cluster: ExceptionCluster) -> Result<ExceptionCluster, EngineError> {
    let mut inner = self.inner.lock().unwrap();
    let stored = inner
      .clusters
      .get(&cluster.id)
      .ok_or_else(|| EngineError::NotFound(format!("cluster {}", cluster.id)))?;
    if stored.version != cluster.version {
      return Err(EngineError::ConcurrentModification {
        id: cluster.id.to_string(),
        expected: cluster.version,
        found: stored.version,
      });
    }
    cluster.version += 1;
    inner.clusters.insert(cluster.id.clone(), cluster.clone());
    Ok(cluster)
  }

  fn find_open_cluster(&self, key: &DedupKey) -> Result<Option<ExceptionCluster>, EngineError> {
    let inner = self.inner.lock().unwrap();
    let mut open: Vec<&ExceptionCluster> = inner
      .clusters
      .values()
      .filter(|c| c.dedup_key == *key && c.is_open())
      .collect();
    open.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(open.first().map(|c| (*c).clone()))
  }

  fn cluster_members(&self, id: &ClusterId) -> Result<Vec<Exception>, EngineError> {
    let inner = self.inner.lock().unwrap();
    let cluster = inner
      .clusters
      .get(id)
      .ok_or_else(|| EngineError::NotFound(format!("cluster {}", id)))?;
    cluster
      .member_ids
      .iter()
      .map(|mid| {
        inner
          .exceptions
          .get(mid)
          .cloned()
          .ok_or_else(|| EngineError::NotFound(format!("exception {}", mid)))
      })
      .collect()
  }
}
