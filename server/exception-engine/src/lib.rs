//! Exception Triage & Clustering Engine — deterministic, rule-based.
//!
//! Ingests raised exceptions from producing modules, normalizes their
//! signatures, groups recurring occurrences by stable fingerprint into
//! clusters, drives each exception through a triage state machine with SLA
//! timers, and auto-closes exceptions once their source condition clears.
//!
//! No AI, no DB, no network; pure computation + a pluggable store.

pub mod audit;
pub mod autoclose;
pub mod cluster;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod normalize;
pub mod router;
pub mod store;
pub mod triage;
pub mod types;

pub use audit::{AuditEvent, AuditSink, MemoryAuditSink};
pub use autoclose::{AutoCloseEngine, SYSTEM_ACTOR};
pub use cluster::ClusterManager;
pub use config::Config;
pub use error::EngineError;
pub use router::ExceptionRouter;
pub use store::{ExceptionStore, MemoryStore};
pub use triage::TriageEngine;
pub use types::{BulkResult, Candidate, Exception, ExceptionCluster, IngestOutcome, SweepReport};
