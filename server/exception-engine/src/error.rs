//! Structured error types for the exception engine.
//!
//! Three classes, per the triage contract: validation errors reject a single
//! operation with no partial state; state errors reject transitions the state
//! machine forbids; concurrency errors are retryable. Nothing here is fatal to
//! the host process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("unknown category: {0}")]
  UnknownCategory(String),

  #[error("invalid signature: {0}")]
  InvalidSignature(String),

  #[error("remediation step not found: {0}")]
  StepNotFound(String),

  #[error("invalid transition: {reason}")]
  InvalidTransition { reason: String },

  #[error("concurrent modification of {id} (expected version {expected}, found {found})")]
  ConcurrentModification { id: String, expected: u64, found: u64 },

  #[error("not found: {0}")]
  NotFound(String),

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),
}

impl EngineError {
  pub fn invalid_transition(reason: impl Into<String>) -> Self {
    Self::InvalidTransition { reason: reason.into() }
  }

  /// Retryable errors: re-read and re-apply instead of surfacing.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::ConcurrentModification { .. })
  }

  /// Stable machine-readable tag for structured output.
  pub fn kind(&self) -> &'static str {
    match self {
      Self::UnknownCategory(_) => "unknown_category",
      Self::InvalidSignature(_) => "invalid_signature",
      Self::StepNotFound(_) => "step_not_found",
      Self::InvalidTransition { .. } => "invalid_transition",
      Self::ConcurrentModification { .. } => "concurrent_modification",
      Self::NotFound(_) => "not_found",
      Self::Json(_) => "json",
    }
  }
}
