//! Error taxonomy driving the retry / dead-letter policy.
//!
//! Stage handlers never catch-and-continue: they return a classified error
//! and the worker loop decides between abandoning the delivery (broker
//! redelivery with backoff) and dead-lettering it (terminal, operator
//! inspectable).

use thiserror::Error;

/// Classified failure of a single stage delivery.
#[derive(Debug, Error)]
pub enum StageError {
    /// Malformed message, missing owner, invalid plan. Dead-letter immediately.
    #[error("validation: {0}")]
    Validation(String),

    /// External hiccup (LLM 429/5xx, renderer timeout, broker blip). Abandon;
    /// the broker redelivers with backoff derived from the delivery count.
    #[error("transient: {0}")]
    Transient(String),

    /// External failure that survived in-handler retries. Abandon; the broker
    /// dead-letters once the delivery count is exhausted.
    #[error("durable: {0}")]
    Durable(String),

    /// Pipeline invariant violated (cycle over budget, cyclic plan). Dead-letter
    /// and mark the job errored.
    #[error("logic: {0}")]
    Logic(String),

    /// A dependency of this message is not persisted yet. The delivery is
    /// abandoned with a short visibility delay and no failure event.
    #[error("not ready: {0}")]
    NotReady(String),

    /// The job was cancelled. The delivery is dead-lettered with reason
    /// `cancelled` and no failure event.
    #[error("job cancelled")]
    Cancelled,
}

impl StageError {
    pub fn validation(msg: impl Into<String>) -> Self {
        StageError::Validation(msg.into())
    }

    pub fn transient(msg: impl std::fmt::Display) -> Self {
        StageError::Transient(msg.to_string())
    }

    pub fn durable(msg: impl std::fmt::Display) -> Self {
        StageError::Durable(msg.to_string())
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        StageError::Logic(msg.into())
    }

    /// Short kind tag recorded on `STAGE_FAILED` events.
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Validation(_) => "validation",
            StageError::Transient(_) => "transient",
            StageError::Durable(_) => "durable",
            StageError::Logic(_) => "logic",
            StageError::NotReady(_) => "not-ready",
            StageError::Cancelled => "cancelled",
        }
    }

    /// Whether the delivery should go straight to the dead-letter queue.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageError::Validation(_) | StageError::Logic(_) | StageError::Cancelled
        )
    }
}

impl From<anyhow::Error> for StageError {
    fn from(err: anyhow::Error) -> Self {
        StageError::Durable(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for StageError {
    fn from(err: serde_json::Error) -> Self {
        StageError::Validation(err.to_string())
    }
}

/// Errors surfaced by the kernel API to its caller (the HTTP layer).
#[derive(Debug, Error)]
pub enum KernelError {
    /// Owner mismatch. Never written to job state.
    #[error("not authorized")]
    NotAuthorized,

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_kinds() {
        assert!(StageError::validation("x").is_terminal());
        assert!(StageError::logic("x").is_terminal());
        assert!(!StageError::transient("x").is_terminal());
        assert!(!StageError::durable("x").is_terminal());
    }

    #[test]
    fn kind_tags() {
        assert_eq!(StageError::validation("x").kind(), "validation");
        assert_eq!(StageError::transient("x").kind(), "transient");
        assert_eq!(StageError::durable("x").kind(), "durable");
        assert_eq!(StageError::logic("x").kind(), "logic");
    }
}
