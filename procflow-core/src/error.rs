use thiserror::Error;

/// Coarse error classification used for propagation policy and retry
/// eligibility. Every `EngineError` maps onto exactly one kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input; caller error.
    Validation,
    /// Missing entity.
    NotFound,
    /// Current state does not permit the operation.
    Conflict,
    Permission,
    Timeout,
    /// Retry-eligible.
    Transient,
    /// Process is put into `error` status.
    Fatal,
    Cancelled,
}

/// Errors surfaced by the engine and its runtime infrastructure.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Batcher intake is full — backpressure, not a hard failure.
    #[error("batcher queue full")]
    QueueFull,

    /// A batched item was retried `max_retries` times and gave up.
    #[error("max retries exceeded: {0}")]
    MaxRetriesExceeded(String),

    /// The retry kernel exhausted `max_attempts`; wraps the last error.
    #[error("max attempts exceeded: {0}")]
    MaxAttemptsExceeded(String),
}

impl ErrorKind {
    /// Status code transport adapters map this kind to.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Permission => 403,
            ErrorKind::Timeout => 408,
            ErrorKind::Transient => 503,
            ErrorKind::Fatal => 500,
            ErrorKind::Cancelled => 499,
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::Permission(_) => ErrorKind::Permission,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::Transient(_) | EngineError::QueueFull => ErrorKind::Transient,
            EngineError::Fatal(_)
            | EngineError::MaxRetriesExceeded(_)
            | EngineError::MaxAttemptsExceeded(_) => ErrorKind::Fatal,
            EngineError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Timeout)
    }

    // ── Transient constructors for the retryable-error set ──

    pub fn database_timeout(detail: impl Into<String>) -> Self {
        EngineError::Transient(format!("database_timeout: {}", detail.into()))
    }

    pub fn lock_contention(key: impl Into<String>) -> Self {
        EngineError::Transient(format!("lock_contention: {}", key.into()))
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        EngineError::Transient(format!("transport: {}", detail.into()))
    }

    // ── Domain shorthands ──

    pub fn assignee_mismatch(operator: &str) -> Self {
        EngineError::Conflict(format!("operator {operator} is not an assignee"))
    }

    pub fn already_terminal(what: &str) -> Self {
        EngineError::Conflict(format!("{what} is already in a terminal state"))
    }

    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        EngineError::NotFound(format!("{what} {id}"))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_onto_variants() {
        assert_eq!(
            EngineError::Validation("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(EngineError::QueueFull.kind(), ErrorKind::Transient);
        assert_eq!(
            EngineError::MaxAttemptsExceeded("x".into()).kind(),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn http_mapping_follows_kind() {
        assert_eq!(EngineError::Validation("x".into()).kind().http_status(), 400);
        assert_eq!(EngineError::assignee_mismatch("b").kind().http_status(), 409);
        assert_eq!(EngineError::database_timeout("q").kind().http_status(), 503);
    }

    #[test]
    fn transient_constructors_are_retryable() {
        assert!(EngineError::database_timeout("q").is_retryable());
        assert!(EngineError::lock_contention("proc/1").is_retryable());
        assert!(EngineError::transport("reset").is_retryable());
        assert!(!EngineError::assignee_mismatch("bob").is_retryable());
    }
}
