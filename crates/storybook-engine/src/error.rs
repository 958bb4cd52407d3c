use std::time::Duration;

use storybook_contracts::outcome::{FailureClass, TaskFailure};
use thiserror::Error;

/// Why a single generation call (or a whole retried task) did not produce
/// an image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("transient failure: {0}")]
    TransientFailure(String),
    #[error("content rejected: {0}")]
    ContentRejected(String),
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<GenerationError>,
    },
}

impl GenerationError {
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            Self::InvalidRequest(_) => FailureClass::InvalidRequest,
            Self::RateLimited { .. } => FailureClass::RateLimited,
            Self::TransientFailure(_) => FailureClass::TransientFailure,
            Self::ContentRejected(_) => FailureClass::ContentRejected,
            Self::DeadlineExceeded(_) => FailureClass::DeadlineExceeded,
            Self::RetriesExhausted { .. } => FailureClass::RetriesExhausted,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    /// Provider-supplied minimum wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn to_failure(&self) -> TaskFailure {
        let mut failure = TaskFailure::new(self.class(), self.to_string());
        if let Self::RetriesExhausted { last, .. } = self {
            failure.last_class = Some(last.class());
        }
        failure
    }
}

/// Errors that abort a whole job before any task runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{0}")]
    UnsupportedModel(String),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use storybook_contracts::outcome::FailureClass;

    use super::GenerationError;

    #[test]
    fn only_throttling_and_transient_errors_retry() {
        assert!(GenerationError::rate_limited("slow down", None).is_retryable());
        assert!(GenerationError::TransientFailure("502".to_string()).is_retryable());
        assert!(!GenerationError::InvalidRequest("bad size".to_string()).is_retryable());
        assert!(!GenerationError::ContentRejected("blocked".to_string()).is_retryable());
        assert!(!GenerationError::DeadlineExceeded("late".to_string()).is_retryable());
    }

    #[test]
    fn exhausted_failure_keeps_last_class() {
        let err = GenerationError::RetriesExhausted {
            attempts: 3,
            last: Box::new(GenerationError::rate_limited(
                "429",
                Some(Duration::from_secs(2)),
            )),
        };
        let failure = err.to_failure();
        assert_eq!(failure.class, FailureClass::RetriesExhausted);
        assert_eq!(failure.last_class, Some(FailureClass::RateLimited));
        assert!(failure.message.contains("3 attempts"));
        assert_eq!(err.retry_after(), None);
    }
}
