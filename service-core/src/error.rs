use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    /// A write collided with a uniqueness constraint.
    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    /// Replicated data is not yet visible; the triggering message should be retried.
    #[error("Too early: {reason}")]
    TooEarly {
        reason: String,
        retry_after_secs: Option<u64>,
    },

    #[error("Too many requests: {0}")]
    TooManyRequests(String, Option<u64>),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Bad Gateway: {0}")]
    BadGateway(String),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    /// Short label used for error counters.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "validation",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::TooEarly { .. } => "too_early",
            AppError::TooManyRequests(..) => "too_many_requests",
            AppError::InternalError(_) => "internal",
            AppError::BadGateway(_) => "bad_gateway",
            AppError::DatabaseError(_) => "database",
            AppError::ConfigError(_) => "config",
        }
    }

    /// Whether the caller should negatively acknowledge and redeliver the trigger.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::TooEarly { .. } | AppError::TooManyRequests(..) | AppError::BadGateway(_)
        )
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(anyhow::Error::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_early_is_retryable() {
        let err = AppError::TooEarly {
            reason: "replica behind".to_string(),
            retry_after_secs: Some(5),
        };
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "too_early");
    }

    #[test]
    fn test_conflict_is_not_retryable() {
        let err = AppError::Conflict(anyhow::anyhow!("duplicate display name"));
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Conflict: duplicate display name");
    }
}
