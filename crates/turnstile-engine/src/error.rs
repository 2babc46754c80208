use turnstile_store::StoreError;

/// Errors surfaced to operator-facing callers. Classified so the console
/// layer knows what is safe to retry with the same idempotency key.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("quota exceeded: balance {balance} + {delta} > cap {max_tokens}")]
    QuotaExceeded {
        balance: i64,
        delta: i64,
        max_tokens: i64,
    },

    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    /// Retry with the same idempotency key is safe for these.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Unavailable(_))
    }

    /// Wire code for the HTTP error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::Unavailable(_) => "UNAVAILABLE",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(msg) => Self::NotFound(msg),
            StoreError::Conflict { expected, actual } => {
                Self::Conflict(format!("expected version {expected}, found {actual}"))
            }
            StoreError::InvalidDelta(msg) => Self::Validation(msg),
            StoreError::QuotaExceeded {
                balance,
                delta,
                max_tokens,
            } => Self::QuotaExceeded {
                balance,
                delta,
                max_tokens,
            },
            StoreError::Database(msg) | StoreError::Io(msg) => Self::Unavailable(msg),
            StoreError::CorruptRow { .. } => Self::Unavailable(e.to_string()),
        }
    }
}
