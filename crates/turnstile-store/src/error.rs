#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("version conflict: expected {expected}, found {actual}")]
    Conflict { expected: i64, actual: i64 },

    #[error("invalid delta: {0}")]
    InvalidDelta(String),

    #[error("quota exceeded: balance {balance} + delta {delta} > cap {max_tokens}")]
    QuotaExceeded {
        balance: i64,
        delta: i64,
        max_tokens: i64,
    },

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
