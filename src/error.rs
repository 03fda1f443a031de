use thiserror::Error;

/// s3-courier errors
#[derive(Debug, Error)]
pub enum CourierError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Configuration file errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing upload or bucket configuration
    #[error("{0}")]
    Configuration(String),

    /// Object store transfer errors
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Content tree errors
    #[error("Content error: {0}")]
    Content(String),

    /// Validation errors (names, sizes, etc.)
    #[error("Validation error: {0}")]
    Validation(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The run was cancelled at a checkpoint
    #[error("Upload was cancelled.")]
    Cancelled,

    /// The upload service has been closed
    #[error("Upload service is closed.")]
    Closed,

    /// Mutex poison error
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    /// Broken internal invariant
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, CourierError>;

impl CourierError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CourierError::Cancelled)
    }
}

impl<T> From<std::sync::PoisonError<T>> for CourierError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        CourierError::LockPoisoned(err.to_string())
    }
}

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn context(self, msg: &str) -> Result<T>;
}

impl<T, E: Into<CourierError>> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| {
            let err: CourierError = e.into();
            match err {
                CourierError::Other(s) => CourierError::Other(format!("{}: {}", msg, s)),
                CourierError::Config(s) => CourierError::Config(format!("{}: {}", msg, s)),
                CourierError::Transfer(s) => CourierError::Transfer(format!("{}: {}", msg, s)),
                CourierError::Content(s) => CourierError::Content(format!("{}: {}", msg, s)),
                CourierError::Validation(s) => {
                    CourierError::Validation(format!("{}: {}", msg, s))
                }
                CourierError::LockPoisoned(s) => {
                    CourierError::LockPoisoned(format!("{}: {}", msg, s))
                }
                // Configuration messages are matched on verbatim by callers
                other => other,
            }
        })
    }
}
