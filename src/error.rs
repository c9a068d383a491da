use std::fmt;

use thiserror::Error;

use crate::transaction::TxnState;

/// Alias for a thread-safe boxed error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type DbResult<T> = Result<T, DbError>;

/// Errors surfaced by every operation of the database layer.
#[derive(Debug, Error)]
pub enum DbError {
    /// The requested record does not exist.
    #[error("record not found: {table}/{key}")]
    NotFound { table: String, key: String },

    /// Insert on a key that already exists.
    #[error("record already exists: {table}/{key}")]
    Duplicate { table: String, key: String },

    /// A transaction lost a write/write or read/write race at commit time.
    #[error("transaction conflict: {0}")]
    Conflict(String),

    /// Malformed arguments, rejected before any backend I/O.
    #[error("invalid arguments: {0}")]
    Validation(String),

    /// Operation invoked outside its required transaction state.
    #[error("cannot {op} a transaction in state {state}")]
    State { op: &'static str, state: TxnState },

    /// One or more elements of a batch failed.
    #[error(transparent)]
    Batch(#[from] BatchFailure),

    /// The call context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The call context deadline passed.
    #[error("operation timed out")]
    Timeout,

    /// The database instance has already been closed.
    #[error("database is closed")]
    Closed,

    /// Backend configuration problem.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Any underlying storage failure.
    #[error("backend error: {0}")]
    Backend(#[source] BoxError),
}

impl DbError {
    pub fn not_found(table: &str, key: &str) -> Self {
        Self::NotFound {
            table: table.to_string(),
            key: key.to_string(),
        }
    }

    pub fn duplicate(table: &str, key: &str) -> Self {
        Self::Duplicate {
            table: table.to_string(),
            key: key.to_string(),
        }
    }

    pub fn backend(err: impl Into<BoxError>) -> Self {
        Self::Backend(err.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<bincode::Error> for DbError {
    fn from(err: bincode::Error) -> Self {
        Self::Backend(err)
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::Backend(Box::new(err))
    }
}

/// Reports which elements of a batch failed.
///
/// `applied` counts elements whose effects are visible after the call; the
/// built-in backends are all-or-nothing, so for them it is always zero.
#[derive(Debug)]
pub struct BatchFailure {
    pub total: usize,
    pub applied: usize,
    pub failures: Vec<(usize, DbError)>,
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} batch elements failed ({} applied)",
            self.failures.len(),
            self.total,
            self.applied
        )?;
        if let Some((index, err)) = self.failures.first() {
            write!(f, "; first failure at index {}: {}", index, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchFailure {}

/// Configuration and backend-resolution errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown database backend {name:?} (registered: {})", .known.join(", "))]
    UnknownBackend { name: String, known: Vec<String> },

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidParam {
        key: String,
        value: String,
        reason: String,
    },

    #[error("malformed property {0:?}, expected key=value")]
    MalformedProperty(String),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
