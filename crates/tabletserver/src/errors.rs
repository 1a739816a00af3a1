use std::fmt;

use crate::types::TxId;

/// Storage engine error number for a duplicate key.
pub const ERR_DUP_ENTRY: u16 = 1062;

/// How a caller should react to a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    /// Transient. Retry, possibly against another tablet.
    Retry,
    /// Don't retry against this tablet without re-resolving it.
    Fatal,
    /// The transaction pool is full. A `Retry` surfaced separately for
    /// targeted backoff.
    TxPoolFull,
    /// The request itself is invalid.
    Fail,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 4] = [
        ErrorKind::Retry,
        ErrorKind::Fatal,
        ErrorKind::TxPoolFull,
        ErrorKind::Fail,
    ];

    /// Name used when publishing per-kind counters.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Retry => "Retry",
            ErrorKind::Fatal => "Fatal",
            ErrorKind::TxPoolFull => "TxPoolFull",
            ErrorKind::Fail => "Fail",
        }
    }

    pub const fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Retry | ErrorKind::TxPoolFull)
    }

    pub(crate) const fn index(&self) -> usize {
        match self {
            ErrorKind::Retry => 0,
            ErrorKind::Fatal => 1,
            ErrorKind::TxPoolFull => 2,
            ErrorKind::Fail => 3,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self {
            ErrorKind::Retry => "retry",
            ErrorKind::Fatal => "fatal",
            ErrorKind::TxPoolFull => "tx_pool_full",
            ErrorKind::Fail => "error",
        };
        write!(f, "{prefix}")
    }
}

/// Error returned from every public operation of the query service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TabletError {
    kind: ErrorKind,
    message: String,
    /// Error number reported by the storage engine, if any.
    sql_error: Option<u16>,
}

impl TabletError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        TabletError {
            kind,
            message: message.into(),
            sql_error: None,
        }
    }

    pub fn with_sql_error(mut self, code: u16) -> Self {
        self.sql_error = Some(code);
        self
    }

    /// Append the statement or operation that triggered this error.
    pub fn with_context(mut self, context: impl fmt::Display) -> Self {
        self.message = format!("{}, context: {context}", self.message);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn sql_error(&self) -> Option<u16> {
        self.sql_error
    }

    pub fn is_dup_entry(&self) -> bool {
        self.sql_error == Some(ERR_DUP_ENTRY)
    }
}

pub type Result<T, E = TabletError> = std::result::Result<T, E>;

/// Errors reported by the storage engine collaborators.
///
/// These never leave the crate as-is, every public operation converts them
/// into a [`TabletError`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("transaction pool connection limit exceeded")]
    TxPoolFull,

    #[error("transaction {0}: not found")]
    TxNotFound(TxId),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("cancelled")]
    Cancelled,

    #[error("{message} (errno {code})")]
    Sql { code: u16, message: String },

    #[error("{0}")]
    Other(String),
}

pub type BackendResult<T, E = BackendError> = std::result::Result<T, E>;

impl From<BackendError> for TabletError {
    fn from(err: BackendError) -> Self {
        let kind = match &err {
            BackendError::Connection(_) => ErrorKind::Fatal,
            BackendError::PoolExhausted(_) | BackendError::Cancelled => ErrorKind::Retry,
            BackendError::TxPoolFull => ErrorKind::TxPoolFull,
            BackendError::TxNotFound(_)
            | BackendError::DeadlineExceeded
            | BackendError::Sql { .. }
            | BackendError::Other(_) => ErrorKind::Fail,
        };
        let tablet_err = TabletError::new(kind, err.to_string());
        match err {
            BackendError::Sql { code, .. } => tablet_err.with_sql_error(code),
            _ => tablet_err,
        }
    }
}

macro_rules! retry {
    ($($arg:tt)*) => {
        $crate::errors::TabletError::new(
            $crate::errors::ErrorKind::Retry,
            std::format!($($arg)*),
        )
    };
}
pub(crate) use retry;

macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::errors::TabletError::new(
            $crate::errors::ErrorKind::Fatal,
            std::format!($($arg)*),
        )
    };
}
pub(crate) use fatal;

macro_rules! fail {
    ($($arg:tt)*) => {
        $crate::errors::TabletError::new(
            $crate::errors::ErrorKind::Fail,
            std::format!($($arg)*),
        )
    };
}
pub(crate) use fail;
