use thiserror::Error;

/// Result type for Message DB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Message DB client operations
#[derive(Debug, Error)]
pub enum Error {
    /// Validation error - invalid input data or connection string
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Connection error - database unreachable or pool could not be built
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Database error - SQL errors, constraint violations
    ///
    /// `code` carries the SQLSTATE when the server reported one.
    #[error("Database error ({}): {message}", code.as_deref().unwrap_or("no sqlstate"))]
    DatabaseError {
        code: Option<String>,
        message: String,
    },

    /// Pool error - no connection could be checked out
    #[error("Pool error: {0}")]
    PoolError(String),

    /// A stored row could not be decoded into a message
    #[error("Malformed message row: {0}")]
    MalformedRow(String),
}

impl Error {
    /// SQLSTATE reported by PostgreSQL, if any
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::DatabaseError { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Convert tokio-postgres errors to Message DB errors
impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_error) = err.as_db_error() {
            return Error::DatabaseError {
                code: Some(db_error.code().code().to_string()),
                message: db_error.message().to_string(),
            };
        }

        // Closed sockets and I/O failures carry no SQLSTATE
        if err.is_closed() {
            return Error::ConnectionError(err.to_string());
        }

        Error::DatabaseError {
            code: err.code().map(|c| c.code().to_string()),
            message: format!("{:?}", err),
        }
    }
}

/// Convert deadpool errors to Message DB errors
impl From<deadpool_postgres::PoolError> for Error {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        match err {
            // Authentication failures surface while the pool creates a connection
            deadpool_postgres::PoolError::Backend(inner) => Error::from(inner),
            other => Error::PoolError(other.to_string()),
        }
    }
}

/// Convert deadpool build errors to Message DB errors
impl From<deadpool_postgres::BuildError> for Error {
    fn from(err: deadpool_postgres::BuildError) -> Self {
        Error::ConnectionError(err.to_string())
    }
}

/// Convert JSON errors to Message DB errors
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::MalformedRow(format!("JSON error: {}", err))
    }
}
