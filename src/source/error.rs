use thiserror::Error;

use crate::message_db;

/// Errors raised by a message source or one of its subscriptions
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// Network failure, dropped link, refused connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation did not complete in time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Broker is throttling or temporarily overloaded
    #[error("Service busy: {0}")]
    Busy(String),

    /// The lock on an in-flight message expired or was released
    #[error("Message lock lost: {0}")]
    LockLost(String),

    /// Credentials were rejected
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Topic, subscription or backing store does not exist
    #[error("Entity not found: {0}")]
    NotFound(String),

    /// Entity exists but does not accept receivers
    #[error("Entity disabled: {0}")]
    EntityDisabled(String),

    /// Malformed frames or stored data
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Anything the backend could not describe more precisely
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Map Message DB client errors by kind and SQLSTATE class
impl From<message_db::Error> for SourceError {
    fn from(err: message_db::Error) -> Self {
        use message_db::Error as DbError;

        let text = err.to_string();
        match &err {
            DbError::ConnectionError(_) => SourceError::Connection(text),
            DbError::PoolError(_) => SourceError::Busy(text),
            DbError::ValidationError(_) => SourceError::Unauthorized(text),
            DbError::MalformedRow(_) => SourceError::Protocol(text),
            DbError::DatabaseError { code, .. } => match code.as_deref() {
                Some(c) if c.starts_with("28") => SourceError::Unauthorized(text),
                Some("3D000") | Some("42P01") | Some("42883") | Some("3F000") => {
                    SourceError::NotFound(text)
                }
                Some("42501") => SourceError::Unauthorized(text),
                Some(c) if c.starts_with("08") => SourceError::Connection(text),
                Some("57014") => SourceError::Timeout(text),
                Some(c) if c.starts_with("53") || c == "57P03" => SourceError::Busy(text),
                Some(c) if c.starts_with("22") => SourceError::Protocol(text),
                _ => SourceError::Backend(text),
            },
        }
    }
}
