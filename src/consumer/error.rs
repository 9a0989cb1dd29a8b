//! Error types for the consumer pool

use thiserror::Error;

use crate::consumer::lifecycle::PoolState;

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Errors raised by the pool itself
///
/// Per-worker failures are not errors of the pool: they are recorded on the
/// worker and surface through the shutdown report.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Invalid configuration; the pool was not started
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle state machine rejected a transition
    #[error("Invalid pool transition from {from:?} to {to:?}")]
    InvalidTransition { from: PoolState, to: PoolState },
}
