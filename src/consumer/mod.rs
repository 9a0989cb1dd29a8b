//! Concurrent consumer group
//!
//! [`WorkerPool`] starts a fixed number of workers against one topic
//! subscription. Each worker owns its subscription, pulls one message at a
//! time and hands it to the caller's [`MessageHandler`]:
//!
//! - [`Outcome::Complete`] acknowledges the message
//! - [`Outcome::Retry`], a handler error or a panic leaves it for redelivery
//! - [`Outcome::DeadLetter`] moves it aside with a reason
//!
//! A message is never handed to the handler more than
//! [`PoolConfig::max_delivery_count`] times; after that it is dead-lettered
//! with reason [`MAX_DELIVERY_EXCEEDED`].
//!
//! Source errors are classified by a [`FaultClassifier`]. Transient ones are
//! retried by the worker that saw them; anything else fails that worker only.
//! The pool as a whole fails once every worker has failed.

pub mod classifier;
pub mod config;
mod dispatcher;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod pool;
pub mod worker;

pub use classifier::{DefaultFaultClassifier, ErrorCategory, ErrorInfo, FaultClassifier};
pub use config::{PoolConfig, DEFAULT_MAX_DELIVERY_COUNT, DEFAULT_WORKER_COUNT};
pub use error::{ConsumerError, Result};
pub use handler::{handler_fn, HandlerError, MessageHandler, Outcome, MAX_DELIVERY_EXCEEDED};
pub use lifecycle::{LifecycleController, PoolState, ShutdownReport};
pub use pool::{PoolHandle, WorkerPool};
pub use worker::{WorkerHandle, WorkerState, WorkerStats, WorkerStatus};
