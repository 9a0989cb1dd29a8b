use serde::{Deserialize, Serialize};

use crate::source::SourceError;

/// What a source error means for the worker that saw it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Worker keeps running; the operation is retried after a backoff
    Transient,
    /// Worker stops its subscription and fails
    Permanent,
    /// Malformed protocol data; fatal to this worker only
    Protocol,
}

impl ErrorCategory {
    /// Whether a worker seeing this category must stop
    pub fn is_fatal_to_worker(self) -> bool {
        !matches!(self, ErrorCategory::Transient)
    }
}

/// Error description recorded on a worker and carried into the shutdown report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub category: ErrorCategory,
    pub source_namespace: String,
    pub entity_path: String,
    /// Rendered error message
    pub cause: String,
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} error from namespace '{}', entity '{}': {}",
            self.category, self.source_namespace, self.entity_path, self.cause
        )
    }
}

/// Decides how workers react to source errors
pub trait FaultClassifier: Send + Sync {
    fn classify(&self, error: &SourceError) -> ErrorCategory;

    /// Classify and attach namespace/entity context
    fn describe(&self, error: &SourceError, namespace: &str, entity_path: &str) -> ErrorInfo {
        ErrorInfo {
            category: self.classify(error),
            source_namespace: namespace.to_string(),
            entity_path: entity_path.to_string(),
            cause: error.to_string(),
        }
    }
}

/// Network and throttling problems are transient, authorization and missing
/// entities are permanent, malformed data is a protocol failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFaultClassifier;

impl FaultClassifier for DefaultFaultClassifier {
    fn classify(&self, error: &SourceError) -> ErrorCategory {
        match error {
            SourceError::Connection(_)
            | SourceError::Timeout(_)
            | SourceError::Busy(_)
            | SourceError::LockLost(_)
            | SourceError::Backend(_) => ErrorCategory::Transient,
            SourceError::Unauthorized(_)
            | SourceError::NotFound(_)
            | SourceError::EntityDisabled(_) => ErrorCategory::Permanent,
            SourceError::Protocol(_) => ErrorCategory::Protocol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(error: SourceError) -> ErrorCategory {
        DefaultFaultClassifier.classify(&error)
    }

    #[test]
    fn test_transient_errors() {
        assert_eq!(classify(SourceError::Connection("reset".into())), ErrorCategory::Transient);
        assert_eq!(classify(SourceError::Timeout("slow".into())), ErrorCategory::Transient);
        assert_eq!(classify(SourceError::Busy("throttled".into())), ErrorCategory::Transient);
        assert_eq!(classify(SourceError::LockLost("expired".into())), ErrorCategory::Transient);
        assert_eq!(classify(SourceError::Backend("odd".into())), ErrorCategory::Transient);
    }

    #[test]
    fn test_permanent_errors() {
        assert_eq!(classify(SourceError::Unauthorized("no".into())), ErrorCategory::Permanent);
        assert_eq!(classify(SourceError::NotFound("gone".into())), ErrorCategory::Permanent);
        assert_eq!(classify(SourceError::EntityDisabled("off".into())), ErrorCategory::Permanent);
    }

    #[test]
    fn test_protocol_errors() {
        let category = classify(SourceError::Protocol("bad frame".into()));
        assert_eq!(category, ErrorCategory::Protocol);
        assert!(category.is_fatal_to_worker());
        assert!(!ErrorCategory::Transient.is_fatal_to_worker());
    }

    #[test]
    fn test_describe_attaches_context() {
        let info = DefaultFaultClassifier.describe(
            &SourceError::NotFound("subscription".into()),
            "sb://example",
            "orders/subscriptions/billing",
        );

        assert_eq!(info.category, ErrorCategory::Permanent);
        assert_eq!(info.source_namespace, "sb://example");
        assert_eq!(info.entity_path, "orders/subscriptions/billing");
        assert!(info.cause.contains("subscription"));
        assert!(info.to_string().contains("orders/subscriptions/billing"));
    }
}
