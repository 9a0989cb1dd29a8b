use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::source::Message;

/// Reason recorded when a message runs out of deliveries
pub const MAX_DELIVERY_EXCEEDED: &str = "MaxDeliveryExceeded";

/// What the handler wants done with a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Processed; acknowledge it
    Complete,
    /// Leave it for redelivery
    Retry,
    /// Move it to the dead-letter holding area
    DeadLetter(String),
}

/// Error raised by a handler; treated like [`Outcome::Retry`]
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Caller-supplied message processing
///
/// Invoked concurrently from every worker with no ordering or thread
/// affinity guarantees.
pub type MessageHandler =
    Arc<dyn Fn(Message) -> BoxFuture<'static, Result<Outcome, HandlerError>> + Send + Sync>;

/// Wrap an async function or closure as a [`MessageHandler`]
///
/// # Example
///
/// ```
/// use topic_consumers::consumer::{handler_fn, HandlerError, Outcome};
/// use topic_consumers::source::Message;
///
/// async fn process(msg: Message) -> Result<Outcome, HandlerError> {
///     match msg.body_str() {
///         Some(_) => Ok(Outcome::Complete),
///         None => Ok(Outcome::DeadLetter("body is not UTF-8".to_string())),
///     }
/// }
///
/// let handler = handler_fn(process);
/// ```
pub fn handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, HandlerError>> + Send + 'static,
{
    Arc::new(
        move |message| -> BoxFuture<'static, Result<Outcome, HandlerError>> {
            Box::pin(f(message))
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handler_fn_invokes_closure() {
        async fn accept_ok(msg: Message) -> Result<Outcome, HandlerError> {
            if msg.body_str() == Some("ok") {
                Ok(Outcome::Complete)
            } else {
                Err("unexpected body".into())
            }
        }
        let handler = handler_fn(accept_ok);

        let outcome = handler(Message::new("1", 1, "ok")).await.unwrap();
        assert_eq!(outcome, Outcome::Complete);

        let err = handler(Message::new("2", 2, "nope")).await.unwrap_err();
        assert_eq!(err.to_string(), "unexpected body");
    }
}
