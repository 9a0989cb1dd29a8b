use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, warn};

use crate::consumer::classifier::ErrorInfo;
use crate::consumer::handler::{Outcome, MAX_DELIVERY_EXCEEDED};
use crate::consumer::worker::{stop_requested, StatusSlot, WorkerContext, WorkerState};
use crate::source::{Message, SourceError, Subscription};

/// Attempts per settlement before the message is handed back to the source
const SETTLE_ATTEMPTS: u32 = 3;

/// Why a dispatch loop ended
#[derive(Debug)]
pub(crate) enum DispatchExit {
    /// Stop was signalled while the worker was between messages
    StopRequested,
    /// The source closed the subscription
    SourceClosed,
    /// A permanent or protocol error ended this worker
    Failed(ErrorInfo),
}

/// Receive loop of one worker
///
/// Pulls one message at a time from the worker's own subscription, runs the
/// handler and settles the message. A running handler is never interrupted:
/// a stop arriving meanwhile moves the worker to `Draining` and takes effect
/// once the message is settled.
pub(crate) struct Dispatcher<'a> {
    context: Arc<WorkerContext>,
    slot: &'a StatusSlot,
    subscription: Box<dyn Subscription>,
    stop: watch::Receiver<bool>,
}

impl<'a> Dispatcher<'a> {
    pub(crate) fn new(
        context: Arc<WorkerContext>,
        slot: &'a StatusSlot,
        subscription: Box<dyn Subscription>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            context,
            slot,
            subscription,
            stop,
        }
    }

    pub(crate) async fn run(&mut self) -> DispatchExit {
        loop {
            if *self.stop.borrow() {
                return DispatchExit::StopRequested;
            }

            let received = tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop) => return DispatchExit::StopRequested,
                received = self.subscription.receive() => received,
            };

            match received {
                Ok(Some(message)) => {
                    if let Err(exit) = self.process(message).await {
                        return exit;
                    }
                }
                Ok(None) => return DispatchExit::SourceClosed,
                Err(error) => {
                    if let Some(exit) = self.on_source_error(&error, "receive").await {
                        return exit;
                    }
                }
            }
        }
    }

    /// Give the subscription back to the source
    pub(crate) async fn close(&mut self) -> Result<(), SourceError> {
        self.subscription.close().await
    }

    async fn process(&mut self, message: Message) -> Result<(), DispatchExit> {
        let worker = self.slot.index();
        let max_delivery_count = self.context.config.max_delivery_count;
        let message_id = message.id.clone();
        let delivery_count = message.delivery_count;

        self.slot.update_stats(|stats| stats.received += 1);

        if delivery_count > max_delivery_count {
            warn!(
                worker,
                message_id = %message_id,
                delivery_count,
                "Delivery limit already exceeded; dead-lettering without invoking handler"
            );
            return self
                .settle(&message_id, Outcome::DeadLetter(MAX_DELIVERY_EXCEEDED.to_string()))
                .await;
        }

        let sequence_number = message.sequence_number;
        let invocation = AssertUnwindSafe((self.context.handler)(message)).catch_unwind();
        tokio::pin!(invocation);

        let mut draining = *self.stop.borrow();
        if draining {
            self.slot.transition(WorkerState::Draining);
        }
        let result = loop {
            tokio::select! {
                biased;
                result = &mut invocation => break result,
                _ = stop_requested(&mut self.stop), if !draining => {
                    draining = true;
                    self.slot.transition(WorkerState::Draining);
                    debug!(worker, message_id = %message_id, "Stop requested; finishing current message");
                }
            }
        };

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(
                    worker,
                    message_id = %message_id,
                    sequence_number,
                    delivery_count,
                    error = %e,
                    "Handler failed"
                );
                Outcome::Retry
            }
            Err(_) => {
                error!(
                    worker,
                    message_id = %message_id,
                    sequence_number,
                    delivery_count,
                    "Handler panicked"
                );
                Outcome::Retry
            }
        };

        let outcome = match outcome {
            Outcome::Retry if delivery_count >= max_delivery_count => {
                warn!(
                    worker,
                    message_id = %message_id,
                    delivery_count,
                    max_delivery_count,
                    "Delivery limit reached; dead-lettering"
                );
                Outcome::DeadLetter(MAX_DELIVERY_EXCEEDED.to_string())
            }
            other => other,
        };

        self.settle(&message_id, outcome).await
    }

    /// Settle a message, retrying transient failures of the same settlement
    async fn settle(&mut self, message_id: &str, outcome: Outcome) -> Result<(), DispatchExit> {
        let worker = self.slot.index();
        let mut attempt = 1;

        loop {
            let error = match self.settle_once(message_id, &outcome).await {
                Ok(()) => break,
                Err(error) => error,
            };

            if let Some(exit) = self.on_source_error(&error, "settle").await {
                return Err(exit);
            }

            // A lost lock cannot be settled by this receiver any more
            let lock_lost = matches!(error, SourceError::LockLost(_));
            if lock_lost || attempt >= SETTLE_ATTEMPTS {
                warn!(
                    worker,
                    message_id,
                    outcome = ?outcome,
                    attempts = attempt,
                    "Giving up on settlement"
                );
                if !lock_lost && outcome != Outcome::Retry {
                    self.release(message_id).await;
                }
                return Ok(());
            }
            attempt += 1;
        }

        debug!(worker, message_id, outcome = ?outcome, attempts = attempt, "Message settled");
        self.slot.update_stats(|stats| match outcome {
            Outcome::Complete => stats.completed += 1,
            Outcome::Retry => stats.retried += 1,
            Outcome::DeadLetter(_) => stats.dead_lettered += 1,
        });
        Ok(())
    }

    async fn settle_once(&mut self, message_id: &str, outcome: &Outcome) -> Result<(), SourceError> {
        match outcome {
            Outcome::Complete => self.subscription.ack(message_id).await,
            Outcome::Retry => self.subscription.abandon(message_id).await,
            Outcome::DeadLetter(reason) => self.subscription.dead_letter(message_id, reason).await,
        }
    }

    /// Hand an unsettled message back to the source for redelivery
    async fn release(&mut self, message_id: &str) {
        match self.subscription.abandon(message_id).await {
            Ok(()) => debug!(worker = self.slot.index(), message_id, "Message released for redelivery"),
            Err(e) => warn!(
                worker = self.slot.index(),
                message_id,
                error = %e,
                "Failed to release message; it returns when the subscription closes"
            ),
        }
    }

    /// Classify a source error; `Some` when the worker must stop
    async fn on_source_error(&mut self, error: &SourceError, operation: &str) -> Option<DispatchExit> {
        let info = self.context.classifier.describe(
            error,
            &self.context.namespace,
            &self.context.entity_path,
        );

        if info.category.is_fatal_to_worker() {
            return Some(DispatchExit::Failed(info));
        }

        warn!(
            worker = self.slot.index(),
            operation,
            namespace = %info.source_namespace,
            entity = %info.entity_path,
            cause = %info.cause,
            "Transient source error"
        );
        self.slot.record_error(info);
        self.slot.update_stats(|stats| stats.transient_errors += 1);

        // Back off, but let a stop request cut the wait short
        tokio::select! {
            biased;
            _ = stop_requested(&mut self.stop) => {}
            _ = time::sleep(self.context.config.retry_backoff) => {}
        }
        None
    }
}
