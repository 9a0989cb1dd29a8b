use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::consumer::classifier::{DefaultFaultClassifier, FaultClassifier};
use crate::consumer::config::PoolConfig;
use crate::consumer::error::Result;
use crate::consumer::handler::MessageHandler;
use crate::consumer::lifecycle::{LifecycleController, PoolState, ShutdownReport};
use crate::consumer::worker::{run_worker, StatusSlot, WorkerContext, WorkerHandle, WorkerState, WorkerStatus};
use crate::source::{entity_path, MessageSource};

/// Pool of concurrent subscription workers
///
/// Each worker opens its own subscription on the source and runs the handler
/// for the messages it receives. Workers share nothing mutable; a failure in
/// one of them never reaches the others.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use topic_consumers::consumer::{handler_fn, HandlerError, Outcome, PoolConfig, WorkerPool};
/// use topic_consumers::source::{Credential, InMemoryBroker, Message};
///
/// async fn process(_msg: Message) -> Result<Outcome, HandlerError> {
///     Ok(Outcome::Complete)
/// }
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new("memory://local");
/// broker.create_subscription("orders", "billing");
///
/// let config = PoolConfig::new("orders", "billing", Credential::default()).with_worker_count(4);
/// let handle = WorkerPool::new(config, Arc::new(broker), handler_fn(process)).start()?;
///
/// let report = handle.stop(Duration::from_secs(30)).await;
/// println!("acknowledged {}", report.total_acknowledged());
/// # Ok(())
/// # }
/// ```
pub struct WorkerPool {
    config: PoolConfig,
    source: Arc<dyn MessageSource>,
    handler: MessageHandler,
    classifier: Arc<dyn FaultClassifier>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, source: Arc<dyn MessageSource>, handler: MessageHandler) -> Self {
        Self {
            config,
            source,
            handler,
            classifier: Arc::new(DefaultFaultClassifier),
        }
    }

    /// Replace the default fault classifier (builder pattern)
    pub fn with_classifier(mut self, classifier: Arc<dyn FaultClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Validate the configuration and spawn one task per worker
    ///
    /// Must be called from within a Tokio runtime. Nothing is spawned when
    /// the configuration is invalid.
    pub fn start(self) -> Result<PoolHandle> {
        self.config.validate()?;

        let controller = LifecycleController::new();
        controller.transition(PoolState::Starting)?;

        let config = Arc::new(self.config);
        let context = Arc::new(WorkerContext {
            config: Arc::clone(&config),
            namespace: self.source.namespace(),
            entity_path: entity_path(&config.topic, &config.subscription),
            source: self.source,
            handler: self.handler,
            classifier: self.classifier,
        });

        let (stop, stop_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut workers = Vec::with_capacity(config.worker_count);
        let mut statuses = Vec::with_capacity(config.worker_count);
        for index in 1..=config.worker_count {
            let (slot, status) = StatusSlot::new(index, events_tx.clone());
            let task = tokio::spawn(run_worker(Arc::clone(&context), slot, stop_rx.clone()));
            statuses.push(status.clone());
            workers.push(WorkerHandle::new(index, status, task));
        }
        // Only worker slots keep the event channel open
        drop(events_tx);

        controller.transition(PoolState::Running)?;
        controller.mark_supervising();
        let supervisor = tokio::spawn(controller.clone().supervise(statuses, events_rx));

        info!(
            workers = config.worker_count,
            namespace = %context.namespace,
            entity = %context.entity_path,
            max_delivery_count = config.max_delivery_count,
            "Consumer pool started"
        );

        Ok(PoolHandle {
            controller,
            workers,
            stop,
            supervisor,
        })
    }
}

/// Control surface of a started pool
///
/// Dropping the handle without calling [`PoolHandle::stop`] also signals the
/// workers to stop, but nobody waits for them.
pub struct PoolHandle {
    controller: LifecycleController,
    workers: Vec<WorkerHandle>,
    stop: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

impl PoolHandle {
    pub fn state(&self) -> PoolState {
        self.controller.state()
    }

    /// Watch pool state changes
    pub fn state_changes(&self) -> watch::Receiver<PoolState> {
        self.controller.subscribe()
    }

    /// Worker handles in index order
    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Running with at least one failed worker
    pub fn is_degraded(&self) -> bool {
        self.state() == PoolState::Running
            && self.workers.iter().any(|w| w.state() == WorkerState::Failed)
    }

    /// Wait until the pool fails or every worker has ended
    ///
    /// Returns `true` on total outage.
    pub async fn wait_for_outage(&self) -> bool {
        let mut state = self.controller.subscribe();

        tokio::select! {
            result = state.wait_for(|s| *s == PoolState::Failed) => result.is_ok(),
            _ = self.controller.supervision_finished() => self.state() == PoolState::Failed,
        }
    }

    /// Signal stop and wait up to `timeout` for the workers
    ///
    /// Idle workers stop at once, busy ones after their current message.
    /// Workers still busy at the deadline are aborted and reported `TimedOut`.
    pub async fn stop(self, timeout: Duration) -> ShutdownReport {
        info!(timeout_ms = timeout.as_millis() as u64, "Stopping consumer pool");

        if let Err(e) = self.controller.transition(PoolState::Draining) {
            debug!(error = %e, "Pool not running at stop");
        }
        self.stop.send_replace(true);

        let deadline = Instant::now() + timeout;
        let statuses = join_all(self.workers.into_iter().map(|w| w.join_until(deadline))).await;

        // Aborted workers never announce their end
        self.supervisor.abort();

        conclude(&self.controller, statuses)
    }

    /// Wait, without a deadline, for every worker to end on its own
    pub async fn await_termination(self) -> ShutdownReport {
        let statuses = join_all(self.workers.into_iter().map(WorkerHandle::join)).await;

        if let Err(e) = self.supervisor.await {
            warn!(error = %e, "Supervisor ended abnormally");
        }

        conclude(&self.controller, statuses)
    }
}

/// Settle the final pool state once every worker is terminal
fn conclude(controller: &LifecycleController, workers: Vec<WorkerStatus>) -> ShutdownReport {
    let all_failed = !workers.is_empty() && workers.iter().all(|w| w.state == WorkerState::Failed);

    let steps: &[PoolState] = if all_failed {
        &[PoolState::Failed]
    } else {
        &[PoolState::Draining, PoolState::Stopped]
    };
    for step in steps {
        if controller.state().can_transition_to(*step) {
            // Legal edge, cannot be rejected
            let _ = controller.transition(*step);
        }
    }

    let report = ShutdownReport {
        final_state: controller.state(),
        workers,
    };

    info!(
        state = ?report.final_state,
        acknowledged = report.total_acknowledged(),
        dead_lettered = report.total_dead_lettered(),
        retried = report.total_retried(),
        "Consumer pool stopped"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::handler::{handler_fn, HandlerError, Outcome};
    use crate::consumer::ConsumerError;
    use crate::source::{Credential, InMemoryBroker, Message};

    async fn complete(_msg: Message) -> std::result::Result<Outcome, HandlerError> {
        Ok(Outcome::Complete)
    }

    fn broker() -> Arc<InMemoryBroker> {
        let broker = InMemoryBroker::new("memory://test");
        broker.create_subscription("orders", "billing");
        Arc::new(broker)
    }

    #[tokio::test]
    async fn test_start_spawns_indexed_workers() {
        let config = PoolConfig::new("orders", "billing", Credential::default()).with_worker_count(5);
        let handle = WorkerPool::new(config, broker(), handler_fn(complete))
            .start()
            .unwrap();

        assert_eq!(handle.state(), PoolState::Running);
        let indices: Vec<usize> = handle.workers().iter().map(|w| w.index()).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);

        let report = handle.stop(Duration::from_secs(5)).await;
        assert_eq!(report.final_state, PoolState::Stopped);
        assert!(report.workers.iter().all(|w| w.state == WorkerState::Stopped));
    }

    #[tokio::test]
    async fn test_invalid_config_spawns_nothing() {
        let config = PoolConfig::new("orders", "", Credential::default());
        let result = WorkerPool::new(config, broker(), handler_fn(complete)).start();

        assert!(matches!(result, Err(ConsumerError::Config(_))));
    }

    #[test]
    fn test_conclude_without_failures_stops() {
        let controller = LifecycleController::new();
        controller.transition(PoolState::Starting).unwrap();
        controller.transition(PoolState::Running).unwrap();

        let report = conclude(&controller, Vec::new());
        assert_eq!(report.final_state, PoolState::Stopped);
    }
}
