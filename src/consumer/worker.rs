use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{error, info, warn};

use crate::consumer::classifier::{ErrorInfo, FaultClassifier};
use crate::consumer::config::PoolConfig;
use crate::consumer::dispatcher::{DispatchExit, Dispatcher};
use crate::consumer::handler::MessageHandler;
use crate::source::{MessageSource, SubscribeRequest, Subscription};

/// Per-worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerState {
    Starting,
    Running,
    Draining,
    Stopped,
    Failed,
    /// Still busy when the shutdown timeout expired; the task was aborted
    TimedOut,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkerState::Stopped | WorkerState::Failed | WorkerState::TimedOut
        )
    }
}

/// Message counters of one worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub received: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub transient_errors: u64,
}

/// Snapshot of a worker, also its entry in the shutdown report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub index: usize,
    pub state: WorkerState,
    pub last_error: Option<ErrorInfo>,
    pub stats: WorkerStats,
}

impl WorkerStatus {
    fn starting(index: usize) -> Self {
        Self {
            index,
            state: WorkerState::Starting,
            last_error: None,
            stats: WorkerStats::default(),
        }
    }
}

/// State change announced to the lifecycle supervisor
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerEvent {
    pub index: usize,
    pub state: WorkerState,
}

/// Write side of a worker's status; owned by the worker task alone
pub(crate) struct StatusSlot {
    index: usize,
    status: watch::Sender<WorkerStatus>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl StatusSlot {
    pub(crate) fn new(
        index: usize,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> (Self, watch::Receiver<WorkerStatus>) {
        let (status, receiver) = watch::channel(WorkerStatus::starting(index));
        (
            Self {
                index,
                status,
                events,
            },
            receiver,
        )
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Move to `state`; terminal states are final
    pub(crate) fn transition(&self, state: WorkerState) {
        let changed = self.status.send_if_modified(|status| {
            if status.state == state || status.state.is_terminal() {
                return false;
            }
            status.state = state;
            true
        });

        if changed {
            // Supervisor gone means the pool is shutting down anyway
            let _ = self.events.send(WorkerEvent {
                index: self.index,
                state,
            });
        }
    }

    pub(crate) fn record_error(&self, info: ErrorInfo) {
        self.status.send_modify(|status| status.last_error = Some(info));
    }

    pub(crate) fn update_stats(&self, update: impl FnOnce(&mut WorkerStats)) {
        self.status.send_modify(|status| update(&mut status.stats));
    }
}

/// A running worker as seen by the pool
pub struct WorkerHandle {
    index: usize,
    status: watch::Receiver<WorkerStatus>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn new(
        index: usize,
        status: watch::Receiver<WorkerStatus>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            index,
            status,
            task,
        }
    }

    /// 1-based, unique and stable for the pool's lifetime
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> WorkerState {
        self.status.borrow().state
    }

    pub fn last_error(&self) -> Option<ErrorInfo> {
        self.status.borrow().last_error.clone()
    }

    pub fn stats(&self) -> WorkerStats {
        self.status.borrow().stats.clone()
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    /// Watch this worker's status
    pub fn status_changes(&self) -> watch::Receiver<WorkerStatus> {
        self.status.clone()
    }

    /// Wait for the worker task with no deadline
    pub(crate) async fn join(mut self) -> WorkerStatus {
        match (&mut self.task).await {
            Ok(()) => self.status(),
            Err(e) => {
                error!(worker = self.index, error = %e, "Worker task ended abnormally");
                terminated(self.status(), WorkerState::Failed)
            }
        }
    }

    /// Wait for the worker task until `deadline`, aborting it afterwards
    pub(crate) async fn join_until(mut self, deadline: Instant) -> WorkerStatus {
        match time::timeout_at(deadline, &mut self.task).await {
            Ok(Ok(())) => self.status(),
            Ok(Err(e)) => {
                error!(worker = self.index, error = %e, "Worker task ended abnormally");
                terminated(self.status(), WorkerState::Failed)
            }
            Err(_) => {
                warn!(
                    worker = self.index,
                    "Worker still busy at shutdown deadline; aborting"
                );
                self.task.abort();
                terminated(self.status(), WorkerState::TimedOut)
            }
        }
    }
}

fn terminated(mut status: WorkerStatus, state: WorkerState) -> WorkerStatus {
    if !status.state.is_terminal() {
        status.state = state;
    }
    status
}

/// Everything a worker task shares with its siblings, read-only
pub(crate) struct WorkerContext {
    pub config: Arc<PoolConfig>,
    pub source: Arc<dyn MessageSource>,
    pub handler: MessageHandler,
    pub classifier: Arc<dyn FaultClassifier>,
    pub namespace: String,
    pub entity_path: String,
}

/// Resolve once stop has been requested or the pool handle is gone
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Body of one worker task
pub(crate) async fn run_worker(
    context: Arc<WorkerContext>,
    slot: StatusSlot,
    mut stop: watch::Receiver<bool>,
) {
    let index = slot.index();

    let Some(subscription) = open_subscription(&context, &slot, &mut stop).await else {
        return;
    };

    slot.transition(WorkerState::Running);
    info!(worker = index, entity = %context.entity_path, "Worker running");

    let mut dispatcher = Dispatcher::new(Arc::clone(&context), &slot, subscription, stop);
    let exit = dispatcher.run().await;

    match exit {
        DispatchExit::StopRequested | DispatchExit::SourceClosed => {
            slot.transition(WorkerState::Draining);
            if let Err(e) = dispatcher.close().await {
                warn!(worker = index, error = %e, "Failed to close subscription cleanly");
            }
            slot.transition(WorkerState::Stopped);
            info!(worker = index, reason = ?exit, "Worker stopped");
        }
        DispatchExit::Failed(info) => {
            error!(
                worker = index,
                category = ?info.category,
                namespace = %info.source_namespace,
                entity = %info.entity_path,
                cause = %info.cause,
                "Worker failed"
            );
            slot.record_error(info);
            if let Err(e) = dispatcher.close().await {
                warn!(worker = index, error = %e, "Failed to close subscription after failure");
            }
            slot.transition(WorkerState::Failed);
        }
    }
}

/// Subscribe, retrying transient failures until stop is requested
///
/// Returns `None` when the worker reached a terminal state instead.
async fn open_subscription(
    context: &WorkerContext,
    slot: &StatusSlot,
    stop: &mut watch::Receiver<bool>,
) -> Option<Box<dyn Subscription>> {
    let config = &context.config;

    loop {
        let request = SubscribeRequest {
            topic: config.topic.clone(),
            subscription: config.subscription.clone(),
            credential: config.credential.clone(),
            worker_index: slot.index(),
            worker_count: config.worker_count,
        };

        let result = tokio::select! {
            biased;
            _ = stop_requested(stop) => {
                slot.transition(WorkerState::Stopped);
                return None;
            }
            result = context.source.subscribe(request) => result,
        };

        let error = match result {
            Ok(subscription) => return Some(subscription),
            Err(error) => error,
        };

        let info = context
            .classifier
            .describe(&error, &context.namespace, &context.entity_path);

        if info.category.is_fatal_to_worker() {
            error!(
                worker = slot.index(),
                category = ?info.category,
                namespace = %info.source_namespace,
                entity = %info.entity_path,
                cause = %info.cause,
                "Subscribe failed"
            );
            slot.record_error(info);
            slot.transition(WorkerState::Failed);
            return None;
        }

        warn!(
            worker = slot.index(),
            namespace = %info.source_namespace,
            entity = %info.entity_path,
            cause = %info.cause,
            "Subscribe failed; retrying"
        );
        slot.record_error(info);
        slot.update_stats(|stats| stats.transient_errors += 1);

        tokio::select! {
            biased;
            _ = stop_requested(stop) => {
                slot.transition(WorkerState::Stopped);
                return None;
            }
            _ = time::sleep(config.retry_backoff) => {}
        }
    }
}
