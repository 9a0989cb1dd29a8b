//! Pool lifecycle state machine and shutdown reporting

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::consumer::classifier::ErrorCategory;
use crate::consumer::error::{ConsumerError, Result};
use crate::consumer::worker::{WorkerEvent, WorkerState, WorkerStatus};

/// Lifecycle state of the whole pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolState {
    Idle,
    Starting,
    Running,
    Draining,
    Stopped,
    /// Every worker failed
    Failed,
}

impl PoolState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PoolState::Stopped | PoolState::Failed)
    }

    /// Edges of the pool state machine
    pub fn can_transition_to(self, next: PoolState) -> bool {
        use PoolState::*;

        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Running)
                | (Running, Draining)
                | (Draining, Stopped)
                | (Running, Failed)
                | (Draining, Failed)
        )
    }
}

/// Owns the pool state and rejects illegal transitions
#[derive(Clone)]
pub struct LifecycleController {
    state: Arc<watch::Sender<PoolState>>,
    supervising: Arc<watch::Sender<bool>>,
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleController {
    pub fn new() -> Self {
        let (state, _) = watch::channel(PoolState::Idle);
        let (supervising, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
            supervising: Arc::new(supervising),
        }
    }

    pub fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    /// Watch pool state changes
    pub fn subscribe(&self) -> watch::Receiver<PoolState> {
        self.state.subscribe()
    }

    /// Apply `next`, or fail with [`ConsumerError::InvalidTransition`]
    pub fn transition(&self, next: PoolState) -> Result<()> {
        let mut rejected = None;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                rejected = Some(*current);
                false
            }
        });

        match rejected {
            Some(from) => Err(ConsumerError::InvalidTransition { from, to: next }),
            None => {
                debug!(state = ?next, "Pool state changed");
                Ok(())
            }
        }
    }

    /// Whether the supervisor task is still watching workers
    pub fn is_supervising(&self) -> bool {
        *self.supervising.borrow()
    }

    pub(crate) fn mark_supervising(&self) {
        self.supervising.send_replace(true);
    }

    /// Resolve once the supervisor has finished
    pub(crate) async fn supervision_finished(&self) {
        let mut supervising = self.supervising.subscribe();
        // A closed channel means the controller is gone; nothing left to wait for
        let _ = supervising.wait_for(|active| !*active).await;
    }

    /// Watch worker events and move the pool to `Failed` on total outage
    ///
    /// Ends once every worker has reached a terminal state or the pool itself
    /// has.
    pub(crate) async fn supervise(
        self,
        workers: Vec<watch::Receiver<WorkerStatus>>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        let total = workers.len();
        let mut degraded_reported = 0;

        while let Some(event) = events.recv().await {
            debug!(worker = event.index, state = ?event.state, "Worker state changed");

            let states: Vec<WorkerState> = workers.iter().map(|w| w.borrow().state).collect();
            let failed = states.iter().filter(|s| **s == WorkerState::Failed).count();

            if failed == total {
                error!(workers = total, "All workers failed; pool is down");
                match self.transition(PoolState::Failed) {
                    Ok(()) => {}
                    // Already stopped cleanly by a racing shutdown
                    Err(e) => debug!(error = %e, "Outage not recorded"),
                }
                break;
            }

            if failed > degraded_reported {
                warn!(failed, workers = total, "Pool degraded");
                degraded_reported = failed;
            }

            if states.iter().all(|s| s.is_terminal()) || self.state().is_terminal() {
                break;
            }
        }

        self.supervising.send_replace(false);
        info!(state = ?self.state(), "Supervisor finished");
    }
}

/// Final account of a pool run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub final_state: PoolState,
    pub workers: Vec<WorkerStatus>,
}

impl ShutdownReport {
    pub fn total_acknowledged(&self) -> u64 {
        self.workers.iter().map(|w| w.stats.completed).sum()
    }

    pub fn total_dead_lettered(&self) -> u64 {
        self.workers.iter().map(|w| w.stats.dead_lettered).sum()
    }

    pub fn total_retried(&self) -> u64 {
        self.workers.iter().map(|w| w.stats.retried).sum()
    }

    /// Error categories of failed workers, deduplicated
    pub fn failed_categories(&self) -> Vec<ErrorCategory> {
        let categories: BTreeSet<_> = self
            .workers
            .iter()
            .filter(|w| w.state == WorkerState::Failed)
            .filter_map(|w| w.last_error.as_ref())
            .map(|e| e.category)
            .collect();
        categories.into_iter().collect()
    }

    pub fn is_total_outage(&self) -> bool {
        self.final_state == PoolState::Failed
    }

    /// Process exit code: 1 on total outage, 0 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.is_total_outage() {
            1
        } else {
            0
        }
    }

    pub fn worker(&self, index: usize) -> Option<&WorkerStatus> {
        self.workers.iter().find(|w| w.index == index)
    }
}
