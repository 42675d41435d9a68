//! Evaluation batcher: coalesces evaluation creation into periodic writes.
//!
//! Callers hand evaluations to [`EvalBatcher::create_eval`] and get back the
//! [`EvalFuture`] of the current window. A background task ticks at a fixed
//! period; on a tick with pending evaluations it detaches the window, commits
//! every deployment's latest evaluation in one `upsert_evals` call and
//! resolves the window's future with the outcome. Ticks with nothing pending
//! do nothing.
//!
//! ```text
//!            create_eval                tick (pending)
//!   Idle ───────────────▶ Accumulating ───────────────▶ commit ─▶ Idle
//!     │                        │
//!     └──── scope cancelled ───┴──▶ Closed (pending future → Cancelled)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use warpgrid_state::{DeploymentId, Evaluation};

use crate::endpoints::DeploymentRaftEndpoints;
use crate::error::WatchError;
use crate::future::EvalFuture;
use crate::scope::cancelled;

/// Evaluations collected since the last commit, sharing one future.
struct Window {
    future: Arc<EvalFuture>,
    /// Latest evaluation per deployment.
    evals: HashMap<DeploymentId, Evaluation>,
}

#[derive(Default)]
struct BatchState {
    window: Option<Window>,
    closed: bool,
}

/// Batches evaluation creation for one epoch.
pub struct EvalBatcher {
    state: Arc<Mutex<BatchState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EvalBatcher {
    /// Start a batcher committing through `raft` every `period` until `scope`
    /// is cancelled.
    pub fn new(
        raft: Arc<dyn DeploymentRaftEndpoints>,
        period: Duration,
        scope: watch::Receiver<bool>,
    ) -> Self {
        let state = Arc::new(Mutex::new(BatchState::default()));
        let task = tokio::spawn(run_batcher(state.clone(), raft, period, scope));
        Self {
            state,
            task: Mutex::new(Some(task)),
        }
    }

    /// Add an evaluation to the current window.
    ///
    /// A later evaluation for the same deployment within the window replaces
    /// the earlier one. Once the batcher's scope is cancelled the returned
    /// future is already resolved with [`WatchError::Cancelled`].
    pub fn create_eval(&self, eval: Evaluation) -> Arc<EvalFuture> {
        let mut state = lock(&self.state);
        if state.closed {
            return Arc::new(EvalFuture::resolved(Err(WatchError::Cancelled)));
        }
        let window = state.window.get_or_insert_with(|| Window {
            future: Arc::new(EvalFuture::new()),
            evals: HashMap::new(),
        });
        window.evals.insert(eval.deployment_id.clone(), eval);
        window.future.clone()
    }

    /// Number of distinct deployments waiting in the current window.
    pub fn pending(&self) -> usize {
        lock(&self.state)
            .window
            .as_ref()
            .map_or(0, |w| w.evals.len())
    }

    /// Take the background task handle so the owner can join it.
    pub fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

fn lock(state: &Mutex<BatchState>) -> MutexGuard<'_, BatchState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_batcher(
    state: Arc<Mutex<BatchState>>,
    raft: Arc<dyn DeploymentRaftEndpoints>,
    period: Duration,
    mut scope: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancelled(&mut scope) => {
                let abandoned = {
                    let mut state = lock(&state);
                    state.closed = true;
                    state.window.take()
                };
                if let Some(window) = abandoned {
                    debug!(pending = window.evals.len(), "eval batcher cancelled with pending evaluations");
                    window.future.set(Err(WatchError::Cancelled));
                }
                return;
            }
            _ = ticker.tick() => {
                let detached = lock(&state).window.take();
                let Some(window) = detached else {
                    continue;
                };
                let evals: Vec<Evaluation> = window.evals.into_values().collect();
                let count = evals.len();
                let result = raft.upsert_evals(evals).await;
                match &result {
                    Ok(index) => debug!(count, index, "committed evaluation batch"),
                    Err(e) => warn!(count, error = %e, "failed to commit evaluation batch"),
                }
                window.future.set(result);
            }
        }
    }
}
