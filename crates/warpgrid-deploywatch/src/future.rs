//! Single-assignment result handle shared by every caller of one batch.

use tokio::sync::watch;

use crate::error::{WatchError, WatchResult};

/// Resolves to the commit index of an evaluation batch, or the error that
/// batch failed with.
///
/// Exactly one producer calls [`set`](Self::set); any number of consumers
/// may await [`results`](Self::results) before or after that, and all of
/// them observe the same value.
#[derive(Debug)]
pub struct EvalFuture {
    slot: watch::Sender<Option<WatchResult<u64>>>,
}

impl EvalFuture {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// A future that is already resolved with `result`.
    pub fn resolved(result: WatchResult<u64>) -> Self {
        let (slot, _) = watch::channel(Some(result));
        Self { slot }
    }

    /// Resolve the future and wake every waiter.
    ///
    /// # Panics
    ///
    /// Panics if the future was already resolved; a batch has exactly one
    /// commit outcome.
    pub fn set(&self, result: WatchResult<u64>) {
        let first = self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        });
        assert!(first, "EvalFuture resolved twice");
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Wait for the batch outcome.
    pub async fn results(&self) -> WatchResult<u64> {
        let mut rx = self.slot.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone().unwrap_or(Err(WatchError::Cancelled)),
            // Unreachable while `self` owns the sender.
            Err(_) => Err(WatchError::Cancelled),
        }
    }
}

impl Default for EvalFuture {
    fn default() -> Self {
        Self::new()
    }
}
