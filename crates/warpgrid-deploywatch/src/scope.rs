//! Cancellation scopes.
//!
//! A scope is a `watch` channel carrying a stop flag. The sender is owned by
//! whoever may terminate the scope; every task bound to it holds a receiver.
//! Flipping the flag to `true` (or dropping the sender) cancels the scope.

use tokio::sync::watch;

/// Create a fresh, uncancelled scope.
pub fn new_scope() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolve once the scope is cancelled.
pub async fn cancelled(scope: &mut watch::Receiver<bool>) {
    // A dropped sender can never un-cancel, so treat it as cancellation.
    let _ = scope.wait_for(|stop| *stop).await;
}

/// Whether the scope has already been cancelled.
pub fn is_cancelled(scope: &watch::Receiver<bool>) -> bool {
    *scope.borrow() || scope.has_changed().is_err()
}
