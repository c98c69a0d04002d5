//! Start/stop plumbing shared by the background loops.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::SyncError;

/// A spawned loop and the signal that stops it.
pub(crate) struct TaskHandle {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl TaskHandle {
    pub fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(shutdown_rx));
        Self {
            handle,
            shutdown_tx,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals the loop to stop and waits for it to finish.
    pub async fn shutdown(self) -> Result<(), SyncError> {
        // The loop may already have exited, in which case nobody is listening.
        let _ = self.shutdown_tx.send(true);
        self.handle
            .await
            .map_err(|e| SyncError::Lifecycle(format!("background task panicked: {}", e)))
    }
}

/// Sleeps for `delay`, returning early with `true` if shutdown was signalled.
pub(crate) async fn sleep_unless_shutdown(
    delay: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    if *shutdown_rx.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
    }
}

/// Whether shutdown has been signalled, or the signalling side is gone.
pub(crate) fn is_shutdown(shutdown_rx: &watch::Receiver<bool>) -> bool {
    *shutdown_rx.borrow() || shutdown_rx.has_changed().is_err()
}
