//! Periodic cleaner task.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::OperationCleaner;

/// Runs an [`OperationCleaner`] on a timer.
///
/// The first sweep happens after `start_delay` and only cleans: entries
/// this process created are too young to be stale. Every later tick marks
/// stale entries first and then cleans.
#[derive(Debug)]
pub struct BackgroundCleaner {
    cleaner: OperationCleaner,
    start_delay: Duration,
    interval: Duration,
}

/// Stops a started [`BackgroundCleaner`].
#[derive(Debug)]
pub struct CleanerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CleanerHandle {
    /// Signals the loop and waits for the current sweep to finish.
    pub async fn stop(self) {
        if self.stop.send(true).is_err() {
            tracing::debug!("background cleaner already stopped");
        }
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "background cleaner task failed");
        }
    }
}

impl BackgroundCleaner {
    /// Wraps `cleaner`.
    #[must_use]
    pub const fn new(cleaner: OperationCleaner, start_delay: Duration, interval: Duration) -> Self {
        Self {
            cleaner,
            start_delay,
            interval,
        }
    }

    /// Spawns the loop on the current tokio runtime.
    #[must_use]
    pub fn start(self) -> CleanerHandle {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        tracing::info!("background cleaner started");
        CleanerHandle { stop, task }
    }

    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    return;
                }
            }
            () = tokio::time::sleep(self.start_delay) => {
                self.sweep(false).await;
            }
        }
        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                () = tokio::time::sleep(self.interval) => {
                    self.sweep(true).await;
                }
            }
        }
        tracing::info!("background cleaner stopped");
    }

    async fn sweep(&self, mark: bool) {
        if mark && let Err(err) = self.cleaner.mark_stale() {
            tracing::warn!(error = %err, "unable to mark stale operations");
        }
        if let Err(err) = self.cleaner.clean().await {
            tracing::warn!(error = %err, "background clean failed");
        }
    }
}
