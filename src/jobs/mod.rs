//! Runs operations off the request path.
//!
//! [`JobQueue::start`] builds an operation on the caller's task, so
//! validation and conflict errors come back immediately, then spawns the
//! exec and finalize phases. Callers poll [`JobQueue::status`] or await
//! [`JobQueue::wait`]. Every running job holds a slot in the shared
//! [`OpTracker`], which bounds concurrency and keeps the cleaner from
//! marking the job's ledger entry stale.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::cleaner::{OpClass, OpTracker};
use crate::executor::Executor;
use crate::operations::{Operation, OperationError, RunError, finish_operation};

/// Progress of one job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobStatus {
    /// Exec or finalize is still in progress.
    Running,
    /// The operation completed.
    Succeeded,
    /// The operation failed after it was accepted.
    Failed(RunError),
}

impl JobStatus {
    /// Returns `true` once the job has stopped.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Starts operations in the background and tracks their outcome.
#[derive(Clone)]
pub struct JobQueue {
    executor: Arc<dyn Executor>,
    tracker: Arc<OpTracker>,
    jobs: Arc<Mutex<BTreeMap<String, watch::Receiver<JobStatus>>>>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("tracker", &self.tracker)
            .field("jobs", &self.jobs.lock().len())
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    /// Creates a queue running against `executor`, sharing `tracker` with
    /// the cleaner.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>, tracker: Arc<OpTracker>) -> Self {
        Self {
            executor,
            tracker,
            jobs: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Tracker shared by the queue's jobs.
    #[must_use]
    pub const fn tracker(&self) -> &Arc<OpTracker> {
        &self.tracker
    }

    /// Builds `op` and spawns the rest of it on the current tokio runtime,
    /// returning the job id, which is the operation id.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Build`] with
    /// [`OperationError::TooManyOperations`] when the tracker is saturated,
    /// or with the build error itself. Nothing is spawned in either case.
    pub fn start(&self, mut op: Box<dyn Operation>) -> Result<String, RunError> {
        let id = op.id().to_owned();
        if self.tracker.throttle_or_add(&id, OpClass::Normal) {
            tracing::warn!(op = op.label(), op_id = %id, limit = self.tracker.limit(), "operation throttled");
            return Err(RunError::Build(OperationError::TooManyOperations));
        }
        if let Err(err) = op.build() {
            self.tracker.remove(&id);
            tracing::debug!(op = op.label(), op_id = %id, error = %err, "operation rejected");
            return Err(RunError::Build(err));
        }

        let (status_tx, status_rx) = watch::channel(JobStatus::Running);
        self.jobs.lock().insert(id.clone(), status_rx);

        let executor = Arc::clone(&self.executor);
        let tracker = Arc::clone(&self.tracker);
        let job_id = id.clone();
        tokio::spawn(async move {
            let result = finish_operation(op.as_mut(), executor.as_ref()).await;
            tracker.remove(&job_id);
            let status = match result {
                Ok(()) => JobStatus::Succeeded,
                Err(err) => {
                    tracing::warn!(op_id = %job_id, error = %err, "job failed");
                    JobStatus::Failed(err)
                }
            };
            status_tx.send_replace(status);
        });
        tracing::debug!(op_id = %id, "job started");
        Ok(id)
    }

    /// Current status of job `id`, or `None` for an unknown id.
    #[must_use]
    pub fn status(&self, id: &str) -> Option<JobStatus> {
        self.jobs.lock().get(id).map(|rx| rx.borrow().clone())
    }

    /// Waits until job `id` stops and returns its final status.
    pub async fn wait(&self, id: &str) -> Option<JobStatus> {
        let mut rx = self.jobs.lock().get(id).cloned()?;
        // The sender lives until the job publishes its last status, so a
        // closed channel still holds the final value.
        let waited = rx
            .wait_for(JobStatus::is_finished)
            .await
            .map(|status| status.clone());
        Some(waited.unwrap_or_else(|_| rx.borrow().clone()))
    }

    /// Drops the records of finished jobs, returning how many went.
    pub fn forget_finished(&self) -> usize {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, rx| !rx.borrow().is_finished());
        before.saturating_sub(jobs.len())
    }
}
