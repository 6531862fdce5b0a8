//! Drives one operation through build, exec and finalize.

use thiserror::Error;

use super::{Operation, OperationError};
use crate::executor::Executor;
use crate::pending::OperationStatus;
use crate::pending::reset::set_operation_status;

/// Failure of [`run_operation`], tagged with the phase that failed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunError {
    /// Build failed; nothing was changed.
    #[error("failed to build operation: {0}")]
    Build(OperationError),
    /// Remote execution failed and the attempt was rolled back.
    #[error("failed to execute operation: {0}")]
    Exec(OperationError),
    /// Remote work completed but its metadata could not be committed.
    #[error("failed to finalize operation: {0}")]
    Finalize(OperationError),
}

impl RunError {
    /// The underlying operation error.
    #[must_use]
    pub const fn inner(&self) -> &OperationError {
        match self {
            Self::Build(err) | Self::Exec(err) | Self::Finalize(err) => err,
        }
    }
}

/// Runs `op` to completion against `executor`.
///
/// A retryable exec failure is rolled back, rebuilt and retried up to the
/// operation's retry budget; rollback errors on that path are only logged.
/// Any other exec failure is rolled back once. When that rollback fails the
/// ledger entry is marked failed so the cleaner can finish the job.
///
/// # Errors
///
/// Returns [`RunError`] naming the phase that failed.
pub async fn run_operation(op: &mut dyn Operation, executor: &dyn Executor) -> Result<(), RunError> {
    op.build().map_err(RunError::Build)?;
    tracing::debug!(op = op.label(), op_id = %op.id(), "operation built");
    finish_operation(op, executor).await
}

/// Runs the exec and finalize phases of an operation that has already been
/// built, with the same retry and rollback rules as [`run_operation`].
///
/// # Errors
///
/// Returns [`RunError`] naming the phase that failed. A rebuild during a
/// retry can still fail with [`RunError::Build`].
pub async fn finish_operation(op: &mut dyn Operation, executor: &dyn Executor) -> Result<(), RunError> {
    let label = op.label();
    let mut retries = 0_u32;
    loop {
        match op.exec(executor).await {
            Ok(()) => break,
            Err(OperationError::Retryable(inner)) => {
                tracing::warn!(op = label, op_id = %op.id(), attempt = retries, error = %inner, "retryable exec failure");
                let rolled_back = rollback(op, executor).await;
                if retries >= op.max_retries() {
                    if !rolled_back {
                        mark_failed(op);
                    }
                    tracing::error!(op = label, op_id = %op.id(), retries, "operation retries exhausted");
                    return Err(RunError::Exec((*inner).into_inner()));
                }
                retries = retries.saturating_add(1);
                op.build().map_err(RunError::Build)?;
            }
            Err(err) => {
                tracing::error!(op = label, op_id = %op.id(), error = %err, "exec failed");
                if !rollback(op, executor).await {
                    mark_failed(op);
                }
                return Err(RunError::Exec(err));
            }
        }
    }

    op.finalize().map_err(|err| {
        tracing::error!(op = label, op_id = %op.id(), error = %err, "finalize failed");
        RunError::Finalize(err)
    })?;
    tracing::info!(op = label, op_id = %op.id(), "operation complete");
    Ok(())
}

async fn rollback(op: &mut dyn Operation, executor: &dyn Executor) -> bool {
    match op.rollback(executor).await {
        Ok(()) => true,
        Err(err) => {
            tracing::error!(op = op.label(), op_id = %op.id(), error = %err, "rollback failed");
            false
        }
    }
}

fn mark_failed(op: &dyn Operation) {
    match set_operation_status(&op.context().db, op.id(), OperationStatus::Failed) {
        Ok(true) => {
            tracing::warn!(op_id = %op.id(), "pending operation marked failed");
        }
        Ok(false) => {}
        Err(err) => {
            tracing::error!(op_id = %op.id(), error = %err, "unable to mark pending operation failed");
        }
    }
}
