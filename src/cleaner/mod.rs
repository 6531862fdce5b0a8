//! Crash recovery for abandoned operations.
//!
//! [`OperationCleaner`] finds ledger entries nobody owns any more, rebuilds
//! their operations and replays `clean` then `clean_done`. Entries become
//! eligible by being marked stale: at start-up for everything left by a
//! previous process, and periodically for entries older than the stale age
//! that this process is not tracking. [`BackgroundCleaner`] runs the sweep
//! on a timer.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::db::DbError;
use crate::executor::Executor;
use crate::operations::{
    CleanableOperation, OperationContext, OperationError, load_operation,
};
use crate::pending::query::filter_entries;
use crate::pending::{OperationStatus, PendingOperationEntry, unix_now};

mod background;
mod tracker;

pub use background::{BackgroundCleaner, CleanerHandle};
pub use tracker::{OpClass, OpTracker};

/// Age after which an untracked `New` entry is presumed abandoned.
pub const DEFAULT_STALE_AGE: Duration = Duration::from_secs(60);

/// Errors raised by a sweep as a whole. Failures of individual entries are
/// logged and counted instead.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CleanerError {
    /// Marking entries stale needs to know which ones are still running.
    #[error("marking operations stale requires an operation tracker")]
    MissingTracker,
    /// Store access failed.
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Which ledger entries a sweep considers.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum Selector {
    /// Every stale or failed entry.
    #[default]
    Reapable,
    /// Stale or failed entries whose id is in the set.
    Ids(BTreeSet<String>),
}

impl Selector {
    /// Selects the given ids, or every reapable entry when `ids` is empty.
    #[must_use]
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = ids.into_iter().map(Into::into).collect();
        if set.is_empty() {
            Self::Reapable
        } else {
            Self::Ids(set)
        }
    }

    /// Returns `true` when `entry` is part of the sweep.
    #[must_use]
    pub fn matches(&self, entry: &PendingOperationEntry) -> bool {
        let reapable = matches!(
            entry.status,
            OperationStatus::Stale | OperationStatus::Failed
        );
        match self {
            Self::Reapable => reapable,
            Self::Ids(ids) => reapable && ids.contains(&entry.id),
        }
    }
}

/// Outcome counts of one sweep.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CleanSummary {
    /// Entries cleaned and removed.
    pub cleaned: usize,
    /// Entries whose cleanup failed; they stay for a later sweep.
    pub failed: usize,
    /// Entries skipped because the tracker was saturated.
    pub throttled: usize,
    /// Entries that could not be loaded or are not cleanable.
    pub skipped: usize,
}

/// Replays cleanup for selected ledger entries.
#[derive(Clone)]
pub struct OperationCleaner {
    ctx: OperationContext,
    executor: Arc<dyn Executor>,
    selector: Selector,
    tracker: Option<Arc<OpTracker>>,
    class: OpClass,
    stale_age: Duration,
}

impl std::fmt::Debug for OperationCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationCleaner")
            .field("selector", &self.selector)
            .field("tracker", &self.tracker)
            .field("class", &self.class)
            .field("stale_age", &self.stale_age)
            .finish_non_exhaustive()
    }
}

impl OperationCleaner {
    /// Creates an untracked cleaner for every reapable entry, suitable for an
    /// offline sweep.
    #[must_use]
    pub fn new(ctx: OperationContext, executor: Arc<dyn Executor>) -> Self {
        Self {
            ctx,
            executor,
            selector: Selector::Reapable,
            tracker: None,
            class: OpClass::Clean,
            stale_age: DEFAULT_STALE_AGE,
        }
    }

    /// Restricts the sweep.
    #[must_use]
    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    /// Shares `tracker` with the rest of the process, registering cleanups
    /// under `class`.
    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<OpTracker>, class: OpClass) -> Self {
        self.tracker = Some(tracker);
        self.class = class;
        self
    }

    /// Overrides the age after which untracked entries are marked stale.
    #[must_use]
    pub const fn with_stale_age(mut self, stale_age: Duration) -> Self {
        self.stale_age = stale_age;
        self
    }

    /// Context the cleaner loads operations with.
    #[must_use]
    pub const fn context(&self) -> &OperationContext {
        &self.ctx
    }

    /// Marks untracked `New` entries older than the stale age as `Stale`,
    /// returning how many changed.
    ///
    /// # Errors
    ///
    /// Returns [`CleanerError::MissingTracker`] when no tracker is configured,
    /// or a store error.
    pub fn mark_stale(&self) -> Result<usize, CleanerError> {
        self.mark_stale_at(unix_now())
    }

    /// [`OperationCleaner::mark_stale`] evaluated at `now` Unix seconds.
    ///
    /// # Errors
    ///
    /// As for [`OperationCleaner::mark_stale`].
    pub fn mark_stale_at(&self, now: i64) -> Result<usize, CleanerError> {
        let Some(tracker) = self.tracker.as_deref() else {
            return Err(CleanerError::MissingTracker);
        };
        let age = i64::try_from(self.stale_age.as_secs()).unwrap_or(i64::MAX);
        let marked = self.ctx.db.update(|tx| {
            let candidates = filter_entries(tx, |entry| {
                entry.status == OperationStatus::New
                    && now.saturating_sub(entry.timestamp) >= age
                    && !tracker.contains(&entry.id)
            })?;
            for mut entry in candidates.iter().cloned() {
                entry.status = OperationStatus::Stale;
                tx.save(&entry)?;
            }
            Ok::<_, DbError>(candidates.len())
        })?;
        if marked > 0 {
            tracing::info!(marked, "marked abandoned operations stale");
        }
        Ok(marked)
    }

    /// Cleans every selected entry once.
    ///
    /// # Errors
    ///
    /// Returns [`CleanerError::Db`] only when the ledger cannot be read;
    /// per-entry failures are counted in the summary.
    pub async fn clean(&self) -> Result<CleanSummary, CleanerError> {
        let entries = self
            .ctx
            .db
            .view(|tx| filter_entries(tx, |entry| self.selector.matches(entry)))?;
        let mut summary = CleanSummary::default();
        for entry in entries {
            let op_id = entry.id.clone();
            let mut op = match load_operation(&self.ctx, entry) {
                Ok(op) => op,
                Err(err) => {
                    tracing::warn!(op_id = %op_id, error = %err, "unable to load pending operation, skipping");
                    summary.skipped += 1;
                    continue;
                }
            };
            let label = op.label();
            let Some(cleanable) = op.as_cleanable() else {
                tracing::debug!(op_id = %op_id, op = label, "operation is not cleanable, skipping");
                summary.skipped += 1;
                continue;
            };
            if let Some(tracker) = self.tracker.as_deref()
                && tracker.throttle_or_add(&op_id, self.class)
            {
                summary.throttled += 1;
                continue;
            }
            let outcome = Self::replay(cleanable, self.executor.as_ref()).await;
            if let Some(tracker) = self.tracker.as_deref() {
                tracker.remove(&op_id);
            }
            match outcome {
                Ok(()) => {
                    tracing::debug!(op_id = %op_id, op = label, "pending operation cleaned");
                    summary.cleaned += 1;
                }
                Err(err) => {
                    tracing::warn!(op_id = %op_id, op = label, error = %err, "cleanup failed, will retry later");
                    summary.failed += 1;
                }
            }
        }
        if summary != CleanSummary::default() {
            tracing::info!(
                cleaned = summary.cleaned,
                failed = summary.failed,
                throttled = summary.throttled,
                skipped = summary.skipped,
                "cleaner sweep finished"
            );
        }
        Ok(summary)
    }

    async fn replay(
        op: &mut dyn CleanableOperation,
        executor: &dyn Executor,
    ) -> Result<(), OperationError> {
        op.clean(executor).await?;
        op.clean_done()
    }
}

#[cfg(test)]
mod tests;
