//! Consistency check and repair of block-hosting volume budgets.
//!
//! A committed block-hosting volume must satisfy
//! `size == used + free + reserved`, where `used` is the total size of the
//! committed block volumes it hosts. [`check_block_sizes`] reports every
//! volume against that rule. [`fix_block_sizes`] rewrites `free_size` when
//! the error is small enough to be trusted, and flags the rest.
//!
//! A pending block volume create or delete moves free space before the
//! block volume itself is committed or removed, so a hosting volume that
//! any pending operation touches is skipped until that operation settles.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::db::{Db, DbError, Tx};
use crate::entities::{BlockVolumeEntry, HostedSizeError, VolumeEntry};
use crate::pending::PendingOperationEntry;

/// Errors raised while checking or fixing budgets.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BlockSizesError {
    /// Store access failed.
    #[error(transparent)]
    Db(#[from] DbError),
    /// Hosted block volumes could not be summed.
    #[error(transparent)]
    Hosted(#[from] HostedSizeError),
}

/// Largest corrections the fix routine applies on its own, in GiB.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SizeFixBounds {
    /// Largest increase of `free_size`.
    pub max_increase: u64,
    /// Largest decrease of `free_size`.
    pub max_decrease: u64,
}

impl Default for SizeFixBounds {
    fn default() -> Self {
        Self {
            max_increase: 16,
            max_decrease: 16,
        }
    }
}

/// Budget of one block-hosting volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockSizeReport {
    /// Volume id.
    pub volume: String,
    /// Volume name.
    pub name: String,
    /// Volume size in GiB.
    pub size: u64,
    /// Total size of hosted committed block volumes in GiB.
    pub used: u64,
    /// Recorded free space in GiB.
    pub free: u64,
    /// Recorded reservation in GiB.
    pub reserved: u64,
    /// `true` when the budget adds up.
    pub correct: bool,
}

impl BlockSizeReport {
    /// Free size that would make the budget add up, if any.
    #[must_use]
    pub const fn expected_free(&self) -> Option<u64> {
        match self.size.checked_sub(self.used) {
            Some(rest) => rest.checked_sub(self.reserved),
            None => None,
        }
    }
}

/// What the fix routine did with one volume.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FixOutcome {
    /// The budget already added up.
    Correct,
    /// `free_size` was rewritten.
    Fixed {
        /// Previous free size.
        from: u64,
        /// New free size.
        to: u64,
    },
    /// The error is outside the bounds, or cannot be expressed by changing
    /// free space alone; the volume needs an operator.
    Flagged,
}

/// Result of fixing one volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FixReport {
    /// Budget before the fix.
    pub before: BlockSizeReport,
    /// What happened.
    pub outcome: FixOutcome,
}

fn report_for(tx: &Tx<'_>, vol: &VolumeEntry) -> Result<BlockSizeReport, BlockSizesError> {
    let used = vol.total_size_block_volumes(tx)?;
    Ok(BlockSizeReport {
        volume: vol.info.id.clone(),
        name: vol.info.name.clone(),
        size: vol.info.size,
        used,
        free: vol.info.block_info.free_size,
        reserved: vol.info.block_info.reserved_size,
        correct: vol.block_hosting_size_is_correct(used),
    })
}

/// Ids of every entity named by an action of any pending operation.
fn ledger_ids(tx: &Tx<'_>) -> Result<BTreeSet<String>, DbError> {
    let mut ids = BTreeSet::new();
    for op in tx.load_all::<PendingOperationEntry>()? {
        ids.extend(op.actions.into_iter().map(|action| action.id));
    }
    Ok(ids)
}

fn hosts_pending_work(
    tx: &Tx<'_>,
    vol: &VolumeEntry,
    in_ledger: &BTreeSet<String>,
) -> Result<bool, DbError> {
    if vol.pending.is_pending() || in_ledger.contains(&vol.info.id) {
        return Ok(true);
    }
    for id in &vol.info.block_info.block_volumes {
        if in_ledger.contains(id) {
            return Ok(true);
        }
        let pending = tx
            .try_load::<BlockVolumeEntry>(id)?
            .is_some_and(|bvol| bvol.pending.is_pending());
        if pending {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Committed block-hosting volumes no pending operation touches, ordered by
/// id.
fn hosting_volumes(tx: &Tx<'_>) -> Result<Vec<VolumeEntry>, DbError> {
    let in_ledger = ledger_ids(tx)?;
    let mut settled = Vec::new();
    for vol in tx.load_all::<VolumeEntry>()? {
        if !vol.info.block {
            continue;
        }
        if hosts_pending_work(tx, &vol, &in_ledger)? {
            tracing::debug!(volume = %vol.info.id, "skipping block hosting volume with pending work");
            continue;
        }
        settled.push(vol);
    }
    Ok(settled)
}

/// Reports the budget of every committed block-hosting volume. Volumes an
/// operation is still working on, or that host a block volume one is still
/// creating or deleting, are left out.
///
/// # Errors
///
/// Returns [`BlockSizesError`] when a volume or hosted block volume cannot
/// be read.
pub fn check_block_sizes(db: &Db) -> Result<Vec<BlockSizeReport>, BlockSizesError> {
    db.view(|tx| {
        hosting_volumes(tx)?
            .iter()
            .map(|vol| report_for(tx, vol))
            .collect()
    })
}

fn correction(report: &BlockSizeReport, bounds: SizeFixBounds) -> FixOutcome {
    if report.correct {
        return FixOutcome::Correct;
    }
    let Some(expected) = report.expected_free() else {
        return FixOutcome::Flagged;
    };
    let within = if expected > report.free {
        expected.saturating_sub(report.free) <= bounds.max_increase
    } else {
        report.free.saturating_sub(expected) <= bounds.max_decrease
    };
    if within {
        FixOutcome::Fixed {
            from: report.free,
            to: expected,
        }
    } else {
        FixOutcome::Flagged
    }
}

/// Rewrites `free_size` of every inconsistent volume whose error lies within
/// `bounds`, in one transaction.
///
/// # Errors
///
/// Returns [`BlockSizesError`] when the store cannot be read or written; no
/// change is kept in that case.
pub fn fix_block_sizes(db: &Db, bounds: SizeFixBounds) -> Result<Vec<FixReport>, BlockSizesError> {
    let reports = db.update(|tx| {
        let mut reports = Vec::new();
        for mut vol in hosting_volumes(tx)? {
            let before = report_for(tx, &vol)?;
            let outcome = correction(&before, bounds);
            match outcome {
                FixOutcome::Fixed { from, to } => {
                    vol.info.block_info.free_size = to;
                    tx.save(&vol)?;
                    tracing::info!(volume = %vol.info.id, from, to, "corrected block hosting free size");
                }
                FixOutcome::Flagged => {
                    tracing::warn!(
                        volume = %vol.info.id,
                        size = before.size,
                        used = before.used,
                        free = before.free,
                        reserved = before.reserved,
                        "block hosting size is out of bounds, leaving it for an operator"
                    );
                }
                FixOutcome::Correct => {}
            }
            reports.push(FixReport { before, outcome });
        }
        Ok::<_, BlockSizesError>(reports)
    })?;
    Ok(reports)
}
