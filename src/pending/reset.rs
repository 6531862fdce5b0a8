//! Status transitions of ledger entries, including the start-up reset of
//! entries left behind by a previous process.

use super::{OperationStatus, PendingOperationEntry};
use crate::db::{Db, DbError};

/// Marks every `New` ledger entry `Stale`, returning how many changed.
///
/// Called once at service start: nothing in a fresh process owns those
/// entries, so they are handed to the cleaner.
///
/// # Errors
///
/// Returns [`DbError`] when the ledger cannot be read or written.
pub fn mark_pending_operations_stale(db: &Db) -> Result<usize, DbError> {
    let (total, changed) = db.update(|tx| {
        let entries = tx.load_all::<PendingOperationEntry>()?;
        let total = entries.len();
        let mut changed = 0_usize;
        for mut entry in entries {
            if entry.status == OperationStatus::New {
                entry.status = OperationStatus::Stale;
                tx.save(&entry)?;
                changed += 1;
            }
        }
        Ok::<_, DbError>((total, changed))
    })?;
    if total > 0 {
        tracing::warn!(
            pending = total,
            marked_stale = changed,
            "found pending operations left by a previous run"
        );
    }
    Ok(changed)
}

/// Sets the status of ledger entry `id`. Returns `false` when the entry no
/// longer exists.
///
/// # Errors
///
/// Returns [`DbError`] when the entry cannot be read or written.
pub fn set_operation_status(
    db: &Db,
    id: &str,
    status: OperationStatus,
) -> Result<bool, DbError> {
    db.update(|tx| {
        let Some(mut entry) = tx.try_load::<PendingOperationEntry>(id)? else {
            return Ok(false);
        };
        entry.status = status;
        tx.save(&entry)?;
        Ok(true)
    })
}
