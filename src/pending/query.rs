//! Read-only questions asked of the ledger.

use std::collections::BTreeMap;

use super::{ChangeType, OperationStatus, OperationType, PendingOperationEntry};
use crate::db::{DbError, Tx};

/// Entity id mapped to the id of the ledger entry that touches it.
pub type PendingMap = BTreeMap<String, String>;

/// Maps every entity touched with one of `changes` to its ledger entry.
///
/// # Errors
///
/// Returns [`DbError`] when a ledger entry cannot be decoded.
pub fn map_pending_entities(tx: &Tx<'_>, changes: &[ChangeType]) -> Result<PendingMap, DbError> {
    let mut map = PendingMap::new();
    for entry in tx.load_all::<PendingOperationEntry>()? {
        for action in &entry.actions {
            if changes.contains(&action.change) {
                map.insert(action.id.clone(), entry.id.clone());
            }
        }
    }
    Ok(map)
}

/// Ledger entries for which `keep` returns `true`, ordered by id.
///
/// # Errors
///
/// Returns [`DbError`] when a ledger entry cannot be decoded.
pub fn filter_entries(
    tx: &Tx<'_>,
    mut keep: impl FnMut(&PendingOperationEntry) -> bool,
) -> Result<Vec<PendingOperationEntry>, DbError> {
    Ok(tx
        .load_all::<PendingOperationEntry>()?
        .into_iter()
        .filter(|entry| keep(entry))
        .collect())
}

/// Returns `true` while a live block volume create is also building a new
/// block-hosting volume.
///
/// # Errors
///
/// Returns [`DbError`] when a ledger entry cannot be decoded.
pub fn hosting_volume_create_pending(tx: &Tx<'_>) -> Result<bool, DbError> {
    let found = filter_entries(tx, |entry| {
        entry.status == OperationStatus::New
            && entry.op_type == OperationType::CreateBlockVolume
            && entry.first_action(ChangeType::AddVolume).is_some()
    })?;
    Ok(!found.is_empty())
}

/// Count of ledger entries per status, for operator summaries.
///
/// # Errors
///
/// Returns [`DbError`] when a ledger entry cannot be decoded.
pub fn count_by_status(tx: &Tx<'_>) -> Result<BTreeMap<String, usize>, DbError> {
    let mut counts = BTreeMap::new();
    for entry in tx.load_all::<PendingOperationEntry>()? {
        *counts.entry(entry.status.to_string()).or_insert(0) += 1;
    }
    Ok(counts)
}
