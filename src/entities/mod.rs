//! Persisted cluster topology and storage entities.
//!
//! Volumes, block volumes and bricks carry a [`PendingMarker`] naming the
//! ledger entry that currently owns them. Owned entities are treated as not
//! yet existing by the listing helpers in this module until the owning
//! operation finalises.

use serde::{Deserialize, Serialize};

use crate::db::{DbError, Tx};
use crate::pending::query::{PendingMap, map_pending_entities};
use crate::pending::ChangeType;

mod block_volume;
mod brick;
mod cluster;
mod device;
mod node;
mod volume;

pub use block_volume::{BlockConnection, BlockVolumeEntry, BlockVolumeInfo};
pub use brick::BrickEntry;
pub use cluster::ClusterEntry;
pub use device::{CapacityError, DeviceEntry};
pub use node::NodeEntry;
pub(crate) use volume::signed;
pub use volume::{
    BlockHostingInfo, BlockRestriction, BlockSizeError, Durability, HostedSizeError,
    SnapshotPolicy, VolumeEntry, VolumeInfo, reduce_raw_size,
};

/// Number of KiB in one GiB. Device and brick sizes are tracked in KiB,
/// volume sizes in GiB.
pub const KIB_PER_GIB: u64 = 1024 * 1024;

/// Ownership of an entity by an in-flight operation.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "state", content = "operation", rename_all = "snake_case")]
pub enum PendingMarker {
    /// The entity is committed and visible.
    #[default]
    Unowned,
    /// The entity belongs to the named ledger entry.
    OwnedBy(String),
}

impl PendingMarker {
    /// Returns `true` when an operation owns the entity.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::OwnedBy(_))
    }

    /// Returns the owning operation id, if any.
    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        match self {
            Self::Unowned => None,
            Self::OwnedBy(id) => Some(id),
        }
    }

    /// Returns `true` when `op_id` owns the entity.
    #[must_use]
    pub fn is_owned_by(&self, op_id: &str) -> bool {
        self.owner() == Some(op_id)
    }
}

/// Entities that can be claimed by a pending operation.
pub trait PendingEntity {
    /// Identifier of the entity.
    fn entity_id(&self) -> &str;
    /// Current ownership marker.
    fn pending(&self) -> &PendingMarker;
    /// Mutable ownership marker, used by the ledger's record and finalize
    /// helpers.
    fn pending_mut(&mut self) -> &mut PendingMarker;
}

/// Administrative state of nodes and devices.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Available for new allocations.
    #[default]
    Online,
    /// Not used for new allocations.
    Offline,
    /// Removed from service.
    Failed,
}

/// Volumes without a pending marker, ordered by id.
///
/// # Errors
///
/// Returns [`DbError`] when a record cannot be decoded.
pub fn list_visible_volumes(tx: &Tx<'_>) -> Result<Vec<VolumeEntry>, DbError> {
    Ok(tx
        .load_all::<VolumeEntry>()?
        .into_iter()
        .filter(|vol| !vol.pending.is_pending())
        .collect())
}

/// Block volumes without a pending marker, ordered by id.
///
/// # Errors
///
/// Returns [`DbError`] when a record cannot be decoded.
pub fn list_visible_block_volumes(tx: &Tx<'_>) -> Result<Vec<BlockVolumeEntry>, DbError> {
    Ok(tx
        .load_all::<BlockVolumeEntry>()?
        .into_iter()
        .filter(|bvol| !bvol.pending.is_pending())
        .collect())
}

/// Volume ids that no pending operation is still creating.
///
/// # Errors
///
/// Returns [`DbError`] when the ledger cannot be read.
pub fn list_complete_volumes(tx: &Tx<'_>) -> Result<Vec<String>, DbError> {
    let creating: PendingMap =
        map_pending_entities(tx, &[ChangeType::AddVolume, ChangeType::AddVolumeClone])?;
    Ok(tx
        .ids::<VolumeEntry>()?
        .into_iter()
        .filter(|id| !creating.contains_key(id))
        .collect())
}

/// Block volume ids that no pending operation is still creating.
///
/// # Errors
///
/// Returns [`DbError`] when the ledger cannot be read.
pub fn list_complete_block_volumes(tx: &Tx<'_>) -> Result<Vec<String>, DbError> {
    let creating = map_pending_entities(tx, &[ChangeType::AddBlockVolume])?;
    Ok(tx
        .ids::<BlockVolumeEntry>()?
        .into_iter()
        .filter(|id| !creating.contains_key(id))
        .collect())
}

#[cfg(test)]
mod tests;
