//! Offline removal of every pending operation and what it left behind.
//!
//! Entities an operation was creating are deleted outright and their device
//! or hosting capacity returned. Entities an operation was only modifying or
//! deleting keep their record and lose their pending marker. Every ledger
//! entry is then removed. Meant for a stopped service: nothing here touches
//! remote hosts.

use std::collections::BTreeSet;

use thiserror::Error;

use super::{ChangeType, PendingOperationEntry};
use crate::db::{Db, DbError, Record, Tx};
use crate::entities::{
    BlockSizeError, BlockVolumeEntry, BrickEntry, CapacityError, ClusterEntry, DeviceEntry,
    PendingEntity, PendingMarker, VolumeEntry, signed,
};

/// Errors raised while purging.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PurgeError {
    /// Store access failed.
    #[error(transparent)]
    Db(#[from] DbError),
    /// Device bookkeeping rejected a release.
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    /// Hosting volume bookkeeping rejected a release.
    #[error(transparent)]
    BlockSize(#[from] BlockSizeError),
}

/// What a purge removes or releases.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PurgePlan {
    /// Ledger entries to delete.
    pub operations: BTreeSet<String>,
    /// Bricks being created, to delete.
    pub bricks: BTreeSet<String>,
    /// Volumes and clones being created, to delete.
    pub volumes: BTreeSet<String>,
    /// Block volumes being created, to delete.
    pub block_volumes: BTreeSet<String>,
    /// Entities that keep their record but lose their pending marker.
    pub released: BTreeSet<String>,
}

impl PurgePlan {
    /// Returns `true` when there is nothing to purge.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Works out what [`delete_pending_entries`] would do without changing
/// anything.
///
/// # Errors
///
/// Returns [`DbError`] when the ledger cannot be read.
pub fn plan_purge(tx: &Tx<'_>) -> Result<PurgePlan, DbError> {
    let mut plan = PurgePlan::default();
    for entry in tx.load_all::<PendingOperationEntry>()? {
        for action in &entry.actions {
            let id = action.id.clone();
            match action.change {
                ChangeType::AddBrick => {
                    plan.bricks.insert(id);
                }
                ChangeType::AddVolume | ChangeType::AddVolumeClone => {
                    plan.volumes.insert(id);
                }
                ChangeType::AddBlockVolume => {
                    plan.block_volumes.insert(id);
                }
                ChangeType::DeleteBrick
                | ChangeType::DeleteVolume
                | ChangeType::ExpandVolume
                | ChangeType::DeleteBlockVolume
                | ChangeType::CloneVolume
                | ChangeType::SnapshotVolume => {
                    plan.released.insert(id);
                }
                ChangeType::RemoveDevice => {}
            }
        }
        plan.operations.insert(entry.id);
    }
    Ok(plan)
}

/// Deletes every ledger entry and undoes its metadata, returning what was
/// done.
///
/// # Errors
///
/// Returns [`PurgeError`] when the store or capacity bookkeeping fails; no
/// change is kept in that case.
pub fn delete_pending_entries(db: &Db) -> Result<PurgePlan, PurgeError> {
    let plan = db.update(|tx| {
        let plan = plan_purge(tx)?;
        purge_block_volumes(tx, &plan)?;
        purge_bricks(tx, &plan)?;
        purge_volumes(tx, &plan)?;
        release_markers(tx, &plan)?;
        for id in &plan.operations {
            tx.delete::<PendingOperationEntry>(id)?;
        }
        Ok::<_, PurgeError>(plan)
    })?;
    tracing::info!(
        operations = plan.operations.len(),
        bricks = plan.bricks.len(),
        volumes = plan.volumes.len(),
        block_volumes = plan.block_volumes.len(),
        "purged pending operations"
    );
    Ok(plan)
}

fn purge_block_volumes(tx: &mut Tx<'_>, plan: &PurgePlan) -> Result<(), PurgeError> {
    for id in &plan.block_volumes {
        let Some(bvol) = tx.try_load::<BlockVolumeEntry>(id)? else {
            continue;
        };
        let hosting = &bvol.info.hosting_volume;
        if !hosting.is_empty()
            && !plan.volumes.contains(hosting)
            && let Some(mut vol) = tx.try_load::<VolumeEntry>(hosting)?
        {
            vol.info.block_info.block_volumes.retain(|bv| bv != id);
            vol.modify_free_size(signed(bvol.info.size))?;
            tx.save(&vol)?;
        }
        if let Some(mut cluster) = tx.try_load::<ClusterEntry>(&bvol.info.cluster_id)? {
            cluster.block_volume_delete(id);
            tx.save(&cluster)?;
        }
        tx.delete::<BlockVolumeEntry>(id)?;
    }
    Ok(())
}

fn purge_bricks(tx: &mut Tx<'_>, plan: &PurgePlan) -> Result<(), PurgeError> {
    for id in &plan.bricks {
        let Some(brick) = tx.try_load::<BrickEntry>(id)? else {
            continue;
        };
        if let Some(mut device) = tx.try_load::<DeviceEntry>(&brick.device_id)? {
            device.storage_free(brick.total_size())?;
            device.brick_delete(id);
            tx.save(&device)?;
        }
        if !plan.volumes.contains(&brick.volume_id)
            && let Some(mut vol) = tx.try_load::<VolumeEntry>(&brick.volume_id)?
        {
            vol.brick_delete(id);
            tx.save(&vol)?;
        }
        tx.delete::<BrickEntry>(id)?;
    }
    Ok(())
}

fn purge_volumes(tx: &mut Tx<'_>, plan: &PurgePlan) -> Result<(), PurgeError> {
    for id in &plan.volumes {
        let Some(vol) = tx.try_load::<VolumeEntry>(id)? else {
            continue;
        };
        if let Some(mut cluster) = tx.try_load::<ClusterEntry>(&vol.info.cluster_id)? {
            cluster.volume_delete(id);
            tx.save(&cluster)?;
        }
        tx.delete::<VolumeEntry>(id)?;
    }
    Ok(())
}

fn release_markers(tx: &mut Tx<'_>, plan: &PurgePlan) -> Result<(), DbError> {
    for id in &plan.released {
        release::<VolumeEntry>(tx, id)?;
        release::<BrickEntry>(tx, id)?;
        release::<BlockVolumeEntry>(tx, id)?;
    }
    Ok(())
}

fn release<E: PendingEntity + Record>(tx: &mut Tx<'_>, id: &str) -> Result<(), DbError> {
    if let Some(mut entity) = tx.try_load::<E>(id)?
        && entity.pending().is_pending()
    {
        *entity.pending_mut() = PendingMarker::Unowned;
        tx.save(&entity)?;
    }
    Ok(())
}
