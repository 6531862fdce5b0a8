//! Building blocks shared by the operation kinds.

use std::collections::BTreeMap;

use super::{OperationContext, OperationError};
use crate::db::{DbError, Record, Tx};
use crate::entities::{
    BlockVolumeEntry, BrickEntry, ClusterEntry, DeviceEntry, NodeEntry, PendingEntity,
    VolumeEntry,
};
use crate::executor::{BrickAddress, BrickRequest, Executor, ExecutorError, VolumeRequest};
use crate::health::{cluster_hosts, run_on_host};
use crate::pending::{ChangeType, PendingOperationEntry};

/// Brick id mapped to whether tearing it down released its device space.
pub(crate) type ReclaimMap = BTreeMap<String, bool>;

/// A brick resolved to the hosts that serve it.
#[derive(Clone, Debug)]
pub(crate) struct BrickTarget {
    pub(crate) manage_host: String,
    pub(crate) storage_host: String,
    pub(crate) request: BrickRequest,
}

impl BrickTarget {
    pub(crate) fn address(&self) -> BrickAddress {
        BrickAddress {
            host: self.storage_host.clone(),
            path: self.request.path.clone(),
        }
    }
}

/// Fails with [`OperationError::Conflict`] when `entity` is owned by an
/// operation.
pub(crate) fn ensure_unowned<E: PendingEntity>(entity: &E) -> Result<(), OperationError> {
    if entity.pending().is_pending() {
        return Err(OperationError::Conflict {
            id: entity.entity_id().to_owned(),
        });
    }
    Ok(())
}

/// Loads the ledger entry `id`, or `None` once it has been completed.
pub(crate) fn load_entry(
    ctx: &OperationContext,
    id: &str,
) -> Result<Option<PendingOperationEntry>, DbError> {
    ctx.db.view(|tx| tx.try_load::<PendingOperationEntry>(id))
}

/// Resolves bricks to their hosts. Bricks that no longer exist are skipped.
pub(crate) fn brick_targets<'i>(
    tx: &Tx<'_>,
    ids: impl IntoIterator<Item = &'i str>,
) -> Result<Vec<BrickTarget>, DbError> {
    let mut targets = Vec::new();
    for id in ids {
        let Some(brick) = tx.try_load::<BrickEntry>(id)? else {
            tracing::debug!(brick = %id, "brick already removed");
            continue;
        };
        let device = tx.load::<DeviceEntry>(&brick.device_id)?;
        let node = tx.load::<NodeEntry>(&brick.node_id)?;
        targets.push(BrickTarget {
            manage_host: node.manage_hostname,
            storage_host: node.storage_hostname,
            request: BrickRequest::new(&brick, &device),
        });
    }
    Ok(targets)
}

/// Gluster view of `vol` built from `targets`.
pub(crate) fn volume_request(vol: &VolumeEntry, targets: &[BrickTarget]) -> VolumeRequest {
    VolumeRequest {
        name: vol.info.name.clone(),
        durability: vol.info.durability,
        bricks: targets.iter().map(BrickTarget::address).collect(),
        options: vol.info.gluster_options.clone(),
    }
}

/// Creates every brick, treating bricks that already exist as done.
pub(crate) async fn create_bricks(
    executor: &dyn Executor,
    targets: &[BrickTarget],
) -> Result<(), ExecutorError> {
    for target in targets {
        match executor
            .brick_create(&target.manage_host, &target.request)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_already_exists() => {
                tracing::debug!(brick = %target.request.id, "brick already exists");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Tears every brick down, treating bricks that are already gone as
/// reclaimed.
pub(crate) async fn destroy_bricks(
    executor: &dyn Executor,
    targets: &[BrickTarget],
) -> Result<ReclaimMap, ExecutorError> {
    let mut reclaimed = ReclaimMap::new();
    for target in targets {
        let released = match executor
            .brick_destroy(&target.manage_host, &target.request)
            .await
        {
            Ok(released) => released,
            Err(err) if err.is_not_found() => true,
            Err(err) => return Err(err),
        };
        reclaimed.insert(target.request.id.clone(), released);
    }
    Ok(reclaimed)
}

/// Stops and deletes a gluster volume; a missing volume counts as deleted.
pub(crate) async fn destroy_volume(
    executor: &dyn Executor,
    hosts: &[String],
    name: &str,
) -> Result<(), ExecutorError> {
    let outcome = run_on_host(hosts, |host| {
        Box::pin(async move { executor.volume_destroy(&host, name).await })
    })
    .await;
    match outcome {
        Err(err) if err.is_not_found() => {
            tracing::debug!(volume = %name, "volume already deleted");
            Ok(())
        }
        other => other,
    }
}

/// Carves `bricks` from their devices and attaches them to `vol` on behalf
/// of `op`.
pub(crate) fn reserve_bricks(
    tx: &mut Tx<'_>,
    op: &mut PendingOperationEntry,
    vol: &mut VolumeEntry,
    bricks: Vec<BrickEntry>,
) -> Result<(), OperationError> {
    for mut brick in bricks {
        let mut device = tx.load::<DeviceEntry>(&brick.device_id)?;
        device.storage_allocate(brick.total_size())?;
        device.brick_add(&brick.id);
        op.record_add_brick(&mut brick)?;
        vol.brick_add(&brick.id);
        tx.save(&device)?;
        tx.save(&brick)?;
    }
    Ok(())
}

/// Deletes brick records, returning device space unless teardown reported
/// that it was kept. Bricks already gone are skipped.
pub(crate) fn release_bricks<'i>(
    tx: &mut Tx<'_>,
    ids: impl IntoIterator<Item = &'i str>,
    reclaimed: &ReclaimMap,
) -> Result<(), OperationError> {
    for id in ids {
        let Some(brick) = tx.try_load::<BrickEntry>(id)? else {
            continue;
        };
        if let Some(mut device) = tx.try_load::<DeviceEntry>(&brick.device_id)? {
            if reclaimed.get(id).copied().unwrap_or(true) {
                device.storage_free(brick.total_size())?;
            } else {
                tracing::debug!(brick = %id, device = %device.id, "device space not reclaimed");
            }
            device.brick_delete(id);
            tx.save(&device)?;
        }
        tx.delete::<BrickEntry>(id)?;
    }
    Ok(())
}

/// Deletes a volume record together with its bricks and cluster link.
pub(crate) fn remove_volume(
    tx: &mut Tx<'_>,
    vol_id: &str,
    reclaimed: &ReclaimMap,
) -> Result<(), OperationError> {
    let Some(vol) = tx.try_load::<VolumeEntry>(vol_id)? else {
        return Ok(());
    };
    release_bricks(tx, vol.bricks.iter().map(String::as_str), reclaimed)?;
    if let Some(mut cluster) = tx.try_load::<ClusterEntry>(&vol.info.cluster_id)? {
        cluster.volume_delete(vol_id);
        tx.save(&cluster)?;
    }
    tx.delete::<VolumeEntry>(vol_id)?;
    Ok(())
}

fn release_marker<E: PendingEntity + Record>(
    tx: &mut Tx<'_>,
    op: &PendingOperationEntry,
    id: &str,
) -> Result<(), DbError> {
    if let Some(mut entity) = tx.try_load::<E>(id)? {
        op.finalize(&mut entity);
        tx.save(&entity)?;
    }
    Ok(())
}

/// Clears the pending marker of every entity `op` touched, leaving the
/// entry itself alone.
pub(crate) fn release_entities(
    tx: &mut Tx<'_>,
    op: &PendingOperationEntry,
) -> Result<(), DbError> {
    for action in &op.actions {
        match action.change {
            ChangeType::AddBrick | ChangeType::DeleteBrick => {
                release_marker::<BrickEntry>(tx, op, &action.id)?;
            }
            ChangeType::AddVolume
            | ChangeType::DeleteVolume
            | ChangeType::ExpandVolume
            | ChangeType::CloneVolume
            | ChangeType::SnapshotVolume
            | ChangeType::AddVolumeClone => {
                release_marker::<VolumeEntry>(tx, op, &action.id)?;
            }
            ChangeType::AddBlockVolume | ChangeType::DeleteBlockVolume => {
                release_marker::<BlockVolumeEntry>(tx, op, &action.id)?;
            }
            ChangeType::RemoveDevice => {}
        }
    }
    Ok(())
}

/// Releases every entity of the ledger entry `op_id` and deletes the entry.
/// A missing entry means the work is already done.
pub(crate) fn commit_entry(tx: &mut Tx<'_>, op_id: &str) -> Result<(), DbError> {
    let Some(mut op) = tx.try_load::<PendingOperationEntry>(op_id)? else {
        return Ok(());
    };
    release_entities(tx, &op)?;
    op.delete(tx)
}

/// Ids recorded under `change`, owned.
pub(crate) fn action_ids(op: &PendingOperationEntry, change: ChangeType) -> Vec<String> {
    op.ids_for(change).map(str::to_owned).collect()
}

/// Destroys a volume that an operation created, then its bricks. Returns
/// which bricks released their device space.
pub(crate) async fn teardown_volume(
    ctx: &OperationContext,
    executor: &dyn Executor,
    vol_id: &str,
    brick_ids: &[String],
) -> Result<ReclaimMap, OperationError> {
    let (vol, targets, hosts) = ctx.db.view(|tx| {
        let vol = tx.try_load::<VolumeEntry>(vol_id)?;
        let targets = brick_targets(tx, brick_ids.iter().map(String::as_str))?;
        let hosts = match &vol {
            Some(found) => cluster_hosts(tx, &found.info.cluster_id, ctx.health.as_ref())?,
            None => Vec::new(),
        };
        Ok::<_, DbError>((vol, targets, hosts))
    })?;
    if let Some(found) = &vol {
        destroy_volume(executor, &hosts, &found.info.name).await?;
    }
    Ok(destroy_bricks(executor, &targets).await?)
}

/// Deletes what `op` was creating: its new bricks, then its new volumes.
pub(crate) fn discard_created(
    tx: &mut Tx<'_>,
    op: &PendingOperationEntry,
    reclaimed: &ReclaimMap,
) -> Result<(), OperationError> {
    release_bricks(tx, op.ids_for(ChangeType::AddBrick), reclaimed)?;
    for vol_id in op.ids_for(ChangeType::AddVolume) {
        remove_volume(tx, vol_id, reclaimed)?;
    }
    Ok(())
}
