//! Volume creation.

use super::common::{
    ReclaimMap, brick_targets, commit_entry, create_bricks, discard_created, load_entry,
    reserve_bricks, teardown_volume, volume_request,
};
use super::{
    CleanableOperation, OpFuture, Operation, OperationContext, OperationError, OperationSettings,
};
use crate::db::{DbError, Tx};
use crate::entities::{ClusterEntry, PendingMarker, VolumeEntry};
use crate::executor::{Executor, ExecutorError};
use crate::health::{cluster_hosts, run_on_host};
use crate::pending::{ChangeType, PendingOperationEntry};
use crate::placement::{PlacementRequest, allocate_across_clusters, candidate_clusters};

/// How a newly placed volume is recorded in the ledger.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum VolumeRole {
    /// The volume is what the operation creates.
    Primary,
    /// The volume is created to host a block volume.
    BlockHosting,
}

/// Places `vol`, reserves its bricks and records both against `op`.
pub(super) fn place_volume(
    tx: &mut Tx<'_>,
    settings: &OperationSettings,
    op: &mut PendingOperationEntry,
    vol: &mut VolumeEntry,
    requested_clusters: &[String],
    role: VolumeRole,
) -> Result<(), OperationError> {
    let clusters = candidate_clusters(tx, requested_clusters, vol.info.block)?;
    let vol_id = vol.info.id.clone();
    let request = PlacementRequest {
        size_gib: vol.info.size,
        durability: vol.info.durability,
        snapshot_factor: vol.info.snapshot.effective_factor(),
        volume_id: &vol_id,
        limits: settings.limits,
    };
    let placement = allocate_across_clusters(tx, &clusters, &request)?;
    vol.info.cluster_id.clone_from(&placement.cluster_id);
    vol.bricks.clear();
    match role {
        VolumeRole::Primary => op.record_add_volume(vol)?,
        VolumeRole::BlockHosting => op.record_add_hosting_volume(vol)?,
    }
    reserve_bricks(tx, op, vol, placement.bricks)?;
    if vol.info.block {
        vol.set_raw_capacity(vol.info.size)?;
    }
    let mut cluster = tx.load::<ClusterEntry>(&placement.cluster_id)?;
    cluster.volume_add(&vol.info.id);
    tx.save(&cluster)?;
    tx.save(vol)?;
    tracing::debug!(
        volume = %vol.info.id,
        cluster = %placement.cluster_id,
        bricks = vol.bricks.len(),
        "volume placed"
    );
    Ok(())
}

/// Creates the bricks and gluster volume of `vol_id` as recorded in the
/// store. A volume that already exists counts as created.
pub(super) async fn create_volume_remote(
    ctx: &OperationContext,
    executor: &dyn Executor,
    vol_id: &str,
) -> Result<(), OperationError> {
    let (vol, targets, hosts) = ctx.db.view(|tx| {
        let vol = tx.load::<VolumeEntry>(vol_id)?;
        let targets = brick_targets(tx, vol.bricks.iter().map(String::as_str))?;
        let hosts = cluster_hosts(tx, &vol.info.cluster_id, ctx.health.as_ref())?;
        Ok::<_, DbError>((vol, targets, hosts))
    })?;
    create_bricks(executor, &targets).await?;
    let spec = volume_request(&vol, &targets);
    let spec_ref = &spec;
    let outcome = run_on_host(&hosts, |host| {
        Box::pin(async move { executor.volume_create(&host, spec_ref).await })
    })
    .await;
    match outcome {
        Ok(()) => Ok(()),
        Err(ExecutorError::AlreadyExists { .. }) => {
            tracing::debug!(volume = %vol.info.name, "volume already exists");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Creates a volume: places and reserves bricks, creates them and the
/// gluster volume, then commits. Remote failures are retried on a fresh
/// placement.
#[derive(Debug)]
pub struct VolumeCreateOperation {
    ctx: OperationContext,
    op: PendingOperationEntry,
    template: VolumeEntry,
    vol: VolumeEntry,
    clusters: Vec<String>,
    reclaimed: ReclaimMap,
}

impl VolumeCreateOperation {
    /// Prepares creation of `vol` on one of `clusters` (any cluster when
    /// empty).
    #[must_use]
    pub fn new(ctx: OperationContext, vol: VolumeEntry, clusters: Vec<String>) -> Self {
        Self {
            ctx,
            op: PendingOperationEntry::new(),
            template: vol.clone(),
            vol,
            clusters,
            reclaimed: ReclaimMap::new(),
        }
    }

    pub(super) fn from_entry(
        ctx: OperationContext,
        op: PendingOperationEntry,
        vol: VolumeEntry,
    ) -> Self {
        Self {
            ctx,
            op,
            template: vol.clone(),
            vol,
            clusters: Vec::new(),
            reclaimed: ReclaimMap::new(),
        }
    }

    /// The volume as last built.
    #[must_use]
    pub const fn volume(&self) -> &VolumeEntry {
        &self.vol
    }

    fn recorded_volume(&self) -> Result<Option<(PendingOperationEntry, String)>, DbError> {
        Ok(load_entry(&self.ctx, &self.op.id)?.and_then(|op| {
            let vol_id = op.first_action(ChangeType::AddVolume)?.id.clone();
            Some((op, vol_id))
        }))
    }

    async fn create(&self, executor: &dyn Executor) -> Result<(), OperationError> {
        let Some((_, vol_id)) = self.recorded_volume()? else {
            return Err(OperationError::Inconsistent {
                message: format!("pending operation {} has no volume to create", self.op.id),
            });
        };
        create_volume_remote(&self.ctx, executor, &vol_id).await
    }
}

impl Operation for VolumeCreateOperation {
    fn label(&self) -> &'static str {
        "create volume"
    }

    fn id(&self) -> &str {
        &self.op.id
    }

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn max_retries(&self) -> u32 {
        self.ctx.settings.create_volume_max_retries
    }

    fn build(&mut self) -> Result<(), OperationError> {
        let mut op = PendingOperationEntry::with_id(self.op.id.clone());
        let mut vol = self.template.clone();
        let settings = &self.ctx.settings;
        let clusters = &self.clusters;
        self.ctx.db.update(|tx| {
            let taken = tx
                .load_all::<VolumeEntry>()?
                .iter()
                .any(|existing| existing.info.name == vol.info.name && existing.info.id != vol.info.id);
            if taken {
                return Err(OperationError::NameTaken {
                    name: vol.info.name.clone(),
                });
            }
            place_volume(tx, settings, &mut op, &mut vol, clusters, VolumeRole::Primary)?;
            op.save(tx)?;
            Ok::<_, OperationError>(())
        })?;
        self.op = op;
        self.vol = vol;
        self.reclaimed.clear();
        Ok(())
    }

    fn exec<'a>(&'a mut self, executor: &'a dyn Executor) -> OpFuture<'a> {
        Box::pin(async move {
            self.create(executor)
                .await
                .map_err(OperationError::retryable)
        })
    }

    fn finalize(&mut self) -> Result<(), OperationError> {
        let op_id = self.op.id.clone();
        self.ctx
            .db
            .update(|tx| commit_entry(tx, &op_id))?;
        self.vol.pending = PendingMarker::Unowned;
        Ok(())
    }

    fn rollback<'a>(&'a mut self, executor: &'a dyn Executor) -> OpFuture<'a> {
        Box::pin(async move {
            self.clean(executor).await?;
            self.clean_done()
        })
    }

    fn as_cleanable(&mut self) -> Option<&mut dyn CleanableOperation> {
        Some(self)
    }
}

impl CleanableOperation for VolumeCreateOperation {
    fn clean<'a>(&'a mut self, executor: &'a dyn Executor) -> OpFuture<'a> {
        Box::pin(async move {
            let Some((op, vol_id)) = self.recorded_volume()? else {
                return Ok(());
            };
            let bricks: Vec<String> = op.ids_for(ChangeType::AddBrick).map(str::to_owned).collect();
            self.reclaimed = teardown_volume(&self.ctx, executor, &vol_id, &bricks).await?;
            Ok(())
        })
    }

    fn clean_done(&mut self) -> Result<(), OperationError> {
        let op_id = self.op.id.clone();
        let reclaimed = &self.reclaimed;
        self.ctx.db.update(|tx| {
            let Some(mut op) = tx.try_load::<PendingOperationEntry>(&op_id)? else {
                return Ok(());
            };
            discard_created(tx, &op, reclaimed)?;
            op.delete(tx)?;
            Ok::<_, OperationError>(())
        })?;
        self.reclaimed.clear();
        tracing::debug!(op_id = %op_id, "volume create cleaned up");
        Ok(())
    }
}
