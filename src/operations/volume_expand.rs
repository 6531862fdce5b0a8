//! Volume expansion.

use super::common::{
    ReclaimMap, action_ids, brick_targets, create_bricks, destroy_bricks, ensure_unowned,
    load_entry, release_bricks, release_entities, reserve_bricks, volume_request,
};
use super::{CleanableOperation, OpFuture, Operation, OperationContext, OperationError};
use crate::db::DbError;
use crate::entities::VolumeEntry;
use crate::executor::Executor;
use crate::health::{cluster_hosts, run_on_host};
use crate::pending::{ActionDelta, ChangeType, PendingOperationEntry};
use crate::placement::{PlacementRequest, allocate_in_cluster};

/// Grows a volume by adding brick sets. The size increase is committed only
/// by finalize; a cleaned-up expansion leaves the volume's size untouched.
#[derive(Debug)]
pub struct VolumeExpandOperation {
    ctx: OperationContext,
    op: PendingOperationEntry,
    vol_id: String,
    delta_gib: u64,
    reclaimed: ReclaimMap,
}

impl VolumeExpandOperation {
    /// Prepares growth of `vol_id` by `delta_gib`.
    #[must_use]
    pub fn new(ctx: OperationContext, vol_id: impl Into<String>, delta_gib: u64) -> Self {
        Self {
            ctx,
            op: PendingOperationEntry::new(),
            vol_id: vol_id.into(),
            delta_gib,
            reclaimed: ReclaimMap::new(),
        }
    }

    pub(super) const fn from_entry(
        ctx: OperationContext,
        op: PendingOperationEntry,
        vol_id: String,
        delta_gib: u64,
    ) -> Self {
        Self {
            ctx,
            op,
            vol_id,
            delta_gib,
            reclaimed: ReclaimMap::new(),
        }
    }

    /// Recorded expansion: volume id, size delta and new bricks.
    fn recorded(&self) -> Result<Option<(String, u64, Vec<String>)>, DbError> {
        Ok(load_entry(&self.ctx, &self.op.id)?.and_then(|op| {
            let action = op.first_action(ChangeType::ExpandVolume)?;
            let delta = match action.delta {
                Some(ActionDelta::SizeGib(size)) => size,
                None => 0,
            };
            Some((action.id.clone(), delta, action_ids(&op, ChangeType::AddBrick)))
        }))
    }

    async fn expand(&self, executor: &dyn Executor) -> Result<(), OperationError> {
        let Some((vol_id, _, bricks)) = self.recorded()? else {
            return Err(OperationError::Inconsistent {
                message: format!("pending operation {} has no volume to expand", self.op.id),
            });
        };
        let (vol, targets, hosts) = self.ctx.db.view(|tx| {
            let vol = tx.load::<VolumeEntry>(&vol_id)?;
            let targets = brick_targets(tx, bricks.iter().map(String::as_str))?;
            let hosts = cluster_hosts(tx, &vol.info.cluster_id, self.ctx.health.as_ref())?;
            Ok::<_, DbError>((vol, targets, hosts))
        })?;
        create_bricks(executor, &targets).await?;
        let spec = volume_request(&vol, &targets);
        let spec_ref = &spec;
        run_on_host(&hosts, |host| {
            Box::pin(async move { executor.volume_expand(&host, spec_ref).await })
        })
        .await?;
        Ok(())
    }
}

impl Operation for VolumeExpandOperation {
    fn label(&self) -> &'static str {
        "expand volume"
    }

    fn id(&self) -> &str {
        &self.op.id
    }

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn build(&mut self) -> Result<(), OperationError> {
        let mut op = PendingOperationEntry::with_id(self.op.id.clone());
        let settings = &self.ctx.settings;
        let vol_id = &self.vol_id;
        let delta = self.delta_gib;
        self.ctx.db.update(|tx| {
            let mut vol = tx.load::<VolumeEntry>(vol_id)?;
            ensure_unowned(&vol)?;
            let request = PlacementRequest {
                size_gib: delta,
                durability: vol.info.durability,
                snapshot_factor: vol.info.snapshot.effective_factor(),
                volume_id: vol_id,
                limits: settings.limits,
            };
            let placement = allocate_in_cluster(tx, &vol.info.cluster_id, &request)?;
            op.record_expand_volume(&mut vol, delta)?;
            reserve_bricks(tx, &mut op, &mut vol, placement.bricks)?;
            tx.save(&vol)?;
            op.save(tx)?;
            Ok::<_, OperationError>(())
        })?;
        self.op = op;
        Ok(())
    }

    fn exec<'a>(&'a mut self, executor: &'a dyn Executor) -> OpFuture<'a> {
        Box::pin(self.expand(executor))
    }

    fn finalize(&mut self) -> Result<(), OperationError> {
        let op_id = self.op.id.clone();
        self.ctx.db.update(|tx| {
            let Some(mut op) = tx.try_load::<PendingOperationEntry>(&op_id)? else {
                return Ok(());
            };
            if let Some(action) = op.first_action(ChangeType::ExpandVolume) {
                let mut vol = tx.load::<VolumeEntry>(&action.id)?;
                if let Some(ActionDelta::SizeGib(delta)) = action.delta {
                    vol.info.size = vol.info.size.saturating_add(delta);
                    if vol.info.block {
                        vol.add_raw_capacity(delta)?;
                    }
                }
                tx.save(&vol)?;
            }
            release_entities(tx, &op)?;
            op.delete(tx)?;
            Ok::<_, OperationError>(())
        })?;
        tracing::info!(op_id = %op_id, volume = %self.vol_id, delta = self.delta_gib, "volume expanded");
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

impl CleanableOperation for VolumeExpandOperation {
    fn clean<'a>(&'a mut self, executor: &'a dyn Executor) -> OpFuture<'a> {
        Box::pin(async move {
            let Some((_, _, bricks)) = self.recorded()? else {
                return Ok(());
            };
            let targets = self
                .ctx
                .db
                .view(|tx| brick_targets(tx, bricks.iter().map(String::as_str)))?;
            self.reclaimed = destroy_bricks(executor, &targets).await?;
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
            let bricks = action_ids(&op, ChangeType::AddBrick);
            release_bricks(tx, bricks.iter().map(String::as_str), reclaimed)?;
            for vol_id in op.ids_for(ChangeType::ExpandVolume) {
                if let Some(mut vol) = tx.try_load::<VolumeEntry>(vol_id)? {
                    for brick in &bricks {
                        vol.brick_delete(brick);
                    }
                    op.finalize(&mut vol);
                    tx.save(&vol)?;
                }
            }
            op.delete(tx)?;
            Ok::<_, OperationError>(())
        })?;
        self.reclaimed.clear();
        Ok(())
    }
}
