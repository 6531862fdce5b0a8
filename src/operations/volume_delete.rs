//! Volume deletion.

use super::common::{
    ReclaimMap, action_ids, brick_targets, commit_entry, destroy_bricks, destroy_volume,
    ensure_unowned, load_entry, remove_volume,
};
use super::{CleanableOperation, OpFuture, Operation, OperationContext, OperationError};
use crate::db::DbError;
use crate::entities::{BrickEntry, VolumeEntry};
use crate::executor::Executor;
use crate::health::{cluster_hosts, run_on_host};
use crate::pending::{ChangeType, PendingOperationEntry};

/// Deletes a volume and its bricks, returning their device space.
#[derive(Debug)]
pub struct VolumeDeleteOperation {
    ctx: OperationContext,
    op: PendingOperationEntry,
    vol_id: String,
    reclaimed: ReclaimMap,
}

impl VolumeDeleteOperation {
    /// Prepares deletion of `vol_id`.
    #[must_use]
    pub fn new(ctx: OperationContext, vol_id: impl Into<String>) -> Self {
        Self {
            ctx,
            op: PendingOperationEntry::new(),
            vol_id: vol_id.into(),
            reclaimed: ReclaimMap::new(),
        }
    }

    pub(super) const fn from_entry(ctx: OperationContext, op: PendingOperationEntry, vol_id: String) -> Self {
        Self {
            ctx,
            op,
            vol_id,
            reclaimed: ReclaimMap::new(),
        }
    }

    /// Destroys the volume and its bricks. With `check` the volume is first
    /// asked whether it may be deleted; a volume that no longer exists skips
    /// straight to its bricks.
    async fn destroy(&self, executor: &dyn Executor, check: bool) -> Result<ReclaimMap, OperationError> {
        let Some(op) = load_entry(&self.ctx, &self.op.id)? else {
            return Ok(ReclaimMap::new());
        };
        let Some(vol_id) = op.first_action(ChangeType::DeleteVolume).map(|a| a.id.clone()) else {
            return Ok(ReclaimMap::new());
        };
        let bricks = action_ids(&op, ChangeType::DeleteBrick);
        let (vol, targets, hosts) = self.ctx.db.view(|tx| {
            let vol = tx.try_load::<VolumeEntry>(&vol_id)?;
            let targets = brick_targets(tx, bricks.iter().map(String::as_str))?;
            let hosts = match &vol {
                Some(found) => cluster_hosts(tx, &found.info.cluster_id, self.ctx.health.as_ref())?,
                None => Vec::new(),
            };
            Ok::<_, DbError>((vol, targets, hosts))
        })?;
        if let Some(found) = &vol {
            let name = found.info.name.as_str();
            let present = if check {
                let outcome = run_on_host(&hosts, |host| {
                    Box::pin(async move { executor.volume_destroy_check(&host, name).await })
                })
                .await;
                match outcome {
                    Ok(()) => true,
                    Err(err) if err.is_not_found() => {
                        tracing::debug!(volume = %name, "volume already gone");
                        false
                    }
                    Err(err) => return Err(err.into()),
                }
            } else {
                true
            };
            if present {
                destroy_volume(executor, &hosts, name).await?;
            }
        }
        Ok(destroy_bricks(executor, &targets).await?)
    }
}

impl Operation for VolumeDeleteOperation {
    fn label(&self) -> &'static str {
        "delete volume"
    }

    fn id(&self) -> &str {
        &self.op.id
    }

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn build(&mut self) -> Result<(), OperationError> {
        let mut op = PendingOperationEntry::with_id(self.op.id.clone());
        let vol_id = &self.vol_id;
        self.ctx.db.update(|tx| {
            let mut vol = tx.load::<VolumeEntry>(vol_id)?;
            ensure_unowned(&vol)?;
            if vol.info.block && !vol.info.block_info.block_volumes.is_empty() {
                return Err(OperationError::HostingVolumeInUse {
                    volume: vol.info.id.clone(),
                });
            }
            let mut bricks = Vec::with_capacity(vol.bricks.len());
            for brick_id in &vol.bricks {
                let brick = tx.load::<BrickEntry>(brick_id)?;
                ensure_unowned(&brick)?;
                bricks.push(brick);
            }
            op.record_delete_volume(&mut vol)?;
            for brick in &mut bricks {
                op.record_delete_brick(brick)?;
                tx.save(&*brick)?;
            }
            tx.save(&vol)?;
            op.save(tx)?;
            Ok::<_, OperationError>(())
        })?;
        self.op = op;
        Ok(())
    }

    fn exec<'a>(&'a mut self, executor: &'a dyn Executor) -> OpFuture<'a> {
        Box::pin(async move {
            self.reclaimed = self.destroy(executor, true).await?;
            Ok(())
        })
    }

    fn finalize(&mut self) -> Result<(), OperationError> {
        self.clean_done()?;
        tracing::info!(op_id = %self.op.id, volume = %self.vol_id, "volume deleted");
        Ok(())
    }

    fn rollback<'a>(&'a mut self, _executor: &'a dyn Executor) -> OpFuture<'a> {
        Box::pin(async move {
            let op_id = self.op.id.clone();
            self.ctx.db.update(|tx| commit_entry(tx, &op_id))?;
            Ok(())
        })
    }

    fn as_cleanable(&mut self) -> Option<&mut dyn CleanableOperation> {
        Some(self)
    }
}

impl CleanableOperation for VolumeDeleteOperation {
    fn clean<'a>(&'a mut self, executor: &'a dyn Executor) -> OpFuture<'a> {
        Box::pin(async move {
            self.reclaimed = self.destroy(executor, false).await?;
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
            for vol_id in action_ids(&op, ChangeType::DeleteVolume) {
                remove_volume(tx, &vol_id, reclaimed)?;
            }
            op.delete(tx)?;
            Ok::<_, OperationError>(())
        })?;
        self.reclaimed.clear();
        Ok(())
    }
}
