//! Block volume deletion.

use super::common::{commit_entry, ensure_unowned, load_entry};
use super::{CleanableOperation, OpFuture, Operation, OperationContext, OperationError};
use crate::db::DbError;
use crate::entities::{BlockVolumeEntry, ClusterEntry, VolumeEntry, signed};
use crate::executor::Executor;
use crate::health::{cluster_hosts, run_on_host};
use crate::pending::{ChangeType, PendingOperationEntry};

/// Deletes a block volume and returns its space to the hosting volume.
#[derive(Debug)]
pub struct BlockVolumeDeleteOperation {
    ctx: OperationContext,
    op: PendingOperationEntry,
    bvol_id: String,
}

impl BlockVolumeDeleteOperation {
    /// Prepares deletion of `bvol_id`.
    #[must_use]
    pub fn new(ctx: OperationContext, bvol_id: impl Into<String>) -> Self {
        Self {
            ctx,
            op: PendingOperationEntry::new(),
            bvol_id: bvol_id.into(),
        }
    }

    pub(super) const fn from_entry(
        ctx: OperationContext,
        op: PendingOperationEntry,
        bvol_id: String,
    ) -> Self {
        Self { ctx, op, bvol_id }
    }

    async fn destroy(&self, executor: &dyn Executor) -> Result<(), OperationError> {
        let Some(op) = load_entry(&self.ctx, &self.op.id)? else {
            return Ok(());
        };
        let Some(bvol_id) = op
            .first_action(ChangeType::DeleteBlockVolume)
            .map(|a| a.id.clone())
        else {
            return Ok(());
        };
        let found = self.ctx.db.view(|tx| {
            let Some(bvol) = tx.try_load::<BlockVolumeEntry>(&bvol_id)? else {
                return Ok(None);
            };
            let vol = tx.load::<VolumeEntry>(&bvol.info.hosting_volume)?;
            let hosts = cluster_hosts(tx, &vol.info.cluster_id, self.ctx.health.as_ref())?;
            Ok::<_, DbError>(Some((bvol, vol, hosts)))
        })?;
        let Some((bvol, vol, hosts)) = found else {
            return Ok(());
        };
        let hosting = vol.info.name.as_str();
        let name = bvol.info.name.as_str();
        let outcome = run_on_host(&hosts, |host| {
            Box::pin(async move { executor.block_volume_destroy(&host, hosting, name).await })
        })
        .await;
        match outcome {
            Err(err) if err.is_not_found() => {
                tracing::debug!(block_volume = %name, "block volume already deleted");
                Ok(())
            }
            other => other.map_err(OperationError::from),
        }
    }
}

impl Operation for BlockVolumeDeleteOperation {
    fn label(&self) -> &'static str {
        "delete block volume"
    }

    fn id(&self) -> &str {
        &self.op.id
    }

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn build(&mut self) -> Result<(), OperationError> {
        let mut op = PendingOperationEntry::with_id(self.op.id.clone());
        let bvol_id = &self.bvol_id;
        self.ctx.db.update(|tx| {
            let mut bvol = tx.load::<BlockVolumeEntry>(bvol_id)?;
            ensure_unowned(&bvol)?;
            op.record_delete_block_volume(&mut bvol)?;
            tx.save(&bvol)?;
            op.save(tx)?;
            Ok::<_, OperationError>(())
        })?;
        self.op = op;
        Ok(())
    }

    fn exec<'a>(&'a mut self, executor: &'a dyn Executor) -> OpFuture<'a> {
        Box::pin(self.destroy(executor))
    }

    fn finalize(&mut self) -> Result<(), OperationError> {
        self.clean_done()?;
        tracing::info!(op_id = %self.op.id, block_volume = %self.bvol_id, "block volume deleted");
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

impl CleanableOperation for BlockVolumeDeleteOperation {
    fn clean<'a>(&'a mut self, executor: &'a dyn Executor) -> OpFuture<'a> {
        Box::pin(self.destroy(executor))
    }

    fn clean_done(&mut self) -> Result<(), OperationError> {
        let op_id = self.op.id.clone();
        self.ctx.db.update(|tx| {
            let Some(mut op) = tx.try_load::<PendingOperationEntry>(&op_id)? else {
                return Ok(());
            };
            for bvol_id in op.ids_for(ChangeType::DeleteBlockVolume) {
                let Some(bvol) = tx.try_load::<BlockVolumeEntry>(bvol_id)? else {
                    continue;
                };
                if let Some(mut vol) = tx.try_load::<VolumeEntry>(&bvol.info.hosting_volume)? {
                    vol.info.block_info.block_volumes.retain(|id| id != bvol_id);
                    vol.modify_free_size(signed(bvol.info.size))?;
                    tx.save(&vol)?;
                }
                if let Some(mut cluster) = tx.try_load::<ClusterEntry>(&bvol.info.cluster_id)? {
                    cluster.block_volume_delete(bvol_id);
                    tx.save(&cluster)?;
                }
                tx.delete::<BlockVolumeEntry>(bvol_id)?;
            }
            op.delete(tx)?;
            Ok::<_, OperationError>(())
        })?;
        Ok(())
    }
}
