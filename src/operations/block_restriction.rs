//! Locking and unlocking block-hosting volumes.

use super::common::ensure_unowned;
use super::{OpFuture, Operation, OperationContext, OperationError};
use crate::entities::{BlockRestriction, VolumeEntry, signed};
use crate::executor::Executor;
use crate::ids::generate_id;

/// Changes the block restriction of a hosting volume.
///
/// Tightening is applied at build time so no new block volume can land on
/// the volume while the change is in flight. Relaxing is applied at finalize
/// and re-validated there. Lifting [`BlockRestriction::LockedByUpdate`]
/// first tops the reservation up from free space.
#[derive(Debug)]
pub struct SetBlockRestrictionOperation {
    ctx: OperationContext,
    id: String,
    vol_id: String,
    restriction: BlockRestriction,
    deferred: bool,
}

/// Free space moved to the reservation when `vol` is unlocked.
fn reservation_shortfall(vol: &VolumeEntry) -> Result<u64, OperationError> {
    let info = &vol.info.block_info;
    let shortfall = vol.required_reservation().saturating_sub(info.reserved_size);
    if info.free_size < shortfall {
        return Err(OperationError::InsufficientBlockSpace {
            volume: vol.info.id.clone(),
            free: info.free_size,
            required: shortfall,
        });
    }
    Ok(shortfall)
}

fn rank_of(vol: &VolumeEntry, restriction: BlockRestriction) -> Result<u8, OperationError> {
    restriction
        .rank()
        .ok_or_else(|| OperationError::UnknownRestriction {
            volume: vol.info.id.clone(),
        })
}

impl SetBlockRestrictionOperation {
    /// Prepares setting `vol_id` to `restriction`.
    #[must_use]
    pub fn new(ctx: OperationContext, vol_id: impl Into<String>, restriction: BlockRestriction) -> Self {
        Self {
            ctx,
            id: generate_id(),
            vol_id: vol_id.into(),
            restriction,
            deferred: false,
        }
    }
}

impl Operation for SetBlockRestrictionOperation {
    fn label(&self) -> &'static str {
        "set block restriction"
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn build(&mut self) -> Result<(), OperationError> {
        let vol_id = &self.vol_id;
        let target = self.restriction;
        let deferred = self.ctx.db.update(|tx| {
            let mut vol = tx.load::<VolumeEntry>(vol_id)?;
            if !vol.info.block {
                return Err(OperationError::NotBlockHosting {
                    volume: vol.info.id.clone(),
                });
            }
            ensure_unowned(&vol)?;
            let current = vol.info.block_info.restriction;
            let current_rank = rank_of(&vol, current)?;
            let target_rank = rank_of(&vol, target)?;
            if target_rank == current_rank {
                return Ok(false);
            }
            if target_rank > current_rank {
                vol.info.block_info.restriction = target;
                tx.save(&vol)?;
                return Ok(false);
            }
            if current == BlockRestriction::LockedByUpdate {
                reservation_shortfall(&vol)?;
            }
            Ok::<_, OperationError>(true)
        })?;
        self.deferred = deferred;
        Ok(())
    }

    fn exec<'a>(&'a mut self, _executor: &'a dyn Executor) -> OpFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    fn finalize(&mut self) -> Result<(), OperationError> {
        if !self.deferred {
            tracing::debug!(volume = %self.vol_id, restriction = ?self.restriction, "block restriction set");
            return Ok(());
        }
        let vol_id = &self.vol_id;
        let target = self.restriction;
        self.ctx.db.update(|tx| {
            let mut vol = tx.load::<VolumeEntry>(vol_id)?;
            ensure_unowned(&vol)?;
            let current = vol.info.block_info.restriction;
            if rank_of(&vol, target)? < rank_of(&vol, current)?
                && current == BlockRestriction::LockedByUpdate
            {
                let shortfall = reservation_shortfall(&vol)?;
                if shortfall > 0 {
                    vol.modify_free_size(signed(shortfall).saturating_neg())?;
                    vol.modify_reserved_size(signed(shortfall))?;
                }
            }
            vol.info.block_info.restriction = target;
            tx.save(&vol)?;
            Ok::<_, OperationError>(())
        })?;
        self.deferred = false;
        tracing::info!(volume = %self.vol_id, restriction = ?self.restriction, "block restriction relaxed");
        Ok(())
    }

    fn rollback<'a>(&'a mut self, _executor: &'a dyn Executor) -> OpFuture<'a> {
        Box::pin(async move {
            self.deferred = false;
            Ok(())
        })
    }
}
