//! Rebuilding an operation from its ledger entry.

use super::{
    BlockVolumeCreateOperation, BlockVolumeDeleteOperation, DeviceRemoveOperation, Operation,
    OperationContext, OperationError, VolumeCloneOperation, VolumeCreateOperation,
    VolumeDeleteOperation, VolumeExpandOperation,
};
use crate::entities::{BlockVolumeEntry, BlockVolumeInfo, VolumeEntry, VolumeInfo};
use crate::pending::{ActionDelta, ChangeType, OperationType, PendingOperationEntry};

fn primary_id(entry: &PendingOperationEntry, change: ChangeType) -> Result<String, OperationError> {
    entry
        .first_action(change)
        .map(|action| action.id.clone())
        .ok_or_else(|| OperationError::Inconsistent {
            message: format!(
                "pending operation {} of type {} has no {change:?} action",
                entry.id, entry.op_type
            ),
        })
}

/// Reconstructs the operation that owns `entry` so it can be cleaned up.
///
/// Entities created by the operation may already be gone; placeholders
/// carrying only the recorded id stand in for them.
///
/// # Errors
///
/// Returns [`OperationError::Inconsistent`] when the entry has no usable
/// type or primary action, or a store error.
pub fn load_operation(
    ctx: &OperationContext,
    entry: PendingOperationEntry,
) -> Result<Box<dyn Operation>, OperationError> {
    let context = ctx.clone();
    let op: Box<dyn Operation> = match entry.op_type {
        OperationType::CreateVolume => {
            let vol_id = primary_id(&entry, ChangeType::AddVolume)?;
            let vol = context.db.view(|tx| tx.try_load::<VolumeEntry>(&vol_id))?;
            let template = vol.unwrap_or_else(|| VolumeEntry {
                info: VolumeInfo {
                    id: vol_id,
                    ..VolumeInfo::default()
                },
                ..VolumeEntry::default()
            });
            Box::new(VolumeCreateOperation::from_entry(context, entry, template))
        }
        OperationType::DeleteVolume => {
            let vol_id = primary_id(&entry, ChangeType::DeleteVolume)?;
            Box::new(VolumeDeleteOperation::from_entry(context, entry, vol_id))
        }
        OperationType::ExpandVolume => {
            let vol_id = primary_id(&entry, ChangeType::ExpandVolume)?;
            let delta = match entry
                .first_action(ChangeType::ExpandVolume)
                .and_then(|action| action.delta)
            {
                Some(ActionDelta::SizeGib(size)) => size,
                None => 0,
            };
            Box::new(VolumeExpandOperation::from_entry(context, entry, vol_id, delta))
        }
        OperationType::CreateBlockVolume => {
            let bvol_id = primary_id(&entry, ChangeType::AddBlockVolume)?;
            let bvol = context
                .db
                .view(|tx| tx.try_load::<BlockVolumeEntry>(&bvol_id))?;
            let template = bvol.unwrap_or_else(|| BlockVolumeEntry {
                info: BlockVolumeInfo {
                    id: bvol_id,
                    ..BlockVolumeInfo::default()
                },
                ..BlockVolumeEntry::default()
            });
            Box::new(BlockVolumeCreateOperation::from_entry(context, entry, template))
        }
        OperationType::DeleteBlockVolume => {
            let bvol_id = primary_id(&entry, ChangeType::DeleteBlockVolume)?;
            Box::new(BlockVolumeDeleteOperation::from_entry(context, entry, bvol_id))
        }
        OperationType::RemoveDevice => {
            let device_id = primary_id(&entry, ChangeType::RemoveDevice)?;
            Box::new(DeviceRemoveOperation::from_entry(context, entry, device_id))
        }
        OperationType::CloneVolume => {
            let parent_id = primary_id(&entry, ChangeType::CloneVolume)?;
            Box::new(VolumeCloneOperation::from_entry(context, entry, parent_id))
        }
        OperationType::Unknown => {
            return Err(OperationError::Inconsistent {
                message: format!("pending operation {} has no type", entry.id),
            });
        }
    };
    tracing::debug!(op_id = %op.id(), op = op.label(), "operation loaded from ledger");
    Ok(op)
}
