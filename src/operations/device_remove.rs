//! Evacuating an offline device.

use std::collections::{BTreeMap, BTreeSet};

use super::common::{BrickTarget, ensure_unowned};
use super::{OpFuture, Operation, OperationContext, OperationError};
use crate::db::{DbError, Tx};
use crate::entities::{BrickEntry, DeviceEntry, EntryState, NodeEntry, VolumeEntry};
use crate::executor::{BrickRequest, Executor, ReplaceBrickRequest};
use crate::health::{cluster_hosts, run_on_host};
use crate::pending::{ChangeType, PendingOperationEntry};
use crate::placement::{best_fit, online_devices};

/// Where one brick moves to.
struct Replacement {
    volume: String,
    hosts: Vec<String>,
    old: BrickTarget,
    old_brick: BrickEntry,
    new: BrickTarget,
    new_brick: BrickEntry,
}

fn target(tx: &Tx<'_>, brick: &BrickEntry) -> Result<BrickTarget, DbError> {
    let device = tx.load::<DeviceEntry>(&brick.device_id)?;
    let node = tx.load::<NodeEntry>(&brick.node_id)?;
    Ok(BrickTarget {
        manage_host: node.manage_hostname,
        storage_host: node.storage_hostname,
        request: BrickRequest::new(brick, &device),
    })
}

/// Chooses a device for a copy of `brick_id`, away from the nodes holding
/// the other bricks of its set. `None` when the brick is already gone.
fn plan_replacement(
    tx: &Tx<'_>,
    ctx: &OperationContext,
    brick_id: &str,
) -> Result<Option<Replacement>, OperationError> {
    let Some(old_brick) = tx.try_load::<BrickEntry>(brick_id)? else {
        return Ok(None);
    };
    let vol = tx.load::<VolumeEntry>(&old_brick.volume_id)?;
    let set_size = usize::try_from(vol.info.durability.set_size())
        .unwrap_or(1)
        .max(1);
    let mut skip_nodes = BTreeSet::new();
    if let Some(set) = vol
        .bricks
        .chunks(set_size)
        .find(|set| set.iter().any(|id| id == brick_id))
    {
        for sibling_id in set.iter().filter(|id| *id != brick_id) {
            let sibling = tx.load::<BrickEntry>(sibling_id)?;
            skip_nodes.insert(sibling.node_id);
        }
    }
    let devices = online_devices(tx, &vol.info.cluster_id)?;
    let need = old_brick.total_size();
    let device = best_fit(&devices, &BTreeMap::new(), need, &skip_nodes).ok_or_else(|| {
        OperationError::NoReplacement {
            brick: brick_id.to_owned(),
        }
    })?;
    let new_brick = BrickEntry {
        tp_size: old_brick.tp_size,
        pool_metadata_size: old_brick.pool_metadata_size,
        ..BrickEntry::new(old_brick.size, 100, &device.id, &device.node_id, &vol.info.id)
    };
    Ok(Some(Replacement {
        volume: vol.info.name.clone(),
        hosts: cluster_hosts(tx, &vol.info.cluster_id, ctx.health.as_ref())?,
        old: target(tx, &old_brick)?,
        new: target(tx, &new_brick)?,
        old_brick,
        new_brick,
    }))
}

/// Moves every brick off an offline device onto other devices of its
/// cluster, then marks the device failed. A device without bricks is marked
/// failed at build time.
#[derive(Debug)]
pub struct DeviceRemoveOperation {
    ctx: OperationContext,
    op: PendingOperationEntry,
    device_id: String,
    evacuating: bool,
}

impl DeviceRemoveOperation {
    /// Prepares removal of `device_id`.
    #[must_use]
    pub fn new(ctx: OperationContext, device_id: impl Into<String>) -> Self {
        Self {
            ctx,
            op: PendingOperationEntry::new(),
            device_id: device_id.into(),
            evacuating: false,
        }
    }

    pub(super) const fn from_entry(
        ctx: OperationContext,
        op: PendingOperationEntry,
        device_id: String,
    ) -> Self {
        Self {
            ctx,
            op,
            device_id,
            evacuating: true,
        }
    }

    async fn replace(&self, executor: &dyn Executor, brick_id: &str) -> Result<(), OperationError> {
        let Some(plan) = self
            .ctx
            .db
            .view(|tx| plan_replacement(tx, &self.ctx, brick_id))?
        else {
            return Ok(());
        };
        match executor
            .brick_create(&plan.new.manage_host, &plan.new.request)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_already_exists() => {}
            Err(err) => return Err(err.into()),
        }
        let request = ReplaceBrickRequest {
            volume: plan.volume.clone(),
            old: plan.old.address(),
            new: plan.new.address(),
        };
        let request_ref = &request;
        let replaced = run_on_host(&plan.hosts, |host| {
            Box::pin(async move { executor.volume_replace_brick(&host, request_ref).await })
        })
        .await;
        if let Err(err) = replaced {
            if let Err(cleanup) = executor
                .brick_destroy(&plan.new.manage_host, &plan.new.request)
                .await
            {
                tracing::warn!(brick = %plan.new_brick.id, error = %cleanup, "unable to remove unused replacement brick");
            }
            return Err(err.into());
        }
        let reclaimed = match executor
            .brick_destroy(&plan.old.manage_host, &plan.old.request)
            .await
        {
            Ok(released) => released,
            Err(err) => {
                tracing::warn!(brick = %plan.old_brick.id, error = %err, "unable to tear down replaced brick");
                false
            }
        };
        self.commit_replacement(&plan, reclaimed)?;
        tracing::info!(
            volume = %plan.volume,
            old = %plan.old_brick.id,
            new = %plan.new_brick.id,
            device = %plan.new_brick.device_id,
            "brick replaced"
        );
        Ok(())
    }

    fn commit_replacement(&self, plan: &Replacement, reclaimed: bool) -> Result<(), OperationError> {
        self.ctx.db.update(|tx| {
            let mut vol = tx.load::<VolumeEntry>(&plan.old_brick.volume_id)?;
            for id in &mut vol.bricks {
                if *id == plan.old_brick.id {
                    id.clone_from(&plan.new_brick.id);
                }
            }
            let mut new_device = tx.load::<DeviceEntry>(&plan.new_brick.device_id)?;
            new_device.storage_allocate(plan.new_brick.total_size())?;
            new_device.brick_add(&plan.new_brick.id);
            tx.save(&new_device)?;
            tx.save(&plan.new_brick)?;
            let mut old_device = tx.load::<DeviceEntry>(&plan.old_brick.device_id)?;
            if reclaimed {
                old_device.storage_free(plan.old_brick.total_size())?;
            }
            old_device.brick_delete(&plan.old_brick.id);
            tx.save(&old_device)?;
            tx.delete::<BrickEntry>(&plan.old_brick.id)?;
            tx.save(&vol)?;
            Ok::<_, OperationError>(())
        })
    }

    async fn evacuate(&self, executor: &dyn Executor) -> Result<(), OperationError> {
        if !self.evacuating {
            return Ok(());
        }
        let bricks = self
            .ctx
            .db
            .view(|tx| Ok::<_, DbError>(tx.load::<DeviceEntry>(&self.device_id)?.bricks))?;
        for brick_id in &bricks {
            self.replace(executor, brick_id).await?;
        }
        Ok(())
    }
}

impl Operation for DeviceRemoveOperation {
    fn label(&self) -> &'static str {
        "remove device"
    }

    fn id(&self) -> &str {
        &self.op.id
    }

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn build(&mut self) -> Result<(), OperationError> {
        let mut op = PendingOperationEntry::with_id(self.op.id.clone());
        let device_id = &self.device_id;
        let evacuate = self.ctx.db.update(|tx| {
            let mut device = tx.load::<DeviceEntry>(device_id)?;
            if device.state != EntryState::Offline {
                return Err(OperationError::DeviceState {
                    device: device.id.clone(),
                    state: device.state,
                    expected: EntryState::Offline,
                });
            }
            if device.bricks.is_empty() {
                device.state = EntryState::Failed;
                tx.save(&device)?;
                return Ok(false);
            }
            let busy = tx.load_all::<PendingOperationEntry>()?.iter().any(|entry| {
                entry
                    .ids_for(ChangeType::RemoveDevice)
                    .any(|id| id == device.id)
            });
            if busy {
                return Err(OperationError::Conflict {
                    id: device.id.clone(),
                });
            }
            for brick_id in &device.bricks {
                let brick = tx.load::<BrickEntry>(brick_id)?;
                ensure_unowned(&brick)?;
                ensure_unowned(&tx.load::<VolumeEntry>(&brick.volume_id)?)?;
            }
            op.record_remove_device(&device)?;
            op.save(tx)?;
            Ok::<_, OperationError>(true)
        })?;
        self.op = op;
        self.evacuating = evacuate;
        Ok(())
    }

    fn exec<'a>(&'a mut self, executor: &'a dyn Executor) -> OpFuture<'a> {
        Box::pin(self.evacuate(executor))
    }

    fn finalize(&mut self) -> Result<(), OperationError> {
        let op_id = self.op.id.clone();
        let device_id = &self.device_id;
        self.ctx.db.update(|tx| {
            let mut device = tx.load::<DeviceEntry>(device_id)?;
            device.state = EntryState::Failed;
            tx.save(&device)?;
            if let Some(mut op) = tx.try_load::<PendingOperationEntry>(&op_id)? {
                op.delete(tx)?;
            }
            Ok::<_, OperationError>(())
        })?;
        tracing::info!(device = %self.device_id, "device removed");
        Ok(())
    }

    fn rollback<'a>(&'a mut self, _executor: &'a dyn Executor) -> OpFuture<'a> {
        Box::pin(async move {
            let op_id = self.op.id.clone();
            self.ctx.db.update(|tx| {
                if let Some(mut op) = tx.try_load::<PendingOperationEntry>(&op_id)? {
                    op.delete(tx)?;
                }
                Ok::<_, OperationError>(())
            })?;
            tracing::warn!(device = %self.device_id, "device removal abandoned, device left offline");
            Ok(())
        })
    }
}
