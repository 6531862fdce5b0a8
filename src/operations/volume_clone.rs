//! Snapshot-and-clone of a volume.
//!
//! Clone bricks share the thin pools of their parent's bricks, so they take
//! no device space. Their paths are only known once the host reports the
//! clone; until then they carry the parent's path and must never be used to
//! address the host.

use super::common::{
    BrickTarget, ReclaimMap, action_ids, destroy_bricks, destroy_volume, ensure_unowned,
    load_entry, release_bricks, remove_volume,
};
use super::{CleanableOperation, OpFuture, Operation, OperationContext, OperationError};
use crate::db::DbError;
use crate::entities::{BrickEntry, ClusterEntry, DeviceEntry, NodeEntry, VolumeEntry};
use crate::executor::{
    BrickRequest, CloneRequest, Executor, ExecutorError, VolumeModify, VolumeReport,
};
use crate::health::{cluster_hosts, run_on_host};
use crate::pending::{ChangeType, PendingOperationEntry};

/// What exec and clean need from the ledger: parent, clone and clone bricks.
struct CloneRecord {
    parent: VolumeEntry,
    clone: VolumeEntry,
    bricks: Vec<BrickEntry>,
    hosts: Vec<String>,
}

/// Clones a volume through a gluster snapshot.
#[derive(Debug)]
pub struct VolumeCloneOperation {
    ctx: OperationContext,
    op: PendingOperationEntry,
    parent_id: String,
    clone_name: String,
    clone_id: Option<String>,
    paths: Vec<String>,
}

impl VolumeCloneOperation {
    /// Prepares a clone of `parent_id` named `clone_name`; an empty name is
    /// generated from the clone's id.
    #[must_use]
    pub fn new(ctx: OperationContext, parent_id: impl Into<String>, clone_name: impl Into<String>) -> Self {
        Self {
            ctx,
            op: PendingOperationEntry::new(),
            parent_id: parent_id.into(),
            clone_name: clone_name.into(),
            clone_id: None,
            paths: Vec::new(),
        }
    }

    pub(super) fn from_entry(ctx: OperationContext, op: PendingOperationEntry, parent_id: String) -> Self {
        let clone_id = op
            .first_action(ChangeType::AddVolumeClone)
            .map(|action| action.id.clone());
        Self {
            ctx,
            op,
            parent_id,
            clone_name: String::new(),
            clone_id,
            paths: Vec::new(),
        }
    }

    /// Id of the clone volume, once built.
    #[must_use]
    pub fn clone_id(&self) -> Option<&str> {
        self.clone_id.as_deref()
    }

    fn recorded(&self) -> Result<Option<CloneRecord>, DbError> {
        let Some(op) = load_entry(&self.ctx, &self.op.id)? else {
            return Ok(None);
        };
        let (Some(parent_id), Some(clone_id)) = (
            op.first_action(ChangeType::CloneVolume).map(|a| a.id.clone()),
            op.first_action(ChangeType::AddVolumeClone).map(|a| a.id.clone()),
        ) else {
            return Ok(None);
        };
        let brick_ids = action_ids(&op, ChangeType::AddBrick);
        self.ctx.db.view(|tx| {
            let Some(clone) = tx.try_load::<VolumeEntry>(&clone_id)? else {
                return Ok(None);
            };
            let parent = tx.load::<VolumeEntry>(&parent_id)?;
            let mut bricks = Vec::with_capacity(brick_ids.len());
            for id in &brick_ids {
                if let Some(brick) = tx.try_load::<BrickEntry>(id)? {
                    bricks.push(brick);
                }
            }
            let hosts = cluster_hosts(tx, &parent.info.cluster_id, self.ctx.health.as_ref())?;
            Ok(Some(CloneRecord {
                parent,
                clone,
                bricks,
                hosts,
            }))
        })
    }

    async fn clone_remote(&self, executor: &dyn Executor) -> Result<Vec<String>, OperationError> {
        let Some(record) = self.recorded()? else {
            return Err(OperationError::Inconsistent {
                message: format!("pending operation {} has no clone recorded", self.op.id),
            });
        };
        let request = CloneRequest {
            volume: record.parent.info.name.clone(),
            clone: record.clone.info.name.clone(),
        };
        let request_ref = &request;
        let cloned = run_on_host(&record.hosts, |host| {
            Box::pin(async move { executor.volume_clone(&host, request_ref).await })
        })
        .await;
        let name = record.clone.info.name.as_str();
        let report = match cloned {
            Ok(report) => report,
            Err(ExecutorError::AlreadyExists { .. }) => {
                tracing::debug!(volume = %name, "clone already exists, reading its bricks");
                run_on_host(&record.hosts, |host| {
                    Box::pin(async move { executor.volume_info(&host, name).await })
                })
                .await?
            }
            Err(err) => return Err(err.into()),
        };
        let paths = clone_paths(&report, record.bricks.len())?;
        let start = VolumeModify::Start;
        let start_ref = &start;
        run_on_host(&record.hosts, |host| {
            Box::pin(async move { executor.volume_modify(&host, name, start_ref).await })
        })
        .await?;
        Ok(paths)
    }

    async fn teardown(&self, executor: &dyn Executor) -> Result<(), OperationError> {
        let Some(record) = self.recorded()? else {
            return Ok(());
        };
        let name = record.clone.info.name.as_str();
        let report = run_on_host(&record.hosts, |host| {
            Box::pin(async move { executor.volume_info(&host, name).await })
        })
        .await;
        let reported = match report {
            Ok(found) => found,
            Err(err) if err.is_not_found() => {
                tracing::debug!(volume = %name, "clone never created");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let paths = clone_paths(&reported, record.bricks.len())?;
        destroy_volume(executor, &record.hosts, name).await?;
        let targets = self.ctx.db.view(|tx| {
            let mut targets = Vec::with_capacity(record.bricks.len());
            for (brick, path) in record.bricks.iter().zip(paths) {
                let device = tx.load::<DeviceEntry>(&brick.device_id)?;
                let node = tx.load::<NodeEntry>(&brick.node_id)?;
                let mut request = BrickRequest::new(brick, &device);
                request.path = path;
                targets.push(BrickTarget {
                    manage_host: node.manage_hostname,
                    storage_host: node.storage_hostname,
                    request,
                });
            }
            Ok::<_, DbError>(targets)
        })?;
        destroy_bricks(executor, &targets).await?;
        Ok(())
    }
}

/// Brick paths of a reported clone, checked against the recorded count.
fn clone_paths(report: &VolumeReport, expected: usize) -> Result<Vec<String>, OperationError> {
    if report.bricks.len() != expected {
        return Err(OperationError::Inconsistent {
            message: format!(
                "clone {} reported {} bricks, {} recorded",
                report.name,
                report.bricks.len(),
                expected
            ),
        });
    }
    Ok(report.bricks.iter().map(|brick| brick.path.clone()).collect())
}

impl Operation for VolumeCloneOperation {
    fn label(&self) -> &'static str {
        "clone volume"
    }

    fn id(&self) -> &str {
        &self.op.id
    }

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn build(&mut self) -> Result<(), OperationError> {
        let mut op = PendingOperationEntry::with_id(self.op.id.clone());
        let parent_id = &self.parent_id;
        let clone_name = &self.clone_name;
        let clone_id = self.ctx.db.update(|tx| {
            let mut parent = tx.load::<VolumeEntry>(parent_id)?;
            ensure_unowned(&parent)?;
            if parent.info.block {
                return Err(OperationError::CloneBlockVolume {
                    volume: parent.info.id.clone(),
                });
            }
            let mut clone = VolumeEntry::new(clone_name, parent.info.size, parent.info.durability);
            if tx
                .load_all::<VolumeEntry>()?
                .iter()
                .any(|existing| existing.info.name == clone.info.name)
            {
                return Err(OperationError::NameTaken {
                    name: clone.info.name.clone(),
                });
            }
            clone.info.cluster_id.clone_from(&parent.info.cluster_id);
            clone.info.snapshot = parent.info.snapshot;
            clone.info.gluster_options.clone_from(&parent.info.gluster_options);
            op.record_clone_volume(&mut parent)?;
            op.record_add_volume_clone(&mut clone)?;
            for parent_brick_id in &parent.bricks {
                let parent_brick = tx.load::<BrickEntry>(parent_brick_id)?;
                let mut brick = BrickEntry::clone_of(&parent_brick, &clone.info.id);
                let mut device = tx.load::<DeviceEntry>(&brick.device_id)?;
                device.brick_add(&brick.id);
                op.record_add_brick(&mut brick)?;
                clone.brick_add(&brick.id);
                tx.save(&device)?;
                tx.save(&brick)?;
            }
            let mut cluster = tx.load::<ClusterEntry>(&clone.info.cluster_id)?;
            cluster.volume_add(&clone.info.id);
            tx.save(&cluster)?;
            tx.save(&parent)?;
            tx.save(&clone)?;
            op.save(tx)?;
            Ok::<_, OperationError>(clone.info.id.clone())
        })?;
        self.op = op;
        self.clone_id = Some(clone_id);
        self.paths.clear();
        Ok(())
    }

    fn exec<'a>(&'a mut self, executor: &'a dyn Executor) -> OpFuture<'a> {
        Box::pin(async move {
            self.paths = self.clone_remote(executor).await?;
            Ok(())
        })
    }

    fn finalize(&mut self) -> Result<(), OperationError> {
        let op_id = self.op.id.clone();
        let paths = &self.paths;
        self.ctx.db.update(|tx| {
            let Some(mut op) = tx.try_load::<PendingOperationEntry>(&op_id)? else {
                return Ok(());
            };
            let bricks = action_ids(&op, ChangeType::AddBrick);
            for (id, path) in bricks.iter().zip(paths) {
                let mut brick = tx.load::<BrickEntry>(id)?;
                brick.path.clone_from(path);
                op.finalize(&mut brick);
                tx.save(&brick)?;
            }
            for action in &op.actions {
                if matches!(action.change, ChangeType::CloneVolume | ChangeType::AddVolumeClone)
                    && let Some(mut vol) = tx.try_load::<VolumeEntry>(&action.id)?
                {
                    op.finalize(&mut vol);
                    tx.save(&vol)?;
                }
            }
            op.delete(tx)?;
            Ok::<_, OperationError>(())
        })?;
        tracing::info!(op_id = %op_id, parent = %self.parent_id, clone = ?self.clone_id, "volume cloned");
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

impl CleanableOperation for VolumeCloneOperation {
    fn clean<'a>(&'a mut self, executor: &'a dyn Executor) -> OpFuture<'a> {
        Box::pin(self.teardown(executor))
    }

    fn clean_done(&mut self) -> Result<(), OperationError> {
        let op_id = self.op.id.clone();
        self.ctx.db.update(|tx| {
            let Some(mut op) = tx.try_load::<PendingOperationEntry>(&op_id)? else {
                return Ok(());
            };
            let untouched = ReclaimMap::new();
            release_bricks(tx, op.ids_for(ChangeType::AddBrick), &untouched)?;
            for clone_id in action_ids(&op, ChangeType::AddVolumeClone) {
                remove_volume(tx, &clone_id, &untouched)?;
            }
            for parent_id in op.ids_for(ChangeType::CloneVolume) {
                if let Some(mut parent) = tx.try_load::<VolumeEntry>(parent_id)? {
                    op.finalize(&mut parent);
                    tx.save(&parent)?;
                }
            }
            op.delete(tx)?;
            Ok::<_, OperationError>(())
        })?;
        self.paths.clear();
        tracing::debug!(op_id = %op_id, "volume clone cleaned up");
        Ok(())
    }
}
