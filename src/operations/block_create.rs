//! Block volume creation, possibly together with a new hosting volume.

use super::common::{
    ReclaimMap, action_ids, commit_entry, discard_created, ensure_unowned, load_entry,
    teardown_volume,
};
use super::volume_create::{VolumeRole, create_volume_remote, place_volume};
use super::{
    CleanableOperation, OpFuture, Operation, OperationContext, OperationError, OperationSettings,
};
use crate::db::{DbError, Tx};
use crate::entities::{
    BlockConnection, BlockRestriction, BlockVolumeEntry, ClusterEntry, NodeEntry, VolumeEntry,
    reduce_raw_size, signed,
};
use crate::executor::{BlockVolumeRequest, Executor, ExecutorError};
use crate::health::{cluster_hosts, cluster_nodes, run_on_host};
use crate::pending::query::hosting_volume_create_pending;
use crate::pending::{ChangeType, PendingOperationEntry};
use crate::placement::candidate_clusters;

/// Checks that `vol` can take a new block volume of `size` GiB.
fn check_hosting_volume(vol: &VolumeEntry, size: u64) -> Result<(), OperationError> {
    if !vol.info.block {
        return Err(OperationError::NotBlockHosting {
            volume: vol.info.id.clone(),
        });
    }
    match vol.info.block_info.restriction {
        BlockRestriction::Unrestricted => {}
        BlockRestriction::Locked | BlockRestriction::LockedByUpdate => {
            return Err(OperationError::BlockHostingLocked {
                volume: vol.info.id.clone(),
            });
        }
        BlockRestriction::Unknown => {
            return Err(OperationError::UnknownRestriction {
                volume: vol.info.id.clone(),
            });
        }
    }
    ensure_unowned(vol)?;
    if vol.info.block_info.free_size < size {
        return Err(OperationError::InsufficientBlockSpace {
            volume: vol.info.id.clone(),
            free: vol.info.block_info.free_size,
            required: size,
        });
    }
    Ok(())
}

/// First committed, unrestricted hosting volume in `clusters` with room for
/// `size` GiB.
fn find_hosting_volume(
    tx: &Tx<'_>,
    clusters: &[String],
    size: u64,
) -> Result<Option<VolumeEntry>, DbError> {
    for cluster_id in candidate_clusters(tx, clusters, true)? {
        let cluster = tx.load::<ClusterEntry>(&cluster_id)?;
        for vol_id in &cluster.volumes {
            let vol = tx.load::<VolumeEntry>(vol_id)?;
            if check_hosting_volume(&vol, size).is_ok() {
                return Ok(Some(vol));
            }
        }
    }
    Ok(None)
}

/// Places a new hosting volume big enough for `size` GiB, recording it
/// against `op`.
fn new_hosting_volume(
    tx: &mut Tx<'_>,
    settings: &OperationSettings,
    op: &mut PendingOperationEntry,
    clusters: &[String],
    size: u64,
) -> Result<VolumeEntry, OperationError> {
    if !settings.auto_create_block_hosting_volume {
        return Err(OperationError::BlockHostingDisabled { size });
    }
    if hosting_volume_create_pending(tx)? {
        return Err(OperationError::TooManyOperations);
    }
    let max = reduce_raw_size(settings.block_hosting_volume_size);
    if size > max {
        return Err(OperationError::BlockSizeTooLarge {
            requested: size,
            max,
        });
    }
    let mut vol = VolumeEntry::new_block_hosting(
        settings.block_hosting_volume_size,
        &settings.block_hosting_volume_options,
    );
    place_volume(tx, settings, op, &mut vol, clusters, VolumeRole::BlockHosting)?;
    Ok(vol)
}

/// Creates a block volume on an existing hosting volume, or on a new one
/// when none fits and automatic creation is enabled.
#[derive(Debug)]
pub struct BlockVolumeCreateOperation {
    ctx: OperationContext,
    op: PendingOperationEntry,
    template: BlockVolumeEntry,
    bvol: BlockVolumeEntry,
    clusters: Vec<String>,
    connection: Option<BlockConnection>,
    reclaimed: ReclaimMap,
}

impl BlockVolumeCreateOperation {
    /// Prepares creation of `bvol`. A non-empty `hosting_volume` on it pins
    /// the hosting volume; otherwise one of `clusters` (any when empty) is
    /// searched.
    #[must_use]
    pub fn new(ctx: OperationContext, bvol: BlockVolumeEntry, clusters: Vec<String>) -> Self {
        Self {
            ctx,
            op: PendingOperationEntry::new(),
            template: bvol.clone(),
            bvol,
            clusters,
            connection: None,
            reclaimed: ReclaimMap::new(),
        }
    }

    pub(super) fn from_entry(
        ctx: OperationContext,
        op: PendingOperationEntry,
        bvol: BlockVolumeEntry,
    ) -> Self {
        Self {
            ctx,
            op,
            template: bvol.clone(),
            bvol,
            clusters: Vec::new(),
            connection: None,
            reclaimed: ReclaimMap::new(),
        }
    }

    /// The block volume as last built.
    #[must_use]
    pub const fn block_volume(&self) -> &BlockVolumeEntry {
        &self.bvol
    }

    /// Picks portal nodes: those whose gluster daemon answers, at most
    /// `hacount` of them (every answering node when zero).
    async fn portal_nodes(
        executor: &dyn Executor,
        nodes: Vec<NodeEntry>,
        hacount: u32,
    ) -> Result<Vec<NodeEntry>, ExecutorError> {
        let wanted = usize::try_from(hacount).unwrap_or(usize::MAX);
        let mut chosen = Vec::new();
        for node in nodes {
            if wanted != 0 && chosen.len() >= wanted {
                break;
            }
            match executor.glusterd_check(&node.manage_hostname).await {
                Ok(()) => chosen.push(node),
                Err(err) => {
                    tracing::warn!(host = %node.manage_hostname, error = %err, "skipping node for block target");
                }
            }
        }
        if chosen.is_empty() || (wanted != 0 && chosen.len() < wanted) {
            return Err(ExecutorError::NoHostsAvailable);
        }
        Ok(chosen)
    }

    async fn create(&self, executor: &dyn Executor) -> Result<BlockConnection, OperationError> {
        let Some(op) = load_entry(&self.ctx, &self.op.id)? else {
            return Err(OperationError::Inconsistent {
                message: format!("pending operation {} has vanished", self.op.id),
            });
        };
        if let Some(action) = op.first_action(ChangeType::AddVolume) {
            create_volume_remote(&self.ctx, executor, &action.id).await?;
        }
        let Some(bvol_id) = op.first_action(ChangeType::AddBlockVolume).map(|a| a.id.clone()) else {
            return Err(OperationError::Inconsistent {
                message: format!("pending operation {} has no block volume", self.op.id),
            });
        };
        let (bvol, vol, nodes) = self.ctx.db.view(|tx| {
            let bvol = tx.load::<BlockVolumeEntry>(&bvol_id)?;
            let vol = tx.load::<VolumeEntry>(&bvol.info.hosting_volume)?;
            let nodes = cluster_nodes(tx, &vol.info.cluster_id, self.ctx.health.as_ref())?;
            Ok::<_, DbError>((bvol, vol, nodes))
        })?;
        let portals = Self::portal_nodes(executor, nodes, bvol.info.hacount).await?;
        let request = BlockVolumeRequest {
            hosting_volume: vol.info.name.clone(),
            name: bvol.info.name.clone(),
            size_gib: bvol.info.size,
            hosts: portals.iter().map(|node| node.storage_hostname.clone()).collect(),
            auth: bvol.info.auth,
        };
        let manage: Vec<String> = portals.into_iter().map(|node| node.manage_hostname).collect();
        let request_ref = &request;
        let connection = run_on_host(&manage, |host| {
            Box::pin(async move { executor.block_volume_create(&host, request_ref).await })
        })
        .await?;
        Ok(connection)
    }

    async fn teardown(&self, executor: &dyn Executor) -> Result<ReclaimMap, OperationError> {
        let Some(op) = load_entry(&self.ctx, &self.op.id)? else {
            return Ok(ReclaimMap::new());
        };
        let new_volume = op.first_action(ChangeType::AddVolume).map(|a| a.id.clone());
        if let Some(bvol_id) = op.first_action(ChangeType::AddBlockVolume).map(|a| a.id.clone()) {
            let found = self.ctx.db.view(|tx| {
                let Some(bvol) = tx.try_load::<BlockVolumeEntry>(&bvol_id)? else {
                    return Ok(None);
                };
                let Some(vol) = tx.try_load::<VolumeEntry>(&bvol.info.hosting_volume)? else {
                    return Ok(None);
                };
                let hosts = cluster_hosts(tx, &vol.info.cluster_id, self.ctx.health.as_ref())?;
                Ok::<_, DbError>(Some((bvol, vol, hosts)))
            })?;
            if let Some((bvol, vol, hosts)) = found {
                let hosting = vol.info.name.as_str();
                let name = bvol.info.name.as_str();
                let outcome = run_on_host(&hosts, |host| {
                    Box::pin(async move { executor.block_volume_destroy(&host, hosting, name).await })
                })
                .await;
                match outcome {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {
                        tracing::debug!(block_volume = %name, "block volume already gone");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        match new_volume {
            Some(vol_id) => {
                let bricks = action_ids(&op, ChangeType::AddBrick);
                teardown_volume(&self.ctx, executor, &vol_id, &bricks).await
            }
            None => Ok(ReclaimMap::new()),
        }
    }
}

impl Operation for BlockVolumeCreateOperation {
    fn label(&self) -> &'static str {
        "create block volume"
    }

    fn id(&self) -> &str {
        &self.op.id
    }

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn build(&mut self) -> Result<(), OperationError> {
        let mut op = PendingOperationEntry::with_id(self.op.id.clone());
        let mut bvol = self.template.clone();
        let settings = &self.ctx.settings;
        let clusters = &self.clusters;
        self.ctx.db.update(|tx| {
            let size = bvol.info.size;
            let mut vol = if bvol.info.hosting_volume.is_empty() {
                match find_hosting_volume(tx, clusters, size)? {
                    Some(existing) => existing,
                    None => new_hosting_volume(tx, settings, &mut op, clusters, size)?,
                }
            } else {
                let existing = tx.load::<VolumeEntry>(&bvol.info.hosting_volume)?;
                check_hosting_volume(&existing, size)?;
                existing
            };
            bvol.info.hosting_volume.clone_from(&vol.info.id);
            bvol.info.cluster_id.clone_from(&vol.info.cluster_id);
            vol.info.block_info.block_volumes.push(bvol.info.id.clone());
            vol.modify_free_size(signed(size).saturating_neg())?;
            op.record_add_block_volume(&mut bvol)?;
            let mut cluster = tx.load::<ClusterEntry>(&vol.info.cluster_id)?;
            cluster.block_volume_add(&bvol.info.id);
            tx.save(&cluster)?;
            tx.save(&vol)?;
            tx.save(&bvol)?;
            op.save(tx)?;
            tracing::debug!(
                block_volume = %bvol.info.id,
                hosting_volume = %vol.info.id,
                free = vol.info.block_info.free_size,
                "block volume placed"
            );
            Ok::<_, OperationError>(())
        })?;
        self.op = op;
        self.bvol = bvol;
        Ok(())
    }

    fn exec<'a>(&'a mut self, executor: &'a dyn Executor) -> OpFuture<'a> {
        Box::pin(async move {
            self.connection = Some(self.create(executor).await?);
            Ok(())
        })
    }

    fn finalize(&mut self) -> Result<(), OperationError> {
        let op_id = self.op.id.clone();
        let bvol_id = self.bvol.info.id.clone();
        let connection = self.connection.clone();
        let saved = self.ctx.db.update(|tx| {
            let Some(mut bvol) = tx.try_load::<BlockVolumeEntry>(&bvol_id)? else {
                return Ok(None);
            };
            if let Some(details) = connection {
                bvol.info.connection = details;
            }
            tx.save(&bvol)?;
            commit_entry(tx, &op_id)?;
            Ok::<_, OperationError>(tx.try_load::<BlockVolumeEntry>(&bvol_id)?)
        })?;
        if let Some(committed) = saved {
            self.bvol = committed;
        }
        tracing::info!(op_id = %op_id, block_volume = %bvol_id, "block volume created");
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

impl CleanableOperation for BlockVolumeCreateOperation {
    fn clean<'a>(&'a mut self, executor: &'a dyn Executor) -> OpFuture<'a> {
        Box::pin(async move {
            self.reclaimed = self.teardown(executor).await?;
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
            let created = action_ids(&op, ChangeType::AddVolume);
            for bvol_id in action_ids(&op, ChangeType::AddBlockVolume) {
                let Some(bvol) = tx.try_load::<BlockVolumeEntry>(&bvol_id)? else {
                    continue;
                };
                let hosting_id = &bvol.info.hosting_volume;
                if !created.contains(hosting_id)
                    && let Some(mut vol) = tx.try_load::<VolumeEntry>(hosting_id)?
                {
                    vol.info.block_info.block_volumes.retain(|id| *id != bvol_id);
                    vol.modify_free_size(signed(bvol.info.size))?;
                    tx.save(&vol)?;
                }
                if let Some(mut cluster) = tx.try_load::<ClusterEntry>(&bvol.info.cluster_id)? {
                    cluster.block_volume_delete(&bvol_id);
                    tx.save(&cluster)?;
                }
                tx.delete::<BlockVolumeEntry>(&bvol_id)?;
            }
            discard_created(tx, &op, reclaimed)?;
            op.delete(tx)?;
            Ok::<_, OperationError>(())
        })?;
        self.reclaimed.clear();
        self.connection = None;
        tracing::debug!(op_id = %op_id, "block volume create cleaned up");
        Ok(())
    }
}
