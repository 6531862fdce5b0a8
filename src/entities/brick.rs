//! Brick records.

use serde::{Deserialize, Serialize};

use super::{PendingEntity, PendingMarker};
use crate::db::{Bucket, Record};
use crate::ids::generate_id;

/// Smallest storage extent backing a volume, bound to one device.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct BrickEntry {
    /// Brick identifier.
    pub id: String,
    /// Mount path on the node. Empty until known.
    pub path: String,
    /// Device the brick is carved from.
    pub device_id: String,
    /// Node hosting the device.
    pub node_id: String,
    /// Volume the brick belongs to.
    pub volume_id: String,
    /// Usable size in KiB.
    pub size: u64,
    /// Thin pool size in KiB.
    pub tp_size: u64,
    /// Thin pool metadata size in KiB.
    pub pool_metadata_size: u64,
    /// Owning operation, if pending.
    pub pending: PendingMarker,
}

impl Record for BrickEntry {
    const BUCKET: Bucket = Bucket::Brick;

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl PendingEntity for BrickEntry {
    fn entity_id(&self) -> &str {
        &self.id
    }

    fn pending(&self) -> &PendingMarker {
        &self.pending
    }

    fn pending_mut(&mut self) -> &mut PendingMarker {
        &mut self.pending
    }
}

const MIN_POOL_METADATA_KIB: u64 = 2 * 1024;
const MAX_POOL_METADATA_KIB: u64 = 16 * 1024 * 1024;

impl BrickEntry {
    /// Creates a brick of `size` KiB on `device_id`, sizing its thin pool from
    /// the snapshot factor (percent, `100` meaning no snapshot reserve).
    #[must_use]
    pub fn new(
        size: u64,
        snapshot_factor_percent: u64,
        device_id: impl Into<String>,
        node_id: impl Into<String>,
        volume_id: impl Into<String>,
    ) -> Self {
        let tp_size = size.saturating_mul(snapshot_factor_percent.max(100)).div_ceil(100);
        let pool_metadata_size = tp_size
            .div_ceil(200)
            .clamp(MIN_POOL_METADATA_KIB, MAX_POOL_METADATA_KIB);
        let id = generate_id();
        Self {
            path: format!("/var/lib/brickwork/mounts/brick_{id}/brick"),
            id,
            device_id: device_id.into(),
            node_id: node_id.into(),
            volume_id: volume_id.into(),
            size,
            tp_size,
            pool_metadata_size,
            pending: PendingMarker::Unowned,
        }
    }

    /// Creates a brick that shares the thin pool of `parent`. Clones take no
    /// device space of their own and start out with the parent's path until
    /// the clone reports its own.
    #[must_use]
    pub fn clone_of(parent: &Self, volume_id: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            path: parent.path.clone(),
            device_id: parent.device_id.clone(),
            node_id: parent.node_id.clone(),
            volume_id: volume_id.into(),
            size: parent.size,
            tp_size: 0,
            pool_metadata_size: 0,
            pending: PendingMarker::Unowned,
        }
    }

    /// Device space consumed by this brick, in KiB.
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.tp_size.saturating_add(self.pool_metadata_size)
    }

    /// Logical volume name of the brick.
    #[must_use]
    pub fn lv_name(&self) -> String {
        format!("brick_{}", self.id)
    }

    /// Thin pool name of the brick.
    #[must_use]
    pub fn pool_name(&self) -> String {
        format!("tp_{}", self.id)
    }
}
