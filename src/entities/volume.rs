//! Volume records and block-hosting size arithmetic.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::cluster::{drop_id, push_unique};
use super::{BlockVolumeEntry, PendingEntity, PendingMarker};
use crate::db::{Bucket, DbError, Record, Tx};
use crate::ids::generate_id;

/// Data protection scheme of a volume.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Durability {
    /// Plain distribution, one brick per set.
    None,
    /// Full copies on `replica` bricks per set.
    Replicate {
        /// Copies per brick set.
        replica: u32,
    },
    /// Erasure coding across `data + redundancy` bricks per set.
    Disperse {
        /// Data bricks per set.
        data: u32,
        /// Redundancy bricks per set.
        redundancy: u32,
    },
}

impl Default for Durability {
    fn default() -> Self {
        Self::Replicate { replica: 3 }
    }
}

impl Durability {
    /// Bricks in one set.
    #[must_use]
    pub const fn set_size(self) -> u32 {
        match self {
            Self::None => 1,
            Self::Replicate { replica } => replica,
            Self::Disperse { data, redundancy } => data.saturating_add(redundancy),
        }
    }

    /// Bricks in one set whose capacity adds up to the set's usable size.
    #[must_use]
    pub const fn data_bricks(self) -> u32 {
        match self {
            Self::None | Self::Replicate { .. } => 1,
            Self::Disperse { data, .. } => data,
        }
    }
}

/// Snapshot reserve applied to brick thin pools.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SnapshotPolicy {
    /// Whether snapshots are enabled.
    pub enable: bool,
    /// Thin pool size as a percentage of brick size when enabled.
    pub factor_percent: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            enable: false,
            factor_percent: 100,
        }
    }
}

impl SnapshotPolicy {
    /// Percentage applied to brick sizes when sizing thin pools.
    #[must_use]
    pub const fn effective_factor(self) -> u64 {
        if self.enable { self.factor_percent } else { 100 }
    }
}

/// Whether new block volumes may be placed on a block-hosting volume.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockRestriction {
    /// Accepts new block volumes.
    #[default]
    Unrestricted,
    /// Refuses new block volumes.
    Locked,
    /// Refuses new block volumes until its reserved space is brought up to
    /// date.
    LockedByUpdate,
    /// A value this build does not recognise.
    #[serde(other)]
    Unknown,
}

impl BlockRestriction {
    /// Restrictiveness rank; higher is more restrictive.
    #[must_use]
    pub const fn rank(self) -> Option<u8> {
        match self {
            Self::Unrestricted => Some(0),
            Self::Locked => Some(1),
            Self::LockedByUpdate => Some(2),
            Self::Unknown => None,
        }
    }
}

/// Block-hosting budget of a volume, in GiB.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct BlockHostingInfo {
    /// Space available for new block volumes.
    pub free_size: u64,
    /// Space held back for filesystem overhead.
    pub reserved_size: u64,
    /// Hosted block volume ids.
    pub block_volumes: Vec<String>,
    /// Placement restriction.
    pub restriction: BlockRestriction,
}

/// Descriptive attributes of a volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeInfo {
    /// Volume identifier.
    pub id: String,
    /// Gluster volume name.
    pub name: String,
    /// Size in GiB.
    pub size: u64,
    /// Owning cluster. Empty until placed.
    pub cluster_id: String,
    /// Data protection scheme.
    pub durability: Durability,
    /// Snapshot reserve.
    pub snapshot: SnapshotPolicy,
    /// Extra `gluster volume set` options, as `key value` strings.
    pub gluster_options: Vec<String>,
    /// Whether this volume hosts block volumes.
    pub block: bool,
    /// Block-hosting budget; meaningful only when `block` is set.
    pub block_info: BlockHostingInfo,
}

/// A distributed volume and its bricks.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeEntry {
    /// Volume attributes.
    pub info: VolumeInfo,
    /// Brick ids in set order.
    pub bricks: Vec<String>,
    /// Owning operation, if pending.
    pub pending: PendingMarker,
}

impl Record for VolumeEntry {
    const BUCKET: Bucket = Bucket::Volume;

    fn record_id(&self) -> &str {
        &self.info.id
    }
}

impl PendingEntity for VolumeEntry {
    fn entity_id(&self) -> &str {
        &self.info.id
    }

    fn pending(&self) -> &PendingMarker {
        &self.pending
    }

    fn pending_mut(&mut self) -> &mut PendingMarker {
        &mut self.pending
    }
}

/// Raised when a block-hosting budget change would break its invariants.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BlockSizeError {
    /// Raised when the volume is not block-hosting.
    #[error("volume {volume} is not a block hosting volume")]
    NotBlockHosting {
        /// Volume identifier.
        volume: String,
    },
    /// Raised when a field would drop below zero.
    #[error("volume {volume} {field} may not be set less than zero")]
    Negative {
        /// Volume identifier.
        volume: String,
        /// Field being modified.
        field: &'static str,
    },
    /// Raised when free plus reserved would exceed the volume size.
    #[error("volume {volume} {field} may not be set greater than {size}")]
    Overflow {
        /// Volume identifier.
        volume: String,
        /// Field being modified.
        field: &'static str,
        /// Volume size in GiB.
        size: u64,
    },
}

#[derive(Clone, Copy)]
enum Budget {
    Free,
    Reserved,
}

impl Budget {
    const fn label(self) -> &'static str {
        match self {
            Self::Free => "free size",
            Self::Reserved => "reserved size",
        }
    }
}

/// Usable share of a raw block-hosting size: 98%, rounded down.
#[must_use]
#[expect(
    clippy::integer_division,
    reason = "the reservation is defined as a floored percentage"
)]
pub const fn reduce_raw_size(size: u64) -> u64 {
    size.saturating_mul(98) / 100
}

impl VolumeEntry {
    /// Creates an unplaced volume of `size` GiB. An empty `name` becomes
    /// `vol_<id>`.
    #[must_use]
    pub fn new(name: &str, size: u64, durability: Durability) -> Self {
        let id = generate_id();
        let resolved = if name.trim().is_empty() {
            format!("vol_{id}")
        } else {
            name.trim().to_owned()
        };
        Self {
            info: VolumeInfo {
                id,
                name: resolved,
                size,
                durability,
                ..VolumeInfo::default()
            },
            bricks: Vec::new(),
            pending: PendingMarker::Unowned,
        }
    }

    /// Creates an unplaced block-hosting volume of `size` GiB.
    #[must_use]
    pub fn new_block_hosting(size: u64, options: &[String]) -> Self {
        let mut volume = Self::new("", size, Durability::default());
        volume.info.block = true;
        volume.info.gluster_options = options.to_vec();
        volume
    }

    /// Records a brick in set order.
    pub fn brick_add(&mut self, id: &str) {
        push_unique(&mut self.bricks, id);
    }

    /// Forgets a brick.
    pub fn brick_delete(&mut self, id: &str) {
        drop_id(&mut self.bricks, id);
    }

    fn modify(&mut self, budget: Budget, delta: i64) -> Result<(), BlockSizeError> {
        let field = budget.label();
        if !self.info.block {
            return Err(BlockSizeError::NotBlockHosting {
                volume: self.info.id.clone(),
            });
        }
        let hosting = &self.info.block_info;
        let (current, other) = match budget {
            Budget::Free => (hosting.free_size, hosting.reserved_size),
            Budget::Reserved => (hosting.reserved_size, hosting.free_size),
        };
        let next = current
            .checked_add_signed(delta)
            .ok_or_else(|| BlockSizeError::Negative {
                volume: self.info.id.clone(),
                field,
            })?;
        if next.saturating_add(other) > self.info.size {
            return Err(BlockSizeError::Overflow {
                volume: self.info.id.clone(),
                field,
                size: self.info.size,
            });
        }
        match budget {
            Budget::Free => self.info.block_info.free_size = next,
            Budget::Reserved => self.info.block_info.reserved_size = next,
        }
        Ok(())
    }

    /// Adjusts the free block-hosting space by `delta` GiB: negative when a
    /// block volume takes space, positive when space is returned.
    ///
    /// # Errors
    ///
    /// Returns [`BlockSizeError`] when the result would be negative or free
    /// plus reserved would exceed the volume size. The entry is unchanged on
    /// error.
    pub fn modify_free_size(&mut self, delta: i64) -> Result<(), BlockSizeError> {
        tracing::debug!(
            volume = %self.info.id,
            free = self.info.block_info.free_size,
            delta,
            "modifying free size"
        );
        self.modify(Budget::Free, delta)
    }

    /// Adjusts the reserved block-hosting space by `delta` GiB.
    ///
    /// # Errors
    ///
    /// Returns [`BlockSizeError`] under the same rules as
    /// [`VolumeEntry::modify_free_size`].
    pub fn modify_reserved_size(&mut self, delta: i64) -> Result<(), BlockSizeError> {
        tracing::debug!(
            volume = %self.info.id,
            reserved = self.info.block_info.reserved_size,
            delta,
            "modifying reserved size"
        );
        self.modify(Budget::Reserved, delta)
    }

    /// Adds `delta` GiB of raw capacity, splitting it into free space and a
    /// reservation.
    ///
    /// # Errors
    ///
    /// Returns [`BlockSizeError`] when the split breaks the budget.
    pub fn add_raw_capacity(&mut self, delta: u64) -> Result<(), BlockSizeError> {
        let free_delta = reduce_raw_size(delta);
        let reserved_delta = delta.saturating_sub(free_delta);
        self.modify_free_size(signed(free_delta))?;
        self.modify_reserved_size(signed(reserved_delta))
    }

    /// Resets the budget to describe `size` GiB of raw capacity.
    ///
    /// # Errors
    ///
    /// Returns [`BlockSizeError`] when the split breaks the budget.
    pub fn set_raw_capacity(&mut self, size: u64) -> Result<(), BlockSizeError> {
        self.info.block_info.free_size = 0;
        self.info.block_info.reserved_size = 0;
        self.add_raw_capacity(size)
    }

    /// Space that must be reserved for this volume's size.
    #[must_use]
    pub const fn required_reservation(&self) -> u64 {
        self.info.size.saturating_sub(reduce_raw_size(self.info.size))
    }

    /// Total size of committed block volumes hosted here. Pending block
    /// volumes do not count.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when a hosted block volume cannot be loaded, or
    /// [`BlockSizeError::NotBlockHosting`] wrapped by the caller's error type.
    pub fn total_size_block_volumes(&self, tx: &Tx<'_>) -> Result<u64, HostedSizeError> {
        if !self.info.block {
            return Err(HostedSizeError::Size(BlockSizeError::NotBlockHosting {
                volume: self.info.id.clone(),
            }));
        }
        let mut used: u64 = 0;
        for id in &self.info.block_info.block_volumes {
            let bvol = tx.load::<BlockVolumeEntry>(id)?;
            if bvol.pending.is_pending() {
                continue;
            }
            used = used.saturating_add(bvol.info.size);
        }
        Ok(used)
    }

    /// Returns `true` when size equals used plus free plus reserved.
    #[must_use]
    pub fn block_hosting_size_is_correct(&self, used: u64) -> bool {
        let unused = self
            .info
            .block_info
            .free_size
            .saturating_add(self.info.block_info.reserved_size);
        let correct = self.info.size == used.saturating_add(unused);
        if !correct {
            tracing::warn!(
                volume = %self.info.id,
                size = self.info.size,
                used,
                free = self.info.block_info.free_size,
                reserved = self.info.block_info.reserved_size,
                "block hosting size mismatch"
            );
        }
        correct
    }
}

/// Errors from [`VolumeEntry::total_size_block_volumes`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum HostedSizeError {
    /// Store access failed.
    #[error(transparent)]
    Db(#[from] DbError),
    /// The volume is not block-hosting.
    #[error(transparent)]
    Size(#[from] BlockSizeError),
}

pub(crate) fn signed(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
