//! Block device records and capacity bookkeeping.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::EntryState;
use super::cluster::{drop_id, push_unique};
use crate::db::{Bucket, Record};
use crate::ids::generate_id;

/// Raised when a device cannot satisfy a capacity change.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CapacityError {
    /// Raised when an allocation exceeds the free space.
    #[error("device {device} has {free} KiB free, cannot allocate {requested} KiB")]
    Exhausted {
        /// Device identifier.
        device: String,
        /// Free space in KiB.
        free: u64,
        /// Requested space in KiB.
        requested: u64,
    },
    /// Raised when releasing more space than is in use.
    #[error("device {device} has {used} KiB used, cannot release {requested} KiB")]
    Underflow {
        /// Device identifier.
        device: String,
        /// Used space in KiB.
        used: u64,
        /// Released space in KiB.
        requested: u64,
    },
}

/// A raw disk on a node that bricks are carved from.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct DeviceEntry {
    /// Device identifier.
    pub id: String,
    /// Owning node.
    pub node_id: String,
    /// Device path on the node, for example `/dev/sdb`.
    pub name: String,
    /// Administrative state.
    pub state: EntryState,
    /// Total capacity in KiB.
    pub total_size: u64,
    /// Unallocated capacity in KiB.
    pub free_size: u64,
    /// Allocated capacity in KiB.
    pub used_size: u64,
    /// Brick ids carved from this device.
    pub bricks: Vec<String>,
}

impl Record for DeviceEntry {
    const BUCKET: Bucket = Bucket::Device;

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl DeviceEntry {
    /// Creates an empty online device of `total_size` KiB.
    #[must_use]
    pub fn new(node_id: impl Into<String>, name: impl Into<String>, total_size: u64) -> Self {
        Self {
            id: generate_id(),
            node_id: node_id.into(),
            name: name.into(),
            state: EntryState::Online,
            total_size,
            free_size: total_size,
            used_size: 0,
            bricks: Vec::new(),
        }
    }

    /// Returns `true` when `amount` KiB would fit.
    #[must_use]
    pub const fn storage_check(&self, amount: u64) -> bool {
        self.free_size >= amount
    }

    /// Moves `amount` KiB from free to used.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError::Exhausted`] when the device is too small.
    pub fn storage_allocate(&mut self, amount: u64) -> Result<(), CapacityError> {
        let free = self
            .free_size
            .checked_sub(amount)
            .ok_or_else(|| CapacityError::Exhausted {
                device: self.id.clone(),
                free: self.free_size,
                requested: amount,
            })?;
        self.free_size = free;
        self.used_size = self.used_size.saturating_add(amount);
        Ok(())
    }

    /// Moves `amount` KiB from used back to free.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError::Underflow`] when less than `amount` is used.
    pub fn storage_free(&mut self, amount: u64) -> Result<(), CapacityError> {
        let used = self
            .used_size
            .checked_sub(amount)
            .ok_or_else(|| CapacityError::Underflow {
                device: self.id.clone(),
                used: self.used_size,
                requested: amount,
            })?;
        self.used_size = used;
        self.free_size = self.free_size.saturating_add(amount);
        Ok(())
    }

    /// Records a brick carved from this device.
    pub fn brick_add(&mut self, id: &str) {
        push_unique(&mut self.bricks, id);
    }

    /// Forgets a brick.
    pub fn brick_delete(&mut self, id: &str) {
        drop_id(&mut self.bricks, id);
    }

    /// Returns `true` when the device accepts new bricks.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.state == EntryState::Online
    }
}
