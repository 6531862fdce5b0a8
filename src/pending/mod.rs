//! Pending operation ledger.
//!
//! A [`PendingOperationEntry`] is the durable record of one in-flight,
//! multi-step change. The `record_*` helpers append an action, fix the entry's
//! operation type on first use and claim the affected entity by setting its
//! pending marker; [`PendingOperationEntry::finalize`] releases the claim.
//! The entry is deleted once its operation completes: there is no "done"
//! status.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::{Bucket, DbError, Record, Tx};
use crate::entities::{
    BlockVolumeEntry, BrickEntry, DeviceEntry, PendingEntity, PendingMarker, VolumeEntry,
};
use crate::ids::generate_id;

pub mod purge;
pub mod query;
pub mod reset;

/// Kind of multi-step change a ledger entry describes.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// No action recorded yet.
    #[default]
    Unknown,
    /// Creating a volume.
    CreateVolume,
    /// Deleting a volume.
    DeleteVolume,
    /// Growing a volume.
    ExpandVolume,
    /// Creating a block volume, possibly with a new hosting volume.
    CreateBlockVolume,
    /// Deleting a block volume.
    DeleteBlockVolume,
    /// Evacuating a device.
    RemoveDevice,
    /// Cloning a volume.
    CloneVolume,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unknown => "unknown",
            Self::CreateVolume => "create-volume",
            Self::DeleteVolume => "delete-volume",
            Self::ExpandVolume => "expand-volume",
            Self::CreateBlockVolume => "create-block-volume",
            Self::DeleteBlockVolume => "delete-block-volume",
            Self::RemoveDevice => "remove-device",
            Self::CloneVolume => "clone-volume",
        };
        f.write_str(label)
    }
}

/// Change applied to a single entity by an operation.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// A brick is being created.
    AddBrick,
    /// A volume is being created.
    AddVolume,
    /// A brick is being deleted.
    DeleteBrick,
    /// A volume is being deleted.
    DeleteVolume,
    /// A volume is being grown.
    ExpandVolume,
    /// A block volume is being created.
    AddBlockVolume,
    /// A block volume is being deleted.
    DeleteBlockVolume,
    /// A device is being evacuated.
    RemoveDevice,
    /// A volume is the source of a clone.
    CloneVolume,
    /// A volume is being snapshotted.
    SnapshotVolume,
    /// A volume is being created as a clone.
    AddVolumeClone,
}

/// Typed payload attached to an action.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionDelta {
    /// Size increase in GiB.
    SizeGib(u64),
}

/// One entity touched by an operation.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PendingOperationAction {
    /// Change applied to the entity.
    pub change: ChangeType,
    /// Affected entity id.
    pub id: String,
    /// Optional payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<ActionDelta>,
}

/// Reaping eligibility of a ledger entry.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum OperationStatus {
    /// Owned by a running operation.
    #[default]
    #[serde(rename = "")]
    New,
    /// The owning process probably died.
    #[serde(rename = "stale")]
    Stale,
    /// Rollback or cleanup failed.
    #[serde(rename = "failed")]
    Failed,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::Stale => "stale",
            Self::Failed => "failed",
        })
    }
}

/// Errors raised while recording or persisting ledger entries.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LedgerError {
    /// Raised when an entry would describe two operation kinds.
    #[error("pending operation {id} is a {current} operation, cannot record {requested}")]
    TypeConflict {
        /// Entry identifier.
        id: String,
        /// Type already recorded.
        current: OperationType,
        /// Type implied by the new record.
        requested: OperationType,
    },
    /// Raised when saving an entry with actions but no type.
    #[error("pending operation {id} has actions but no operation type")]
    MissingType {
        /// Entry identifier.
        id: String,
    },
    /// Raised when an entity is already claimed by another operation.
    #[error("{id} is already owned by pending operation {owner}")]
    AlreadyOwned {
        /// Entity identifier.
        id: String,
        /// Owning operation.
        owner: String,
    },
    /// Store access failed.
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Current wall clock time in Unix seconds.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
}

/// Durable record of an in-flight operation.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PendingOperationEntry {
    /// Entry identifier.
    pub id: String,
    /// Operation kind, fixed by the first primary record.
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Creation time in Unix seconds.
    pub timestamp: i64,
    /// Entities touched, in recording order.
    pub actions: Vec<PendingOperationAction>,
    /// Reaping eligibility.
    #[serde(default)]
    pub status: OperationStatus,
}

impl Record for PendingOperationEntry {
    const BUCKET: Bucket = Bucket::PendingOperation;

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Default for PendingOperationEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingOperationEntry {
    /// Creates an empty entry with a fresh id, timestamped now.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(generate_id())
    }

    /// Creates an empty entry with the given id, timestamped now.
    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            op_type: OperationType::Unknown,
            timestamp: unix_now(),
            actions: Vec::new(),
            status: OperationStatus::New,
        }
    }

    /// Overrides the creation time.
    #[must_use]
    pub const fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Loads the entry stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] when no such entry exists.
    pub fn load(tx: &Tx<'_>, id: &str) -> Result<Self, DbError> {
        tx.load(id)
    }

    /// Lists every ledger entry id.
    ///
    /// # Errors
    ///
    /// Returns the store error when the ledger cannot be read.
    pub fn list(tx: &Tx<'_>) -> Result<Vec<String>, DbError> {
        tx.ids::<Self>()
    }

    /// Persists the entry.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::MissingType`] when actions exist without a type,
    /// or the store error.
    pub fn save(&self, tx: &mut Tx<'_>) -> Result<(), LedgerError> {
        if !self.actions.is_empty() && self.op_type == OperationType::Unknown {
            return Err(LedgerError::MissingType {
                id: self.id.clone(),
            });
        }
        tx.save(self)?;
        Ok(())
    }

    /// Removes the entry from the store and clears its in-memory type and
    /// actions so the value cannot be saved again by mistake.
    ///
    /// # Errors
    ///
    /// Returns the store error; a missing entry is not an error.
    pub fn delete(&mut self, tx: &mut Tx<'_>) -> Result<(), DbError> {
        self.op_type = OperationType::Unknown;
        self.actions.clear();
        match tx.delete::<Self>(&self.id) {
            Ok(()) | Err(DbError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Ids of entities touched with `change`, in recording order.
    pub fn ids_for(&self, change: ChangeType) -> impl Iterator<Item = &str> {
        self.actions
            .iter()
            .filter(move |action| action.change == change)
            .map(|action| action.id.as_str())
    }

    /// First action with `change`, if any.
    #[must_use]
    pub fn first_action(&self, change: ChangeType) -> Option<&PendingOperationAction> {
        self.actions.iter().find(|action| action.change == change)
    }

    fn set_type(&mut self, requested: OperationType) -> Result<(), LedgerError> {
        if self.op_type == OperationType::Unknown {
            self.op_type = requested;
            return Ok(());
        }
        if self.op_type == requested {
            return Ok(());
        }
        Err(LedgerError::TypeConflict {
            id: self.id.clone(),
            current: self.op_type,
            requested,
        })
    }

    fn claim<E: PendingEntity>(&self, entity: &mut E) -> Result<(), LedgerError> {
        if let Some(owner) = entity.pending().owner()
            && owner != self.id
        {
            return Err(LedgerError::AlreadyOwned {
                id: entity.entity_id().to_owned(),
                owner: owner.to_owned(),
            });
        }
        *entity.pending_mut() = PendingMarker::OwnedBy(self.id.clone());
        Ok(())
    }

    fn record<E: PendingEntity>(
        &mut self,
        entity: &mut E,
        change: ChangeType,
        op_type: Option<OperationType>,
        delta: Option<ActionDelta>,
    ) -> Result<(), LedgerError> {
        self.claim(entity)?;
        if let Some(requested) = op_type {
            self.set_type(requested)?;
        }
        self.actions.push(PendingOperationAction {
            change,
            id: entity.entity_id().to_owned(),
            delta,
        });
        Ok(())
    }

    /// Records a new volume.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on a type conflict or foreign ownership.
    pub fn record_add_volume(&mut self, vol: &mut VolumeEntry) -> Result<(), LedgerError> {
        self.record(vol, ChangeType::AddVolume, Some(OperationType::CreateVolume), None)
    }

    /// Records a new block-hosting volume created on behalf of a block volume.
    /// Does not fix the operation type.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on foreign ownership.
    pub fn record_add_hosting_volume(&mut self, vol: &mut VolumeEntry) -> Result<(), LedgerError> {
        self.record(vol, ChangeType::AddVolume, None, None)
    }

    /// Records a new brick.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on foreign ownership.
    pub fn record_add_brick(&mut self, brick: &mut BrickEntry) -> Result<(), LedgerError> {
        self.record(brick, ChangeType::AddBrick, None, None)
    }

    /// Records a brick for deletion.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on foreign ownership.
    pub fn record_delete_brick(&mut self, brick: &mut BrickEntry) -> Result<(), LedgerError> {
        self.record(brick, ChangeType::DeleteBrick, None, None)
    }

    /// Records a volume for deletion.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on a type conflict or foreign ownership.
    pub fn record_delete_volume(&mut self, vol: &mut VolumeEntry) -> Result<(), LedgerError> {
        self.record(vol, ChangeType::DeleteVolume, Some(OperationType::DeleteVolume), None)
    }

    /// Records growth of `vol` by `size_gib`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on a type conflict or foreign ownership.
    pub fn record_expand_volume(
        &mut self,
        vol: &mut VolumeEntry,
        size_gib: u64,
    ) -> Result<(), LedgerError> {
        self.record(
            vol,
            ChangeType::ExpandVolume,
            Some(OperationType::ExpandVolume),
            Some(ActionDelta::SizeGib(size_gib)),
        )
    }

    /// Records a new block volume.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on a type conflict or foreign ownership.
    pub fn record_add_block_volume(
        &mut self,
        bvol: &mut BlockVolumeEntry,
    ) -> Result<(), LedgerError> {
        self.record(
            bvol,
            ChangeType::AddBlockVolume,
            Some(OperationType::CreateBlockVolume),
            None,
        )
    }

    /// Records a block volume for deletion.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on a type conflict or foreign ownership.
    pub fn record_delete_block_volume(
        &mut self,
        bvol: &mut BlockVolumeEntry,
    ) -> Result<(), LedgerError> {
        self.record(
            bvol,
            ChangeType::DeleteBlockVolume,
            Some(OperationType::DeleteBlockVolume),
            None,
        )
    }

    /// Records the source volume of a clone.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on a type conflict or foreign ownership.
    pub fn record_clone_volume(&mut self, vol: &mut VolumeEntry) -> Result<(), LedgerError> {
        self.record(vol, ChangeType::CloneVolume, Some(OperationType::CloneVolume), None)
    }

    /// Records the volume created by a clone.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on foreign ownership.
    pub fn record_add_volume_clone(&mut self, vol: &mut VolumeEntry) -> Result<(), LedgerError> {
        self.record(vol, ChangeType::AddVolumeClone, None, None)
    }

    /// Records a device evacuation. Devices carry no pending marker; the
    /// ledger action alone links the entry to the device.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::TypeConflict`] when the entry already has
    /// another type.
    pub fn record_remove_device(&mut self, device: &DeviceEntry) -> Result<(), LedgerError> {
        self.set_type(OperationType::RemoveDevice)?;
        self.actions.push(PendingOperationAction {
            change: ChangeType::RemoveDevice,
            id: device.id.clone(),
            delta: None,
        });
        Ok(())
    }

    /// Releases `entity` from this operation. The ledger entry itself is not
    /// touched.
    pub fn finalize<E: PendingEntity>(&self, entity: &mut E) {
        if entity.pending().is_owned_by(&self.id) {
            *entity.pending_mut() = PendingMarker::Unowned;
        }
    }
}
