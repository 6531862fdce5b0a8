//! Multi-step operations and the state machine that drives them.
//!
//! Every operation follows the same protocol. [`Operation::build`] performs
//! all metadata work in one transaction and records a ledger entry.
//! [`Operation::exec`] performs the remote work, re-reading what it needs
//! from the ledger. [`Operation::finalize`] commits the result in one
//! transaction and deletes the entry. [`Operation::rollback`] undoes a
//! failed attempt. Operations that can be recovered after a crash also
//! implement [`CleanableOperation`], whose `clean` and `clean_done` steps are
//! idempotent replays of teardown used by the cleaner.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use crate::db::{Db, DbError};
use crate::entities::{BlockSizeError, CapacityError, EntryState, HostedSizeError};
use crate::executor::{Executor, ExecutorError};
use crate::health::{NodeHealth, cluster_hosts};
use crate::pending::LedgerError;
use crate::placement::{BrickLimits, PlacementError};

mod block_create;
mod block_delete;
mod block_restriction;
mod common;
mod device_remove;
mod load;
mod runner;
mod volume_clone;
mod volume_create;
mod volume_delete;
mod volume_expand;

pub use block_create::BlockVolumeCreateOperation;
pub use block_delete::BlockVolumeDeleteOperation;
pub use block_restriction::SetBlockRestrictionOperation;
pub use device_remove::DeviceRemoveOperation;
pub use load::load_operation;
pub use runner::{RunError, finish_operation, run_operation};
pub use volume_clone::VolumeCloneOperation;
pub use volume_create::VolumeCreateOperation;
pub use volume_delete::VolumeDeleteOperation;
pub use volume_expand::VolumeExpandOperation;

/// Boxed future returned by the asynchronous operation phases.
pub type OpFuture<'a> = Pin<Box<dyn Future<Output = Result<(), OperationError>> + Send + 'a>>;

/// Errors raised by operation phases.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum OperationError {
    /// An entity is already owned by another pending operation.
    #[error("{id} is in use by a pending operation")]
    Conflict {
        /// Entity identifier.
        id: String,
    },
    /// A volume with the requested name already exists.
    #[error("volume name {name} is already in use")]
    NameTaken {
        /// Requested name.
        name: String,
    },
    /// A block-hosting volume is already being created.
    #[error("too many operations in progress, try again later")]
    TooManyOperations,
    /// Block-hosting volumes cannot be cloned.
    #[error("volume {volume} hosts block volumes and cannot be cloned")]
    CloneBlockVolume {
        /// Volume identifier.
        volume: String,
    },
    /// A block-hosting volume is being deleted while still hosting.
    #[error("volume {volume} still hosts block volumes")]
    HostingVolumeInUse {
        /// Volume identifier.
        volume: String,
    },
    /// No hosting volume fits and automatic creation is disabled.
    #[error("block hosting volume creation is disabled and no existing volume can host {size} GiB")]
    BlockHostingDisabled {
        /// Requested block volume size in GiB.
        size: u64,
    },
    /// The block volume would not fit in a new hosting volume.
    #[error("block volume of {requested} GiB exceeds the {max} GiB a new hosting volume provides")]
    BlockSizeTooLarge {
        /// Requested size in GiB.
        requested: u64,
        /// Usable space of a new hosting volume in GiB.
        max: u64,
    },
    /// The hosting volume refuses new block volumes.
    #[error("block hosting volume {volume} is locked")]
    BlockHostingLocked {
        /// Volume identifier.
        volume: String,
    },
    /// The hosting volume lacks the free space the change needs.
    #[error("block hosting volume {volume} has {free} GiB free, {required} GiB required")]
    InsufficientBlockSpace {
        /// Volume identifier.
        volume: String,
        /// Free space in GiB.
        free: u64,
        /// Space needed in GiB.
        required: u64,
    },
    /// The persisted restriction is not one this build understands.
    #[error("volume {volume} has an unrecognised block restriction")]
    UnknownRestriction {
        /// Volume identifier.
        volume: String,
    },
    /// The volume does not host block volumes.
    #[error("volume {volume} is not a block hosting volume")]
    NotBlockHosting {
        /// Volume identifier.
        volume: String,
    },
    /// A device is not in the state the operation requires.
    #[error("device {device} is {state:?}, expected {expected:?}")]
    DeviceState {
        /// Device identifier.
        device: String,
        /// Current state.
        state: EntryState,
        /// Required state.
        expected: EntryState,
    },
    /// No device can take over a brick being evacuated.
    #[error("no replacement device available for brick {brick}")]
    NoReplacement {
        /// Brick identifier.
        brick: String,
    },
    /// The remote and recorded views of an entity disagree.
    #[error("{message}")]
    Inconsistent {
        /// What did not match.
        message: String,
    },
    /// Store access failed.
    #[error(transparent)]
    Db(#[from] DbError),
    /// Ledger bookkeeping failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// Bricks could not be placed.
    #[error(transparent)]
    Placement(#[from] PlacementError),
    /// Device capacity bookkeeping failed.
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    /// Block-hosting size bookkeeping failed.
    #[error(transparent)]
    BlockSize(#[from] BlockSizeError),
    /// A remote call failed.
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    /// The wrapped failure may succeed on a fresh attempt.
    #[error("{0}")]
    Retryable(Box<OperationError>),
}

impl OperationError {
    /// Wraps `err` so the runner rebuilds and retries.
    #[must_use]
    pub fn retryable(err: impl Into<Self>) -> Self {
        Self::Retryable(Box::new(err.into()))
    }

    /// Returns `true` for [`OperationError::Retryable`].
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// The underlying failure with any retry wrapper removed.
    #[must_use]
    pub fn into_inner(self) -> Self {
        match self {
            Self::Retryable(inner) => inner.into_inner(),
            other => other,
        }
    }
}

impl From<HostedSizeError> for OperationError {
    fn from(err: HostedSizeError) -> Self {
        match err {
            HostedSizeError::Db(inner) => Self::Db(inner),
            HostedSizeError::Size(inner) => Self::BlockSize(inner),
        }
    }
}

/// Policy values consulted while building operations.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OperationSettings {
    /// Brick splitting bounds.
    pub limits: BrickLimits,
    /// Retries granted to volume creation.
    pub create_volume_max_retries: u32,
    /// Create a block-hosting volume when none can take a block volume.
    pub auto_create_block_hosting_volume: bool,
    /// Size of automatically created block-hosting volumes in GiB.
    pub block_hosting_volume_size: u64,
    /// Gluster options applied to automatically created block-hosting
    /// volumes.
    pub block_hosting_volume_options: Vec<String>,
}

impl Default for OperationSettings {
    fn default() -> Self {
        Self {
            limits: BrickLimits::default(),
            create_volume_max_retries: 4,
            auto_create_block_hosting_volume: false,
            block_hosting_volume_size: 1100,
            block_hosting_volume_options: vec![String::from("group gluster-block")],
        }
    }
}

/// Everything an operation needs besides the executor.
#[derive(Clone)]
pub struct OperationContext {
    /// Entity store.
    pub db: Arc<Db>,
    /// Policy values.
    pub settings: Arc<OperationSettings>,
    /// Node health oracle consulted when choosing hosts.
    pub health: Arc<dyn NodeHealth>,
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("db", &self.db)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl OperationContext {
    /// Bundles a store, settings and health oracle.
    #[must_use]
    pub fn new(db: Arc<Db>, settings: OperationSettings, health: Arc<dyn NodeHealth>) -> Self {
        Self {
            db,
            settings: Arc::new(settings),
            health,
        }
    }

    /// Management hosts of `cluster_id` believed to be up.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when the cluster cannot be read.
    pub fn hosts(&self, cluster_id: &str) -> Result<Vec<String>, DbError> {
        self.db
            .view(|tx| cluster_hosts(tx, cluster_id, self.health.as_ref()))
    }
}

/// The build, exec, finalize and rollback protocol.
pub trait Operation: Send {
    /// Short human-readable kind, used in logs.
    fn label(&self) -> &'static str;

    /// Identifier of the operation's ledger entry.
    fn id(&self) -> &str;

    /// Context the operation runs in.
    fn context(&self) -> &OperationContext;

    /// Extra exec attempts granted after a retryable failure.
    fn max_retries(&self) -> u32 {
        0
    }

    /// Performs all metadata work in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError`] without changing the store.
    fn build(&mut self) -> Result<(), OperationError>;

    /// Performs the remote work.
    fn exec<'a>(&'a mut self, executor: &'a dyn Executor) -> OpFuture<'a>;

    /// Commits the result and deletes the ledger entry.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError`] when the commit transaction fails.
    fn finalize(&mut self) -> Result<(), OperationError>;

    /// Undoes a failed attempt.
    fn rollback<'a>(&'a mut self, executor: &'a dyn Executor) -> OpFuture<'a>;

    /// The crash-recovery view of this operation, when it has one.
    fn as_cleanable(&mut self) -> Option<&mut dyn CleanableOperation> {
        None
    }
}

/// Operations the cleaner can drive to completion after a crash.
pub trait CleanableOperation: Operation {
    /// Removes remote artefacts, tolerating ones that are already gone.
    fn clean<'a>(&'a mut self, executor: &'a dyn Executor) -> OpFuture<'a>;

    /// Removes the operation's records and ledger entry, restoring capacity.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError`] when the store transaction fails.
    fn clean_done(&mut self) -> Result<(), OperationError>;
}

#[cfg(test)]
mod tests;
