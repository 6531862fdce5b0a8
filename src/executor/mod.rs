//! Remote execution against storage hosts.
//!
//! Every call is addressed to a management hostname and returns a boxed
//! future so the trait can be used as `dyn Executor`. "Does not exist" and
//! "already exists" outcomes are reported as distinct [`ExecutorError`]
//! variants so callers can treat them as success where that is safe.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::entities::{BlockConnection, BrickEntry, DeviceEntry, Durability};

mod mock;
mod ssh;

pub use mock::{ExecutorCall, ExecutorMethod, MockExecutor};
pub use ssh::{SshConfig, SshExecutor};

/// Boxed future returned by [`Executor`] methods.
pub type ExecFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ExecutorError>> + Send + 'a>>;

/// Errors reported by executors.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExecutorError {
    /// The target does not exist on the host.
    #[error("{target} does not exist")]
    NotFound {
        /// Volume, brick or block volume name.
        target: String,
    },
    /// The target already exists on the host.
    #[error("{target} already exists")]
    AlreadyExists {
        /// Volume, brick or block volume name.
        target: String,
    },
    /// A command ran and failed.
    #[error("command failed on {host}: {message}")]
    Command {
        /// Host the command ran on.
        host: String,
        /// Failure detail.
        message: String,
    },
    /// The host could not be reached.
    #[error("host {host} is unreachable: {message}")]
    Unreachable {
        /// Host that was contacted.
        host: String,
        /// Connection failure detail.
        message: String,
    },
    /// Command output could not be understood.
    #[error("unexpected output from {host}: {message}")]
    Parse {
        /// Host the command ran on.
        host: String,
        /// Parser failure detail.
        message: String,
    },
    /// Every candidate host was skipped or failed.
    #[error("no hosts available")]
    NoHostsAvailable,
}

impl ExecutorError {
    /// Returns `true` for [`ExecutorError::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` for [`ExecutorError::AlreadyExists`].
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// A brick as the storage host sees it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BrickRequest {
    /// Brick identifier.
    pub id: String,
    /// Volume group backing the brick.
    pub volume_group: String,
    /// Logical volume name.
    pub lv_name: String,
    /// Thin pool name; `None` for clone bricks that share a parent pool.
    pub pool_name: Option<String>,
    /// Brick directory.
    pub path: String,
    /// Usable size in KiB.
    pub size_kib: u64,
    /// Thin pool size in KiB.
    pub tp_size_kib: u64,
    /// Thin pool metadata size in KiB.
    pub pool_metadata_kib: u64,
}

impl BrickRequest {
    /// Describes `brick`, carved from `device`.
    #[must_use]
    pub fn new(brick: &BrickEntry, device: &DeviceEntry) -> Self {
        Self {
            id: brick.id.clone(),
            volume_group: format!("vg_{}", device.id),
            lv_name: brick.lv_name(),
            pool_name: (brick.tp_size > 0).then(|| brick.pool_name()),
            path: brick.path.clone(),
            size_kib: brick.size,
            tp_size_kib: brick.tp_size,
            pool_metadata_kib: brick.pool_metadata_size,
        }
    }

    /// Directory the brick filesystem is mounted on.
    #[must_use]
    pub fn mount_point(&self) -> &str {
        self.path.strip_suffix("/brick").unwrap_or(&self.path)
    }
}

/// A brick address inside a volume, `host:path`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BrickAddress {
    /// Storage hostname.
    pub host: String,
    /// Brick directory.
    pub path: String,
}

impl BrickAddress {
    /// `host:path` form used by gluster.
    #[must_use]
    pub fn spec(&self) -> String {
        format!("{}:{}", self.host, self.path)
    }
}

/// Volume creation or expansion.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeRequest {
    /// Gluster volume name.
    pub name: String,
    /// Data protection scheme.
    pub durability: Durability,
    /// Bricks to create the volume from or add to it, in set order.
    pub bricks: Vec<BrickAddress>,
    /// `key value` options applied after creation.
    pub options: Vec<String>,
}

/// Change applied by [`Executor::volume_modify`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VolumeModify {
    /// Start the volume.
    Start,
    /// Stop the volume.
    Stop,
    /// Apply `key value` options.
    SetOptions(Vec<String>),
}

/// What a host reports about a volume.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VolumeReport {
    /// Volume name.
    pub name: String,
    /// Bricks in gluster order.
    pub bricks: Vec<BrickAddress>,
}

/// Snapshot-and-clone of a volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloneRequest {
    /// Source volume name.
    pub volume: String,
    /// Clone volume name.
    pub clone: String,
}

/// Swap of one brick for another.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplaceBrickRequest {
    /// Volume name.
    pub volume: String,
    /// Brick being removed.
    pub old: BrickAddress,
    /// Brick taking its place.
    pub new: BrickAddress,
}

/// Block volume creation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockVolumeRequest {
    /// Hosting volume name.
    pub hosting_volume: String,
    /// Block volume name.
    pub name: String,
    /// Size in GiB.
    pub size_gib: u64,
    /// Target portal hosts.
    pub hosts: Vec<String>,
    /// Whether CHAP auth is enabled.
    pub auth: bool,
}

/// Remote operations on storage hosts.
pub trait Executor: Send + Sync {
    /// Checks that the gluster daemon answers on `host`.
    fn glusterd_check<'a>(&'a self, host: &'a str) -> ExecFuture<'a, ()>;

    /// Creates the logical volume, filesystem and mount backing a brick.
    fn brick_create<'a>(&'a self, host: &'a str, brick: &'a BrickRequest) -> ExecFuture<'a, ()>;

    /// Tears a brick down. Resolves to `true` when its device space was
    /// released.
    fn brick_destroy<'a>(&'a self, host: &'a str, brick: &'a BrickRequest)
    -> ExecFuture<'a, bool>;

    /// Creates and starts a volume.
    fn volume_create<'a>(&'a self, host: &'a str, volume: &'a VolumeRequest)
    -> ExecFuture<'a, ()>;

    /// Stops and deletes a volume.
    fn volume_destroy<'a>(&'a self, host: &'a str, name: &'a str) -> ExecFuture<'a, ()>;

    /// Checks that a volume exists and may be deleted.
    fn volume_destroy_check<'a>(&'a self, host: &'a str, name: &'a str) -> ExecFuture<'a, ()>;

    /// Adds bricks to a volume.
    fn volume_expand<'a>(&'a self, host: &'a str, volume: &'a VolumeRequest)
    -> ExecFuture<'a, ()>;

    /// Starts, stops or configures a volume.
    fn volume_modify<'a>(
        &'a self,
        host: &'a str,
        name: &'a str,
        change: &'a VolumeModify,
    ) -> ExecFuture<'a, ()>;

    /// Reports a volume's bricks.
    fn volume_info<'a>(&'a self, host: &'a str, name: &'a str) -> ExecFuture<'a, VolumeReport>;

    /// Clones a volume through a snapshot, reporting the clone's bricks in
    /// the same order as the source's.
    fn volume_clone<'a>(
        &'a self,
        host: &'a str,
        request: &'a CloneRequest,
    ) -> ExecFuture<'a, VolumeReport>;

    /// Replaces one brick of a volume with another.
    fn volume_replace_brick<'a>(
        &'a self,
        host: &'a str,
        request: &'a ReplaceBrickRequest,
    ) -> ExecFuture<'a, ()>;

    /// Creates a block volume, returning its connection details.
    fn block_volume_create<'a>(
        &'a self,
        host: &'a str,
        request: &'a BlockVolumeRequest,
    ) -> ExecFuture<'a, BlockConnection>;

    /// Deletes a block volume.
    fn block_volume_destroy<'a>(
        &'a self,
        host: &'a str,
        hosting_volume: &'a str,
        name: &'a str,
    ) -> ExecFuture<'a, ()>;
}
