//! Control plane core for a distributed storage cluster.
//!
//! Every multi-step change to cluster state runs as an operation with a
//! metadata-only build phase, a remote exec phase and a metadata-only
//! finalize phase. A durable ledger entry records what each operation
//! touches, and entities carry a pending marker naming the entry that owns
//! them, so work abandoned by a crash can be found and cleaned up later.
//!
//! The crate provides the transactional store, the entity model, the
//! ledger, the eight operation kinds with their runner, the cleaner that
//! reaps abandoned operations, and a job queue that runs operations off the
//! request path.

pub mod block_sizes;
pub mod cleaner;
pub mod command;
pub mod config;
pub mod db;
pub mod entities;
pub mod executor;
pub mod health;
pub mod ids;
pub mod jobs;
pub mod operations;
pub mod pending;
pub mod placement;
pub mod test_support;

pub use cleaner::{BackgroundCleaner, OpClass, OpTracker, OperationCleaner, Selector};
pub use config::{ConfigError, ServiceConfig};
pub use db::{Db, DbError, Tx};
pub use executor::{Executor, ExecutorError, MockExecutor, SshConfig, SshExecutor};
pub use jobs::{JobQueue, JobStatus};
pub use operations::{
    CleanableOperation, Operation, OperationContext, OperationError, OperationSettings, RunError,
    run_operation,
};
pub use pending::{OperationStatus, OperationType, PendingOperationEntry};
