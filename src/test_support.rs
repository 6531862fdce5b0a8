//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, MutexGuard};

use crate::command::{LaunchError, ProcessOutput, ProcessRunner};
use crate::db::{Db, DbError};
use crate::entities::{ClusterEntry, DeviceEntry, NodeEntry, VolumeEntry};
use crate::health::AllNodesUp;
use crate::operations::{OperationContext, OperationSettings};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// Clones share the same script, so a clone can be handed to an executor
/// while the test keeps inspecting invocations.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<SyncMutex<VecDeque<ProcessOutput>>>,
    invocations: Arc<SyncMutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// Returns the final argument, which for SSH invocations is the remote
    /// script.
    #[must_use]
    pub fn remote_script(&self) -> String {
        self.args
            .last()
            .map(|arg| arg.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.lock().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32, stderr: impl Into<String>) {
        self.push_output(Some(code), "", stderr);
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        exit_code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.lock().push_back(ProcessOutput {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    /// Number of queued responses not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }
}

impl ProcessRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<ProcessOutput, LaunchError> {
        self.invocations.lock().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| LaunchError {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

/// Ids created by [`setup_sample_topology`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SampleTopology {
    /// Cluster ids.
    pub clusters: Vec<String>,
    /// Node ids, grouped by cluster.
    pub nodes: Vec<String>,
    /// Device ids, grouped by node.
    pub devices: Vec<String>,
}

/// Seeds `clusters` clusters, each with `nodes` online nodes carrying
/// `devices` online devices of `disk_kib` KiB.
///
/// Node `n` of cluster `c` is managed as `manage-c-n` and serves storage as
/// `storage-c-n`.
///
/// # Errors
///
/// Returns [`DbError`] when the seed transaction fails.
pub fn setup_sample_topology(
    db: &Db,
    clusters: usize,
    nodes: usize,
    devices: usize,
    disk_kib: u64,
) -> Result<SampleTopology, DbError> {
    db.update(|tx| {
        let mut out = SampleTopology::default();
        for c in 0..clusters {
            let mut cluster = ClusterEntry::new();
            for n in 0..nodes {
                let mut node = NodeEntry::new(
                    &cluster.id,
                    format!("manage-{c}-{n}"),
                    format!("storage-{c}-{n}"),
                    u32::try_from(n).unwrap_or(u32::MAX),
                );
                for d in 0..devices {
                    let device = DeviceEntry::new(&node.id, format!("/dev/sd{d}"), disk_kib);
                    node.device_add(&device.id);
                    out.devices.push(device.id.clone());
                    tx.save(&device)?;
                }
                cluster.node_add(&node.id);
                out.nodes.push(node.id.clone());
                tx.save(&node)?;
            }
            out.clusters.push(cluster.id.clone());
            tx.save(&cluster)?;
        }
        Ok(out)
    })
}

/// Operation context over `db` with default settings and every node
/// reported healthy.
#[must_use]
pub fn test_context(db: Arc<Db>) -> OperationContext {
    OperationContext::new(db, OperationSettings::default(), Arc::new(AllNodesUp))
}

/// Operation context with custom settings.
#[must_use]
pub fn test_context_with(db: Arc<Db>, settings: OperationSettings) -> OperationContext {
    OperationContext::new(db, settings, Arc::new(AllNodesUp))
}

/// Loads every volume record, pending or not.
///
/// # Errors
///
/// Returns [`DbError`] when a volume cannot be decoded.
pub fn all_volumes(db: &Db) -> Result<Vec<VolumeEntry>, DbError> {
    db.view(|tx| tx.load_all::<VolumeEntry>())
}
