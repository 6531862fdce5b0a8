//! In-process executor that records calls and succeeds unless told
//! otherwise.

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;

use super::{
    BlockVolumeRequest, BrickAddress, BrickRequest, CloneRequest, ExecFuture, Executor,
    ExecutorError, ReplaceBrickRequest, VolumeModify, VolumeReport, VolumeRequest,
};
use crate::entities::BlockConnection;
use crate::ids::generate_id;

/// Executor entry points, used to script failures and count calls.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ExecutorMethod {
    /// [`Executor::glusterd_check`].
    GlusterdCheck,
    /// [`Executor::brick_create`].
    BrickCreate,
    /// [`Executor::brick_destroy`].
    BrickDestroy,
    /// [`Executor::volume_create`].
    VolumeCreate,
    /// [`Executor::volume_destroy`].
    VolumeDestroy,
    /// [`Executor::volume_destroy_check`].
    VolumeDestroyCheck,
    /// [`Executor::volume_expand`].
    VolumeExpand,
    /// [`Executor::volume_modify`].
    VolumeModify,
    /// [`Executor::volume_info`].
    VolumeInfo,
    /// [`Executor::volume_clone`].
    VolumeClone,
    /// [`Executor::volume_replace_brick`].
    VolumeReplaceBrick,
    /// [`Executor::block_volume_create`].
    BlockVolumeCreate,
    /// [`Executor::block_volume_destroy`].
    BlockVolumeDestroy,
}

/// One recorded call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutorCall {
    /// Method invoked.
    pub method: ExecutorMethod,
    /// Host addressed.
    pub host: String,
    /// Volume, brick or block volume the call was about.
    pub target: String,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<ExecutorCall>,
    one_shot: BTreeMap<ExecutorMethod, VecDeque<ExecutorError>>,
    sticky: BTreeMap<ExecutorMethod, ExecutorError>,
    volumes: BTreeMap<String, Vec<BrickAddress>>,
}

/// Executor double for tests and dry runs.
#[derive(Debug, Default)]
pub struct MockExecutor {
    state: Mutex<MockState>,
}

impl MockExecutor {
    /// Creates an executor where every call succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call to `method` fail with `err`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, method: ExecutorMethod, err: ExecutorError) {
        self.state
            .lock()
            .one_shot
            .entry(method)
            .or_default()
            .push_back(err);
    }

    /// Makes every call to `method` fail with `err` until cleared.
    pub fn fail_always(&self, method: ExecutorMethod, err: ExecutorError) {
        self.state.lock().sticky.insert(method, err);
    }

    /// Drops every scripted failure.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.one_shot.clear();
        state.sticky.clear();
    }

    /// Every call recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ExecutorCall> {
        self.state.lock().calls.clone()
    }

    /// Number of calls made to `method`.
    #[must_use]
    pub fn call_count(&self, method: ExecutorMethod) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.method == method)
            .count()
    }

    /// Names of volumes the executor currently believes exist.
    #[must_use]
    pub fn volume_names(&self) -> Vec<String> {
        self.state.lock().volumes.keys().cloned().collect()
    }

    fn record(&self, method: ExecutorMethod, host: &str, target: &str) -> Result<(), ExecutorError> {
        let mut state = self.state.lock();
        state.calls.push(ExecutorCall {
            method,
            host: host.to_owned(),
            target: target.to_owned(),
        });
        if let Some(err) = state.sticky.get(&method) {
            return Err(err.clone());
        }
        match state.one_shot.get_mut(&method).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Executor for MockExecutor {
    fn glusterd_check<'a>(&'a self, host: &'a str) -> ExecFuture<'a, ()> {
        Box::pin(async move { self.record(ExecutorMethod::GlusterdCheck, host, host) })
    }

    fn brick_create<'a>(&'a self, host: &'a str, brick: &'a BrickRequest) -> ExecFuture<'a, ()> {
        Box::pin(async move { self.record(ExecutorMethod::BrickCreate, host, &brick.id) })
    }

    fn brick_destroy<'a>(
        &'a self,
        host: &'a str,
        brick: &'a BrickRequest,
    ) -> ExecFuture<'a, bool> {
        Box::pin(async move {
            self.record(ExecutorMethod::BrickDestroy, host, &brick.id)?;
            Ok(brick.pool_name.is_some())
        })
    }

    fn volume_create<'a>(
        &'a self,
        host: &'a str,
        volume: &'a VolumeRequest,
    ) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            self.record(ExecutorMethod::VolumeCreate, host, &volume.name)?;
            let mut state = self.state.lock();
            if state.volumes.contains_key(&volume.name) {
                return Err(ExecutorError::AlreadyExists {
                    target: volume.name.clone(),
                });
            }
            state
                .volumes
                .insert(volume.name.clone(), volume.bricks.clone());
            Ok(())
        })
    }

    fn volume_destroy<'a>(&'a self, host: &'a str, name: &'a str) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            self.record(ExecutorMethod::VolumeDestroy, host, name)?;
            self.state.lock().volumes.remove(name);
            Ok(())
        })
    }

    fn volume_destroy_check<'a>(&'a self, host: &'a str, name: &'a str) -> ExecFuture<'a, ()> {
        Box::pin(async move { self.record(ExecutorMethod::VolumeDestroyCheck, host, name) })
    }

    fn volume_expand<'a>(
        &'a self,
        host: &'a str,
        volume: &'a VolumeRequest,
    ) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            self.record(ExecutorMethod::VolumeExpand, host, &volume.name)?;
            self.state
                .lock()
                .volumes
                .entry(volume.name.clone())
                .or_default()
                .extend(volume.bricks.iter().cloned());
            Ok(())
        })
    }

    fn volume_modify<'a>(
        &'a self,
        host: &'a str,
        name: &'a str,
        _change: &'a VolumeModify,
    ) -> ExecFuture<'a, ()> {
        Box::pin(async move { self.record(ExecutorMethod::VolumeModify, host, name) })
    }

    fn volume_info<'a>(&'a self, host: &'a str, name: &'a str) -> ExecFuture<'a, VolumeReport> {
        Box::pin(async move {
            self.record(ExecutorMethod::VolumeInfo, host, name)?;
            let state = self.state.lock();
            let bricks = state
                .volumes
                .get(name)
                .cloned()
                .ok_or_else(|| ExecutorError::NotFound {
                    target: name.to_owned(),
                })?;
            Ok(VolumeReport {
                name: name.to_owned(),
                bricks,
            })
        })
    }

    fn volume_clone<'a>(
        &'a self,
        host: &'a str,
        request: &'a CloneRequest,
    ) -> ExecFuture<'a, VolumeReport> {
        Box::pin(async move {
            self.record(ExecutorMethod::VolumeClone, host, &request.volume)?;
            let mut state = self.state.lock();
            if state.volumes.contains_key(&request.clone) {
                return Err(ExecutorError::AlreadyExists {
                    target: request.clone.clone(),
                });
            }
            let source = state.volumes.get(&request.volume).cloned().unwrap_or_default();
            let bricks: Vec<BrickAddress> = source
                .iter()
                .enumerate()
                .map(|(index, brick)| BrickAddress {
                    host: brick.host.clone(),
                    path: format!(
                        "/run/gluster/snaps/{}/brick{}/brick",
                        request.clone,
                        index.saturating_add(1)
                    ),
                })
                .collect();
            state.volumes.insert(request.clone.clone(), bricks.clone());
            Ok(VolumeReport {
                name: request.clone.clone(),
                bricks,
            })
        })
    }

    fn volume_replace_brick<'a>(
        &'a self,
        host: &'a str,
        request: &'a ReplaceBrickRequest,
    ) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            self.record(ExecutorMethod::VolumeReplaceBrick, host, &request.volume)?;
            if let Some(bricks) = self.state.lock().volumes.get_mut(&request.volume) {
                for brick in bricks.iter_mut().filter(|brick| **brick == request.old) {
                    brick.clone_from(&request.new);
                }
            }
            Ok(())
        })
    }

    fn block_volume_create<'a>(
        &'a self,
        host: &'a str,
        request: &'a BlockVolumeRequest,
    ) -> ExecFuture<'a, BlockConnection> {
        Box::pin(async move {
            self.record(ExecutorMethod::BlockVolumeCreate, host, &request.name)?;
            let (username, password) = if request.auth {
                (request.name.clone(), generate_id())
            } else {
                (String::new(), String::new())
            };
            Ok(BlockConnection {
                hosts: request.hosts.clone(),
                iqn: format!("iqn.2016-12.org.gluster-block:{}", generate_id()),
                lun: 0,
                username,
                password,
            })
        })
    }

    fn block_volume_destroy<'a>(
        &'a self,
        host: &'a str,
        _hosting_volume: &'a str,
        name: &'a str,
    ) -> ExecFuture<'a, ()> {
        Box::pin(async move { self.record(ExecutorMethod::BlockVolumeDestroy, host, name) })
    }
}
