//! Shared fixtures and helpers for lifecycle BDD scenarios.

use std::sync::Arc;

use brickwork::cleaner::{CleanSummary, OpTracker};
use brickwork::db::Db;
use brickwork::entities::{BrickEntry, DeviceEntry, VolumeEntry};
use brickwork::executor::MockExecutor;
use brickwork::operations::{Operation, OperationContext};
use brickwork::pending::PendingOperationEntry;
use brickwork::test_support::test_context;
use rstest::fixture;
use tokio::runtime::Runtime;

#[derive(Clone)]
pub struct LifecycleContext {
    pub db: Arc<Db>,
    pub ctx: OperationContext,
    pub mock: Arc<MockExecutor>,
    pub tracker: Option<Arc<OpTracker>>,
    pub committed_used_kib: u64,
    pub summary: Option<CleanSummary>,
    pub op: Option<Arc<parking_lot::Mutex<Box<dyn Operation>>>>,
}

#[fixture]
pub fn lifecycle_context() -> LifecycleContext {
    let db = Arc::new(Db::temporary().expect("temporary store"));
    LifecycleContext {
        ctx: test_context(Arc::clone(&db)),
        db,
        mock: Arc::new(MockExecutor::new()),
        tracker: None,
        committed_used_kib: 0,
        summary: None,
        op: None,
    }
}

pub fn runtime() -> Runtime {
    Runtime::new().unwrap_or_else(|err| panic!("tokio runtime should start: {err}"))
}

impl LifecycleContext {
    pub fn ledger(&self) -> Vec<PendingOperationEntry> {
        self.db
            .view(|tx| tx.load_all::<PendingOperationEntry>())
            .unwrap_or_else(|err| panic!("ledger should load: {err}"))
    }

    pub fn bricks(&self) -> Vec<BrickEntry> {
        self.db
            .view(|tx| tx.load_all::<BrickEntry>())
            .unwrap_or_else(|err| panic!("bricks should load: {err}"))
    }

    pub fn volumes(&self) -> Vec<VolumeEntry> {
        self.db
            .view(|tx| tx.load_all::<VolumeEntry>())
            .unwrap_or_else(|err| panic!("volumes should load: {err}"))
    }

    pub fn volume_named(&self, name: &str) -> VolumeEntry {
        self.volumes()
            .into_iter()
            .find(|vol| vol.info.name == name)
            .unwrap_or_else(|| panic!("volume {name} should exist"))
    }

    pub fn used_kib(&self) -> u64 {
        self.db
            .view(|tx| tx.load_all::<DeviceEntry>())
            .unwrap_or_else(|err| panic!("devices should load: {err}"))
            .iter()
            .map(|device| device.used_size)
            .sum()
    }
}
