//! Unit tests for the operation kinds and the runner.

use std::sync::Arc;

use rstest::fixture;

use super::*;
use crate::db::Db;
use crate::entities::{BrickEntry, DeviceEntry, KIB_PER_GIB, VolumeEntry};
use crate::executor::MockExecutor;
use crate::pending::PendingOperationEntry;
use crate::test_support::{SampleTopology, setup_sample_topology, test_context_with};

mod devices;
mod volumes;

/// Store, context and executor over a seeded topology.
pub(super) struct Harness {
    pub(super) db: Arc<Db>,
    pub(super) ctx: OperationContext,
    pub(super) mock: MockExecutor,
    pub(super) topology: SampleTopology,
}

impl Harness {
    pub(super) fn with(settings: OperationSettings, nodes: usize, devices: usize, disk_gib: u64) -> Self {
        let db = Arc::new(Db::temporary().expect("temporary store"));
        let topology =
            setup_sample_topology(&db, 1, nodes, devices, disk_gib * KIB_PER_GIB).expect("topology");
        let ctx = test_context_with(Arc::clone(&db), settings);
        Self {
            db,
            ctx,
            mock: MockExecutor::new(),
            topology,
        }
    }

    pub(super) fn ledger(&self) -> Vec<PendingOperationEntry> {
        self.db
            .view(|tx| tx.load_all::<PendingOperationEntry>())
            .expect("ledger")
    }

    pub(super) fn volumes(&self) -> Vec<VolumeEntry> {
        self.db
            .view(|tx| tx.load_all::<VolumeEntry>())
            .expect("volumes")
    }

    pub(super) fn volume(&self, id: &str) -> VolumeEntry {
        self.db
            .view(|tx| tx.load::<VolumeEntry>(id))
            .expect("volume")
    }

    pub(super) fn bricks(&self) -> Vec<BrickEntry> {
        self.db
            .view(|tx| tx.load_all::<BrickEntry>())
            .expect("bricks")
    }

    pub(super) fn devices(&self) -> Vec<DeviceEntry> {
        self.db
            .view(|tx| tx.load_all::<DeviceEntry>())
            .expect("devices")
    }

    /// KiB allocated across every device.
    pub(super) fn used_kib(&self) -> u64 {
        self.devices().iter().map(|device| device.used_size).sum()
    }

    /// Creates and commits a replica-3 volume of `size` GiB.
    pub(super) async fn committed_volume(&self, name: &str, size: u64) -> VolumeEntry {
        let vol = VolumeEntry::new(name, size, crate::entities::Durability::default());
        let mut op = VolumeCreateOperation::new(self.ctx.clone(), vol, Vec::new());
        run_operation(&mut op, &self.mock).await.expect("create volume");
        self.volume(&op.volume().info.id)
    }
}

#[fixture]
pub(super) fn harness() -> Harness {
    Harness::with(OperationSettings::default(), 3, 2, 2048)
}
