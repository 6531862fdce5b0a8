//! Device removal and brick evacuation.

use rstest::rstest;

use super::{Harness, harness};
use crate::entities::{BrickEntry, DeviceEntry, EntryState};
use crate::executor::{ExecutorError, ExecutorMethod};
use crate::operations::{
    DeviceRemoveOperation, Operation, OperationError, OperationSettings, RunError,
    VolumeExpandOperation, run_operation,
};

fn set_state(harness: &Harness, device_id: &str, state: EntryState) {
    harness
        .db
        .update(|tx| {
            let mut device = tx.load::<DeviceEntry>(device_id)?;
            device.state = state;
            tx.save(&device)
        })
        .expect("device state");
}

fn device(harness: &Harness, device_id: &str) -> DeviceEntry {
    harness
        .db
        .view(|tx| tx.load::<DeviceEntry>(device_id))
        .expect("device")
}

/// Any device that holds a brick.
fn busy_device(harness: &Harness) -> DeviceEntry {
    harness
        .devices()
        .into_iter()
        .find(|device| !device.bricks.is_empty())
        .expect("a device with bricks")
}

async fn remove(harness: &Harness, device_id: &str) -> Result<(), RunError> {
    let mut op = DeviceRemoveOperation::new(harness.ctx.clone(), device_id);
    run_operation(&mut op, &harness.mock).await
}

#[rstest]
#[tokio::test]
async fn online_devices_cannot_be_removed(harness: Harness) {
    let device_id = harness.topology.devices.first().cloned().expect("device");
    let err = remove(&harness, &device_id).await.expect_err("online");
    assert_eq!(
        err,
        RunError::Build(OperationError::DeviceState {
            device: device_id.clone(),
            state: EntryState::Online,
            expected: EntryState::Offline,
        })
    );
    assert_eq!(device(&harness, &device_id).state, EntryState::Online);
}

#[rstest]
#[tokio::test]
async fn empty_devices_are_failed_straight_away(harness: Harness) {
    let device_id = harness.topology.devices.first().cloned().expect("device");
    set_state(&harness, &device_id, EntryState::Offline);
    remove(&harness, &device_id).await.expect("remove");
    assert_eq!(device(&harness, &device_id).state, EntryState::Failed);
    assert!(harness.ledger().is_empty());
    assert_eq!(harness.mock.call_count(ExecutorMethod::VolumeReplaceBrick), 0);
}

#[rstest]
#[tokio::test]
async fn bricks_are_moved_off_the_removed_device(harness: Harness) {
    let vol = harness.committed_volume("data", 100).await;
    let old_device = busy_device(&harness);
    let old_brick_id = old_device.bricks.first().cloned().expect("brick");
    let old_brick = harness
        .db
        .view(|tx| tx.load::<BrickEntry>(&old_brick_id))
        .expect("brick");
    let used_before = harness.used_kib();
    set_state(&harness, &old_device.id, EntryState::Offline);

    remove(&harness, &old_device.id).await.expect("remove");

    let removed = device(&harness, &old_device.id);
    assert_eq!(removed.state, EntryState::Failed);
    assert!(removed.bricks.is_empty());
    assert_eq!(removed.used_size, 0);
    assert_eq!(harness.used_kib(), used_before);

    let moved = harness.volume(&vol.info.id);
    assert_eq!(moved.bricks.len(), 3);
    assert!(!moved.bricks.contains(&old_brick_id));
    let bricks = harness.bricks();
    assert_eq!(bricks.len(), 3);
    let replacement = bricks
        .iter()
        .find(|brick| !vol.bricks.contains(&brick.id))
        .expect("replacement brick");
    assert_eq!(replacement.node_id, old_brick.node_id);
    assert_ne!(replacement.device_id, old_device.id);
    assert_eq!(replacement.size, old_brick.size);
    assert!(harness.ledger().is_empty());
    assert_eq!(harness.mock.call_count(ExecutorMethod::VolumeReplaceBrick), 1);
}

#[rstest]
#[tokio::test]
async fn evacuation_without_room_leaves_the_device_offline() {
    let harness = Harness::with(OperationSettings::default(), 3, 1, 2048);
    let vol = harness.committed_volume("data", 100).await;
    let old_device = busy_device(&harness);
    let brick_id = old_device.bricks.first().cloned().expect("brick");
    set_state(&harness, &old_device.id, EntryState::Offline);

    let err = remove(&harness, &old_device.id).await.expect_err("no room");
    assert_eq!(
        err,
        RunError::Exec(OperationError::NoReplacement { brick: brick_id })
    );
    assert_eq!(device(&harness, &old_device.id).state, EntryState::Offline);
    assert_eq!(harness.volume(&vol.info.id).bricks, vol.bricks);
    assert!(harness.ledger().is_empty());
}

#[rstest]
#[tokio::test]
async fn failed_replace_discards_the_new_brick(harness: Harness) {
    let vol = harness.committed_volume("data", 100).await;
    let old_device = busy_device(&harness);
    set_state(&harness, &old_device.id, EntryState::Offline);
    harness.mock.fail_always(
        ExecutorMethod::VolumeReplaceBrick,
        ExecutorError::Command {
            host: String::from("manage-0-0"),
            message: String::from("replace-brick failed"),
        },
    );

    remove(&harness, &old_device.id).await.expect_err("replace fails");
    assert_eq!(harness.mock.call_count(ExecutorMethod::BrickDestroy), 1);
    assert_eq!(harness.volume(&vol.info.id).bricks, vol.bricks);
    assert_eq!(harness.bricks().len(), 3);
    assert_eq!(device(&harness, &old_device.id).state, EntryState::Offline);
    assert!(harness.ledger().is_empty());
}

#[rstest]
#[tokio::test]
async fn devices_under_a_pending_volume_are_not_removed(harness: Harness) {
    let vol = harness.committed_volume("data", 100).await;
    let mut expand = VolumeExpandOperation::new(harness.ctx.clone(), &vol.info.id, 50);
    expand.build().expect("expand build");
    let old_device = harness
        .devices()
        .into_iter()
        .find(|device| device.bricks.iter().any(|id| vol.bricks.contains(id)))
        .expect("device with an original brick");
    set_state(&harness, &old_device.id, EntryState::Offline);

    let err = remove(&harness, &old_device.id).await.expect_err("pending");
    assert!(matches!(
        err,
        RunError::Build(OperationError::Conflict { .. })
    ));
    assert_eq!(harness.ledger().len(), 1);
}
