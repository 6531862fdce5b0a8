//! Volume create, expand, delete and clone.

use rstest::rstest;

use super::{Harness, harness};
use crate::entities::{ClusterEntry, Durability, VolumeEntry};
use crate::executor::{CloneRequest, Executor, ExecutorError, ExecutorMethod};
use crate::operations::{
    Operation, OperationError, OperationSettings, RunError, VolumeCloneOperation,
    VolumeCreateOperation, VolumeDeleteOperation, VolumeExpandOperation, load_operation,
    run_operation,
};
use crate::pending::reset::mark_pending_operations_stale;
use crate::pending::{OperationStatus, OperationType};

fn command_failure() -> ExecutorError {
    ExecutorError::Command {
        host: String::from("manage-0-0"),
        message: String::from("volume create: failed"),
    }
}

/// Loads the single ledger entry and drives it through clean and clean
/// done, as the cleaner does.
async fn clean_only_entry(harness: &Harness) {
    let mut entries = harness.ledger();
    assert_eq!(entries.len(), 1);
    let entry = entries.remove(0);
    let mut op = load_operation(&harness.ctx, entry).expect("load");
    let cleanable = op.as_cleanable().expect("cleanable");
    cleanable.clean(&harness.mock).await.expect("clean");
    cleanable.clean_done().expect("clean done");
}

#[rstest]
#[tokio::test]
async fn create_marks_entities_pending_until_finalize(harness: Harness) {
    let vol = VolumeEntry::new("vol_a", 1024, Durability::Replicate { replica: 3 });
    let mut op = VolumeCreateOperation::new(harness.ctx.clone(), vol, Vec::new());

    op.build().expect("build");
    assert_eq!(harness.ledger().len(), 1);
    assert_eq!(
        harness.ledger().first().map(|entry| entry.op_type),
        Some(OperationType::CreateVolume)
    );
    let bricks = harness.bricks();
    assert_eq!(bricks.len(), 3);
    assert!(bricks.iter().all(|brick| brick.pending.is_owned_by(op.id())));
    let volumes = harness.volumes();
    assert_eq!(volumes.len(), 1);
    assert!(volumes.iter().all(|vol| vol.pending.is_pending()));

    op.exec(&harness.mock).await.expect("exec");
    op.finalize().expect("finalize");
    assert!(harness.ledger().is_empty());
    assert!(harness.bricks().iter().all(|brick| !brick.pending.is_pending()));
    assert!(harness.volumes().iter().all(|vol| !vol.pending.is_pending()));
    assert_eq!(harness.mock.volume_names(), vec![String::from("vol_a")]);
}

#[rstest]
#[tokio::test]
async fn create_refuses_a_taken_name(harness: Harness) {
    harness.committed_volume("dup", 10).await;
    let vol = VolumeEntry::new("dup", 10, Durability::default());
    let mut op = VolumeCreateOperation::new(harness.ctx.clone(), vol, Vec::new());
    let err = run_operation(&mut op, &harness.mock)
        .await
        .expect_err("name taken");
    assert!(matches!(err, RunError::Build(OperationError::NameTaken { .. })));
    assert_eq!(harness.volumes().len(), 1);
}

#[rstest]
#[tokio::test]
async fn create_retries_on_a_fresh_placement(harness: Harness) {
    for _ in 0..3 {
        harness
            .mock
            .fail_next(ExecutorMethod::VolumeCreate, command_failure());
    }
    let vol = VolumeEntry::new("retried", 100, Durability::default());
    let mut op = VolumeCreateOperation::new(harness.ctx.clone(), vol, Vec::new());
    run_operation(&mut op, &harness.mock)
        .await
        .expect("second attempt succeeds");

    assert!(harness.ledger().is_empty());
    assert_eq!(harness.bricks().len(), 3);
    assert_eq!(harness.mock.call_count(ExecutorMethod::BrickCreate), 6);
    assert_eq!(harness.mock.call_count(ExecutorMethod::VolumeCreate), 4);
    let expected: u64 = harness.bricks().iter().map(|brick| brick.total_size()).sum();
    assert_eq!(harness.used_kib(), expected);
}

#[rstest]
#[tokio::test]
async fn create_that_never_succeeds_leaves_nothing_behind(harness: Harness) {
    harness
        .mock
        .fail_always(ExecutorMethod::VolumeCreate, command_failure());
    let vol = VolumeEntry::new("doomed", 100, Durability::default());
    let mut op = VolumeCreateOperation::new(harness.ctx.clone(), vol, Vec::new());
    let err = run_operation(&mut op, &harness.mock)
        .await
        .expect_err("every attempt fails");

    assert_eq!(err, RunError::Exec(OperationError::Executor(command_failure())));
    let attempts = OperationSettings::default().create_volume_max_retries + 1;
    assert_eq!(
        harness.mock.call_count(ExecutorMethod::BrickCreate),
        usize::try_from(attempts * 3).expect("count")
    );
    assert!(harness.ledger().is_empty());
    assert!(harness.volumes().is_empty());
    assert!(harness.bricks().is_empty());
    assert_eq!(harness.used_kib(), 0);
}

#[rstest]
#[tokio::test]
async fn expand_grows_size_only_at_finalize(harness: Harness) {
    let vol = harness.committed_volume("grow", 100).await;
    let mut op = VolumeExpandOperation::new(harness.ctx.clone(), &vol.info.id, 50);
    op.build().expect("build");
    let building = harness.volume(&vol.info.id);
    assert_eq!(building.info.size, 100);
    assert_eq!(building.bricks.len(), 6);
    assert!(building.pending.is_owned_by(op.id()));

    op.exec(&harness.mock).await.expect("exec");
    op.finalize().expect("finalize");
    let grown = harness.volume(&vol.info.id);
    assert_eq!(grown.info.size, 150);
    assert_eq!(grown.bricks.len(), 6);
    assert!(!grown.pending.is_pending());
    assert!(harness.ledger().is_empty());
}

#[rstest]
#[tokio::test]
async fn stale_expand_is_cleaned_without_changing_size(harness: Harness) {
    let vol = harness.committed_volume("grow", 100).await;
    let used_before = harness.used_kib();
    let mut op = VolumeExpandOperation::new(harness.ctx.clone(), &vol.info.id, 50);
    op.build().expect("build");
    assert!(harness.used_kib() > used_before);

    assert_eq!(mark_pending_operations_stale(&harness.db).expect("stale"), 1);
    assert_eq!(
        harness.ledger().first().map(|entry| entry.status),
        Some(OperationStatus::Stale)
    );
    clean_only_entry(&harness).await;

    let cleaned = harness.volume(&vol.info.id);
    assert_eq!(cleaned.info.size, 100);
    assert_eq!(cleaned.bricks, vol.bricks);
    assert!(!cleaned.pending.is_pending());
    assert_eq!(harness.bricks().len(), 3);
    assert_eq!(harness.used_kib(), used_before);
    assert!(harness.ledger().is_empty());
}

#[rstest]
#[tokio::test]
async fn delete_returns_device_space(harness: Harness) {
    let vol = harness.committed_volume("gone", 100).await;
    let mut op = VolumeDeleteOperation::new(harness.ctx.clone(), &vol.info.id);
    run_operation(&mut op, &harness.mock).await.expect("delete");

    assert!(harness.volumes().is_empty());
    assert!(harness.bricks().is_empty());
    assert_eq!(harness.used_kib(), 0);
    assert!(harness.ledger().is_empty());
    let cluster = harness
        .db
        .view(|tx| tx.load::<ClusterEntry>(harness.topology.clusters.first().expect("cluster")))
        .expect("cluster");
    assert!(cluster.volumes.is_empty());
    assert!(harness.mock.volume_names().is_empty());
}

#[rstest]
#[tokio::test]
async fn delete_skips_a_volume_already_gone_remotely(harness: Harness) {
    let vol = harness.committed_volume("vanished", 100).await;
    harness.mock.fail_next(
        ExecutorMethod::VolumeDestroyCheck,
        ExecutorError::NotFound {
            target: String::from("vanished"),
        },
    );
    let mut op = VolumeDeleteOperation::new(harness.ctx.clone(), &vol.info.id);
    run_operation(&mut op, &harness.mock).await.expect("delete");
    assert_eq!(harness.mock.call_count(ExecutorMethod::VolumeDestroy), 0);
    assert_eq!(harness.mock.call_count(ExecutorMethod::BrickDestroy), 3);
    assert!(harness.volumes().is_empty());
}

#[rstest]
#[tokio::test]
async fn delete_of_a_pending_volume_conflicts(harness: Harness) {
    let vol = harness.committed_volume("busy", 100).await;
    let mut expand = VolumeExpandOperation::new(harness.ctx.clone(), &vol.info.id, 10);
    expand.build().expect("build");
    let mut op = VolumeDeleteOperation::new(harness.ctx.clone(), &vol.info.id);
    let err = run_operation(&mut op, &harness.mock)
        .await
        .expect_err("conflict");
    assert_eq!(
        err,
        RunError::Build(OperationError::Conflict {
            id: vol.info.id.clone()
        })
    );
    assert_eq!(harness.ledger().len(), 1);
}

#[rstest]
#[tokio::test]
async fn failed_delete_releases_its_claims(harness: Harness) {
    let vol = harness.committed_volume("stuck", 100).await;
    harness
        .mock
        .fail_always(ExecutorMethod::VolumeDestroy, command_failure());
    let mut op = VolumeDeleteOperation::new(harness.ctx.clone(), &vol.info.id);
    run_operation(&mut op, &harness.mock)
        .await
        .expect_err("destroy fails");
    let kept = harness.volume(&vol.info.id);
    assert!(!kept.pending.is_pending());
    assert!(harness.bricks().iter().all(|brick| !brick.pending.is_pending()));
    assert!(harness.ledger().is_empty());
}

#[rstest]
#[tokio::test]
async fn clone_shares_capacity_and_records_clone_paths(harness: Harness) {
    let parent = harness.committed_volume("origin", 100).await;
    let used_before = harness.used_kib();
    let mut op = VolumeCloneOperation::new(harness.ctx.clone(), &parent.info.id, "copy");
    run_operation(&mut op, &harness.mock).await.expect("clone");

    let clone_id = op.clone_id().expect("clone id").to_owned();
    let clone = harness.volume(&clone_id);
    assert_eq!(clone.info.name, "copy");
    assert_eq!(clone.info.size, parent.info.size);
    assert_eq!(clone.bricks.len(), 3);
    let paths: Vec<String> = harness
        .bricks()
        .into_iter()
        .filter(|brick| brick.volume_id == clone_id)
        .map(|brick| brick.path)
        .collect();
    assert!(paths.iter().all(|path| path.starts_with("/run/gluster/snaps/copy/")));
    assert_eq!(harness.used_kib(), used_before);
    assert!(!harness.volume(&parent.info.id).pending.is_pending());
    assert!(harness.ledger().is_empty());
}

#[rstest]
#[tokio::test]
async fn clone_left_by_an_earlier_attempt_is_adopted(harness: Harness) {
    let parent = harness.committed_volume("origin", 100).await;
    harness
        .mock
        .volume_clone(
            "manage-0-0",
            &CloneRequest {
                volume: parent.info.name.clone(),
                clone: String::from("copy"),
            },
        )
        .await
        .expect("earlier clone");

    let mut op = VolumeCloneOperation::new(harness.ctx.clone(), &parent.info.id, "copy");
    run_operation(&mut op, &harness.mock).await.expect("clone");

    let clone_id = op.clone_id().expect("clone id").to_owned();
    let paths: Vec<String> = harness
        .bricks()
        .into_iter()
        .filter(|brick| brick.volume_id == clone_id)
        .map(|brick| brick.path)
        .collect();
    assert_eq!(paths.len(), 3);
    assert!(paths.iter().all(|path| path.starts_with("/run/gluster/snaps/copy/")));
    assert_eq!(harness.mock.call_count(ExecutorMethod::VolumeClone), 2);
    assert!(harness.mock.call_count(ExecutorMethod::VolumeInfo) >= 1);
    assert!(harness.ledger().is_empty());
}

#[rstest]
#[tokio::test]
async fn clone_failure_removes_the_remote_clone(harness: Harness) {
    let parent = harness.committed_volume("origin", 100).await;
    harness
        .mock
        .fail_always(ExecutorMethod::VolumeModify, command_failure());
    let mut op = VolumeCloneOperation::new(harness.ctx.clone(), &parent.info.id, "copy");
    run_operation(&mut op, &harness.mock)
        .await
        .expect_err("start fails");

    assert_eq!(harness.volumes().len(), 1);
    assert_eq!(harness.bricks().len(), 3);
    assert_eq!(harness.mock.volume_names(), vec![String::from("origin")]);
    assert!(!harness.volume(&parent.info.id).pending.is_pending());
    assert!(harness.ledger().is_empty());
}

#[rstest]
#[tokio::test]
async fn block_hosting_volumes_cannot_be_cloned() {
    let harness = Harness::with(OperationSettings::default(), 3, 1, 2048);
    let vol = VolumeEntry::new_block_hosting(100, &[]);
    let mut create = VolumeCreateOperation::new(harness.ctx.clone(), vol, Vec::new());
    run_operation(&mut create, &harness.mock).await.expect("create");
    let mut op =
        VolumeCloneOperation::new(harness.ctx.clone(), &create.volume().info.id, "copy");
    let err = run_operation(&mut op, &harness.mock)
        .await
        .expect_err("refused");
    assert!(matches!(
        err,
        RunError::Build(OperationError::CloneBlockVolume { .. })
    ));
}

#[rstest]
#[tokio::test]
async fn ledger_entries_load_as_their_operation_kind(harness: Harness) {
    let vol = harness.committed_volume("kind", 100).await;
    let mut op = VolumeDeleteOperation::new(harness.ctx.clone(), &vol.info.id);
    op.build().expect("build");
    let entry = harness.ledger().remove(0);
    let loaded = load_operation(&harness.ctx, entry).expect("load");
    assert_eq!(loaded.label(), "delete volume");
    assert_eq!(loaded.id(), op.id());
}
