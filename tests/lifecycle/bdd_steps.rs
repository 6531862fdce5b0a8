//! BDD step definitions for lifecycle behaviour.

use std::sync::Arc;

use brickwork::cleaner::{OpClass, OpTracker, OperationCleaner};
use brickwork::entities::{Durability, KIB_PER_GIB, VolumeEntry};
use brickwork::operations::{
    Operation, VolumeCreateOperation, VolumeExpandOperation, run_operation,
};
use brickwork::pending::purge::delete_pending_entries;
use brickwork::pending::reset::mark_pending_operations_stale;
use brickwork::test_support::setup_sample_topology;
use parking_lot::Mutex;
use rstest_bdd_macros::{given, then, when};

use super::test_helpers::{LifecycleContext, runtime};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn check(condition: bool, message: impl FnOnce() -> String) -> Result<(), StepError> {
    if condition {
        Ok(())
    } else {
        Err(StepError::Assertion(message()))
    }
}

fn create_op(lifecycle_context: &LifecycleContext, name: &str, size: u64) -> VolumeCreateOperation {
    let vol = VolumeEntry::new(name, size, Durability::Replicate { replica: 3 });
    VolumeCreateOperation::new(lifecycle_context.ctx.clone(), vol, Vec::new())
}

fn build(
    mut lifecycle_context: LifecycleContext,
    mut op: Box<dyn Operation>,
) -> Result<LifecycleContext, StepError> {
    op.build()
        .map_err(|err| StepError::Assertion(format!("build failed: {err}")))?;
    lifecycle_context.op = Some(Arc::new(Mutex::new(op)));
    Ok(lifecycle_context)
}

fn run_cleaner(mut lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    let mut cleaner = OperationCleaner::new(
        lifecycle_context.ctx.clone(),
        Arc::clone(&lifecycle_context.mock) as Arc<dyn brickwork::executor::Executor>,
    );
    if let Some(tracker) = &lifecycle_context.tracker {
        cleaner = cleaner.with_tracker(Arc::clone(tracker), OpClass::Clean);
    }
    let summary = runtime()
        .block_on(cleaner.clean())
        .map_err(|err| StepError::Assertion(format!("clean failed: {err}")))?;
    lifecycle_context.summary = Some(summary);
    Ok(lifecycle_context)
}

#[given("a cluster of {nodes:usize} nodes with {devices:usize} devices each")]
fn cluster(
    lifecycle_context: LifecycleContext,
    nodes: usize,
    devices: usize,
) -> Result<LifecycleContext, StepError> {
    setup_sample_topology(&lifecycle_context.db, 1, nodes, devices, 2048 * KIB_PER_GIB)
        .map_err(|err| StepError::Assertion(format!("topology: {err}")))?;
    Ok(lifecycle_context)
}

#[given("a committed {size:u64} GiB volume named \"{name}\"")]
fn committed_volume(
    mut lifecycle_context: LifecycleContext,
    size: u64,
    name: String,
) -> Result<LifecycleContext, StepError> {
    let mut op = create_op(&lifecycle_context, &name, size);
    runtime()
        .block_on(run_operation(&mut op, lifecycle_context.mock.as_ref()))
        .map_err(|err| StepError::Assertion(format!("create failed: {err}")))?;
    lifecycle_context.committed_used_kib = lifecycle_context.used_kib();
    Ok(lifecycle_context)
}

#[given("a full operation tracker of capacity {capacity:usize}")]
fn full_tracker(mut lifecycle_context: LifecycleContext, capacity: usize) -> LifecycleContext {
    let tracker = Arc::new(OpTracker::new(capacity));
    for slot in 0..capacity {
        let id = format!("busy-{slot}");
        assert!(!tracker.throttle_or_add(&id, OpClass::Normal), "slot {slot} should be free");
    }
    lifecycle_context.tracker = Some(tracker);
    lifecycle_context
}

#[given("an abandoned {size:u64} GiB volume create")]
fn abandoned_create(lifecycle_context: LifecycleContext, size: u64) -> Result<LifecycleContext, StepError> {
    let op = create_op(&lifecycle_context, "abandoned", size);
    let built = build(lifecycle_context, Box::new(op))?;
    mark_pending_operations_stale(&built.db)
        .map_err(|err| StepError::Assertion(format!("mark stale: {err}")))?;
    Ok(built)
}

#[when("I build a {size:u64} GiB volume named \"{name}\"")]
fn build_volume(
    lifecycle_context: LifecycleContext,
    size: u64,
    name: String,
) -> Result<LifecycleContext, StepError> {
    let op = create_op(&lifecycle_context, &name, size);
    build(lifecycle_context, Box::new(op))
}

#[when("I build an expansion of \"{name}\" by {delta:u64} GiB")]
fn build_expansion(
    lifecycle_context: LifecycleContext,
    name: String,
    delta: u64,
) -> Result<LifecycleContext, StepError> {
    let vol = lifecycle_context.volume_named(&name);
    let op = VolumeExpandOperation::new(lifecycle_context.ctx.clone(), vol.info.id, delta);
    build(lifecycle_context, Box::new(op))
}

#[when("I execute and finalize the operation")]
fn execute_and_finalize(lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    let Some(op) = lifecycle_context.op.clone() else {
        return Err(StepError::Assertion(String::from("no operation was built")));
    };
    let mut guard = op.lock();
    runtime()
        .block_on(guard.exec(lifecycle_context.mock.as_ref()))
        .map_err(|err| StepError::Assertion(format!("exec failed: {err}")))?;
    guard
        .finalize()
        .map_err(|err| StepError::Assertion(format!("finalize failed: {err}")))?;
    drop(guard);
    Ok(lifecycle_context)
}

#[when("I purge pending entries")]
fn purge(lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    delete_pending_entries(&lifecycle_context.db)
        .map_err(|err| StepError::Assertion(format!("purge failed: {err}")))?;
    Ok(lifecycle_context)
}

#[when("pending operations are marked stale")]
fn mark_stale(lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    mark_pending_operations_stale(&lifecycle_context.db)
        .map_err(|err| StepError::Assertion(format!("mark stale: {err}")))?;
    Ok(lifecycle_context)
}

#[when("the cleaner runs")]
fn cleaner_runs(lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    run_cleaner(lifecycle_context)
}

#[when("the tracked cleaner runs")]
fn tracked_cleaner_runs(lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    if lifecycle_context.tracker.is_none() {
        return Err(StepError::Assertion(String::from("no tracker configured")));
    }
    run_cleaner(lifecycle_context)
}

#[when("the tracker is emptied")]
fn empty_tracker(lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    let Some(tracker) = &lifecycle_context.tracker else {
        return Err(StepError::Assertion(String::from("no tracker configured")));
    };
    for slot in 0..tracker.limit() {
        tracker.remove(&format!("busy-{slot}"));
    }
    check(tracker.is_empty(), || String::from("tracker should be empty"))?;
    Ok(lifecycle_context)
}

#[then("the ledger holds {count:usize} entry")]
fn ledger_holds(lifecycle_context: &LifecycleContext, count: usize) -> Result<(), StepError> {
    let ledger = lifecycle_context.ledger();
    check(ledger.len() == count, || {
        format!("expected {count} ledger entries, found {}", ledger.len())
    })
}

#[then("the ledger is empty")]
fn ledger_empty(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    ledger_holds(lifecycle_context, 0)
}

#[then("{bricks:usize} bricks and {volumes:usize} volume are pending")]
fn entities_pending(
    lifecycle_context: &LifecycleContext,
    bricks: usize,
    volumes: usize,
) -> Result<(), StepError> {
    let pending_bricks = lifecycle_context
        .bricks()
        .iter()
        .filter(|brick| brick.pending.is_pending())
        .count();
    let pending_volumes = lifecycle_context
        .volumes()
        .iter()
        .filter(|vol| vol.pending.is_pending())
        .count();
    check(pending_bricks == bricks && pending_volumes == volumes, || {
        format!("expected {bricks}/{volumes} pending, found {pending_bricks}/{pending_volumes}")
    })
}

#[then("{bricks:usize} bricks and {volumes:usize} volume are committed")]
fn entities_committed(
    lifecycle_context: &LifecycleContext,
    bricks: usize,
    volumes: usize,
) -> Result<(), StepError> {
    let all_bricks = lifecycle_context.bricks();
    let all_volumes = lifecycle_context.volumes();
    let committed = all_bricks.iter().all(|brick| !brick.pending.is_pending())
        && all_volumes.iter().all(|vol| !vol.pending.is_pending());
    check(
        committed && all_bricks.len() == bricks && all_volumes.len() == volumes,
        || {
            format!(
                "expected {bricks} bricks and {volumes} volumes committed, found {} and {}",
                all_bricks.len(),
                all_volumes.len()
            )
        },
    )
}

#[then("only the volume \"{name}\" remains")]
fn only_volume_remains(lifecycle_context: &LifecycleContext, name: String) -> Result<(), StepError> {
    let names: Vec<String> = lifecycle_context
        .volumes()
        .into_iter()
        .map(|vol| vol.info.name)
        .collect();
    check(names == vec![name.clone()], || {
        format!("expected only {name}, found {names:?}")
    })
}

#[then("the volume \"{name}\" is {size:u64} GiB")]
fn volume_size(lifecycle_context: &LifecycleContext, name: String, size: u64) -> Result<(), StepError> {
    let vol = lifecycle_context.volume_named(&name);
    check(vol.info.size == size && !vol.pending.is_pending(), || {
        format!("expected committed {size} GiB, found {} GiB", vol.info.size)
    })
}

#[then("device usage is back to its committed level")]
fn usage_restored(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let used = lifecycle_context.used_kib();
    let expected = lifecycle_context.committed_used_kib;
    check(used == expected, || {
        format!("expected {expected} KiB used, found {used} KiB")
    })
}

#[then("the cleaner throttled {count:usize} operation")]
fn cleaner_throttled(lifecycle_context: &LifecycleContext, count: usize) -> Result<(), StepError> {
    let Some(summary) = lifecycle_context.summary else {
        return Err(StepError::Assertion(String::from("the cleaner has not run")));
    };
    check(summary.throttled == count && summary.cleaned == 0, || {
        format!("expected {count} throttled, got {summary:?}")
    })
}

#[then("the cleaner cleaned {count:usize} operation")]
fn cleaner_cleaned(lifecycle_context: &LifecycleContext, count: usize) -> Result<(), StepError> {
    let Some(summary) = lifecycle_context.summary else {
        return Err(StepError::Assertion(String::from("the cleaner has not run")));
    };
    check(summary.cleaned == count, || {
        format!("expected {count} cleaned, got {summary:?}")
    })
}
