//! Unit tests for the cleaner, the tracker and the background loop.

use std::sync::Arc;
use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::db::Db;
use crate::entities::{DeviceEntry, Durability, KIB_PER_GIB, VolumeEntry};
use crate::executor::{ExecutorError, ExecutorMethod, MockExecutor};
use crate::operations::{Operation, VolumeCreateOperation};
use crate::pending::reset::mark_pending_operations_stale;
use crate::test_support::{setup_sample_topology, test_context};

struct Setup {
    db: Arc<Db>,
    ctx: OperationContext,
    mock: Arc<MockExecutor>,
}

impl Setup {
    fn cleaner(&self) -> OperationCleaner {
        OperationCleaner::new(self.ctx.clone(), Arc::clone(&self.mock) as Arc<dyn Executor>)
    }

    /// Builds a volume create and leaves it unfinished, returning its id.
    fn abandoned_create(&self, name: &str) -> String {
        let vol = VolumeEntry::new(name, 100, Durability::default());
        let mut op = VolumeCreateOperation::new(self.ctx.clone(), vol, Vec::new());
        op.build().expect("build");
        op.id().to_owned()
    }

    fn ledger(&self) -> Vec<PendingOperationEntry> {
        self.db
            .view(|tx| tx.load_all::<PendingOperationEntry>())
            .expect("ledger")
    }

    fn only_entry(&self) -> PendingOperationEntry {
        let mut ledger = self.ledger();
        assert_eq!(ledger.len(), 1, "expected one ledger entry");
        ledger.remove(0)
    }

    fn used_kib(&self) -> u64 {
        self.db
            .view(|tx| tx.load_all::<DeviceEntry>())
            .expect("devices")
            .iter()
            .map(|device| device.used_size)
            .sum()
    }
}

#[fixture]
fn setup() -> Setup {
    let db = Arc::new(Db::temporary().expect("temporary store"));
    setup_sample_topology(&db, 1, 3, 2, 2048 * KIB_PER_GIB).expect("topology");
    let ctx = test_context(Arc::clone(&db));
    Setup {
        db,
        ctx,
        mock: Arc::new(MockExecutor::new()),
    }
}

#[rstest]
fn tracker_throttles_once_full() {
    let tracker = OpTracker::new(3);
    assert!(!tracker.throttle_or_add("aaa", OpClass::Normal));
    assert!(!tracker.throttle_or_add("bbb", OpClass::Normal));
    assert!(!tracker.throttle_or_add("ccc", OpClass::Normal));
    assert!(tracker.throttle_or_add("ddd", OpClass::Normal));
    assert!(!tracker.throttle_or_add("aaa", OpClass::Normal));
    assert_eq!(tracker.len(), 3);

    tracker.remove("bbb");
    assert!(!tracker.throttle_or_add("ddd", OpClass::Normal));
    assert!(tracker.contains("ddd"));
    assert!(!tracker.contains("bbb"));
}

#[rstest]
fn tracker_runs_one_cleanup_at_a_time() {
    let tracker = OpTracker::new(8);
    assert!(!tracker.throttle_or_add("first", OpClass::Clean));
    assert!(tracker.throttle_or_add("second", OpClass::Clean));
    assert!(!tracker.throttle_or_add("normal", OpClass::Normal));
    tracker.remove("first");
    assert!(!tracker.throttle_or_add("second", OpClass::Clean));
}

fn entry(id: &str, status: OperationStatus) -> PendingOperationEntry {
    let mut entry = PendingOperationEntry::with_id(id);
    entry.status = status;
    entry
}

#[rstest]
#[case(Selector::Reapable, entry("aaaa", OperationStatus::Stale), true)]
#[case(Selector::Reapable, entry("aaaa", OperationStatus::Failed), true)]
#[case(Selector::Reapable, entry("aaaa", OperationStatus::New), false)]
#[case(Selector::from_ids(["aaaa", "bbbb"]), entry("aaaa", OperationStatus::Stale), true)]
#[case(Selector::from_ids(["aaaa", "bbbb"]), entry("bbbb", OperationStatus::New), false)]
#[case(Selector::from_ids(["aaaa", "bbbb"]), entry("cccc", OperationStatus::Stale), false)]
#[case(Selector::from_ids(["aaaa", "dddd"]), entry("dddd", OperationStatus::Failed), true)]
fn selectors_pick_reapable_entries(
    #[case] selector: Selector,
    #[case] candidate: PendingOperationEntry,
    #[case] expected: bool,
) {
    assert_eq!(selector.matches(&candidate), expected);
}

#[rstest]
fn empty_id_lists_select_everything() {
    assert_eq!(Selector::from_ids(Vec::<String>::new()), Selector::Reapable);
}

#[rstest]
#[tokio::test]
async fn stale_creates_are_cleaned(setup: Setup) {
    setup.abandoned_create("lost");
    assert!(setup.used_kib() > 0);
    assert_eq!(mark_pending_operations_stale(&setup.db).expect("reset"), 1);

    let summary = setup.cleaner().clean().await.expect("clean");
    assert_eq!(summary.cleaned, 1);
    assert!(setup.ledger().is_empty());
    assert_eq!(setup.used_kib(), 0);
    let volumes = setup
        .db
        .view(|tx| tx.load_all::<VolumeEntry>())
        .expect("volumes");
    assert!(volumes.is_empty());
}

#[rstest]
#[tokio::test]
async fn cleaning_twice_changes_nothing_more(setup: Setup) {
    setup.abandoned_create("lost");
    mark_pending_operations_stale(&setup.db).expect("reset");
    setup.cleaner().clean().await.expect("first clean");
    let used = setup.used_kib();
    let summary = setup.cleaner().clean().await.expect("second clean");
    assert_eq!(summary, CleanSummary::default());
    assert_eq!(setup.used_kib(), used);
}

#[rstest]
#[tokio::test]
async fn live_entries_are_left_alone(setup: Setup) {
    setup.abandoned_create("running");
    let summary = setup.cleaner().clean().await.expect("clean");
    assert_eq!(summary, CleanSummary::default());
    assert_eq!(setup.ledger().len(), 1);
}

#[rstest]
#[tokio::test]
async fn failed_cleanups_stay_for_the_next_sweep(setup: Setup) {
    setup.abandoned_create("stuck");
    mark_pending_operations_stale(&setup.db).expect("reset");
    setup.mock.fail_always(
        ExecutorMethod::VolumeDestroy,
        ExecutorError::Command {
            host: String::from("manage-0-0"),
            message: String::from("volume stop failed"),
        },
    );

    let summary = setup.cleaner().clean().await.expect("sweep survives");
    assert_eq!(summary.failed, 1);
    assert_eq!(setup.ledger().len(), 1);

    setup.mock.clear_failures();
    let retried = setup.cleaner().clean().await.expect("clean");
    assert_eq!(retried.cleaned, 1);
    assert!(setup.ledger().is_empty());
}

#[rstest]
#[tokio::test]
async fn entries_that_cannot_be_loaded_are_skipped(setup: Setup) {
    setup
        .db
        .update(|tx| entry("broken", OperationStatus::Stale).save(tx))
        .expect("save");
    setup.abandoned_create("lost");
    mark_pending_operations_stale(&setup.db).expect("reset");

    let summary = setup.cleaner().clean().await.expect("clean");
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.cleaned, 1);
    let left: Vec<String> = setup.ledger().into_iter().map(|e| e.id).collect();
    assert_eq!(left, vec![String::from("broken")]);
}

#[rstest]
#[tokio::test]
async fn selected_ids_limit_the_sweep(setup: Setup) {
    let first = setup.abandoned_create("one");
    let second = setup.abandoned_create("two");
    mark_pending_operations_stale(&setup.db).expect("reset");

    let summary = setup
        .cleaner()
        .with_selector(Selector::from_ids([first.clone()]))
        .clean()
        .await
        .expect("clean");
    assert_eq!(summary.cleaned, 1);
    let left: Vec<String> = setup.ledger().into_iter().map(|e| e.id).collect();
    assert_eq!(left, vec![second]);
}

#[rstest]
fn marking_stale_needs_a_tracker(setup: Setup) {
    assert_eq!(
        setup.cleaner().mark_stale(),
        Err(CleanerError::MissingTracker)
    );
}

#[rstest]
fn entries_go_stale_after_the_stale_age(setup: Setup) {
    let id = setup.abandoned_create("slow");
    let created = setup.only_entry().timestamp;
    let cleaner = setup
        .cleaner()
        .with_tracker(Arc::new(OpTracker::new(8)), OpClass::Normal);

    assert_eq!(cleaner.mark_stale_at(created).expect("mark"), 0);
    assert_eq!(cleaner.mark_stale_at(created + 10).expect("mark"), 0);
    assert_eq!(cleaner.mark_stale_at(created + 70).expect("mark"), 1);
    let marked = setup.only_entry();
    assert_eq!(marked.id, id);
    assert_eq!(marked.status, OperationStatus::Stale);
}

#[rstest]
fn tracked_entries_never_go_stale(setup: Setup) {
    let id = setup.abandoned_create("busy");
    let created = setup.only_entry().timestamp;
    let tracker = Arc::new(OpTracker::new(8));
    tracker.add(&id, OpClass::Normal);
    let cleaner = setup.cleaner().with_tracker(tracker, OpClass::Normal);
    assert_eq!(cleaner.mark_stale_at(created + 3600).expect("mark"), 0);
    assert_eq!(setup.only_entry().status, OperationStatus::New);
}

#[rstest]
#[tokio::test]
async fn saturated_tracker_blocks_cleaning(setup: Setup) {
    setup.abandoned_create("lost");
    mark_pending_operations_stale(&setup.db).expect("reset");
    let tracker = Arc::new(OpTracker::new(3));
    let cleaner = setup
        .cleaner()
        .with_tracker(Arc::clone(&tracker), OpClass::Clean);
    for id in ["aaa", "bbb", "ccc"] {
        assert!(!tracker.throttle_or_add(id, OpClass::Normal));
    }

    let blocked = cleaner.clean().await.expect("clean");
    assert_eq!(blocked.throttled, 1);
    assert_eq!(setup.ledger().len(), 1);

    for id in ["aaa", "bbb", "ccc"] {
        tracker.remove(id);
    }
    assert!(!tracker.throttle_or_add("xxx", OpClass::Clean));
    let still_blocked = cleaner.clean().await.expect("clean");
    assert_eq!(still_blocked.throttled, 1);
    assert_eq!(setup.ledger().len(), 1);

    tracker.remove("xxx");
    let done = cleaner.clean().await.expect("clean");
    assert_eq!(done.cleaned, 1);
    assert!(setup.ledger().is_empty());
    assert!(tracker.is_empty());
}

#[rstest]
#[tokio::test]
async fn background_cleaner_sweeps_on_start_and_on_tick(setup: Setup) {
    setup.abandoned_create("first");
    mark_pending_operations_stale(&setup.db).expect("reset");
    let tracker = Arc::new(OpTracker::new(8));
    let cleaner = setup
        .cleaner()
        .with_tracker(tracker, OpClass::Clean)
        .with_stale_age(Duration::ZERO);
    let handle = BackgroundCleaner::new(
        cleaner,
        Duration::from_millis(5),
        Duration::from_millis(50),
    )
    .start();

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(setup.ledger().is_empty());

    setup.abandoned_create("second");
    assert_eq!(setup.ledger().len(), 1);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(setup.ledger().is_empty());

    handle.stop().await;
}

#[rstest]
#[tokio::test]
async fn stopped_background_cleaner_does_nothing(setup: Setup) {
    setup.abandoned_create("kept");
    mark_pending_operations_stale(&setup.db).expect("reset");
    let handle = BackgroundCleaner::new(
        setup.cleaner(),
        Duration::from_secs(3600),
        Duration::from_secs(3600),
    )
    .start();
    handle.stop().await;
    assert_eq!(setup.ledger().len(), 1);
}
