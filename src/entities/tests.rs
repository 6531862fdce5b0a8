//! Unit tests for entity records and block-hosting arithmetic.

use super::*;
use crate::db::Db;
use crate::pending::PendingOperationEntry;
use rstest::{fixture, rstest};

#[fixture]
fn hosting() -> VolumeEntry {
    let mut vol = VolumeEntry::new_block_hosting(100, &[]);
    vol.set_raw_capacity(100).expect("raw capacity should fit");
    vol
}

#[rstest]
#[case(100, 98)]
#[case(1100, 1078)]
#[case(49, 48)]
#[case(1, 0)]
#[case(0, 0)]
fn reduce_raw_size_floors_ninety_eight_percent(#[case] raw: u64, #[case] reduced: u64) {
    assert_eq!(reduce_raw_size(raw), reduced);
}

#[rstest]
fn set_raw_capacity_splits_free_and_reserved(hosting: VolumeEntry) {
    assert_eq!(hosting.info.block_info.free_size, 98);
    assert_eq!(hosting.info.block_info.reserved_size, 2);
    assert_eq!(hosting.required_reservation(), 2);
}

#[rstest]
fn modify_free_size_refuses_negative(mut hosting: VolumeEntry) {
    let err = hosting
        .modify_free_size(-99)
        .expect_err("free size cannot go negative");
    assert!(matches!(err, BlockSizeError::Negative { field: "free size", .. }));
    assert_eq!(hosting.info.block_info.free_size, 98);
}

#[rstest]
fn modify_reserved_size_refuses_overflow(mut hosting: VolumeEntry) {
    let err = hosting
        .modify_reserved_size(1)
        .expect_err("free plus reserved cannot exceed size");
    assert!(matches!(err, BlockSizeError::Overflow { size: 100, .. }));
    assert_eq!(hosting.info.block_info.reserved_size, 2);
}

#[rstest]
fn modify_free_size_round_trips_a_block_volume(mut hosting: VolumeEntry) {
    hosting.modify_free_size(-10).expect("take space");
    assert_eq!(hosting.info.block_info.free_size, 88);
    hosting.modify_free_size(10).expect("return space");
    assert_eq!(hosting.info.block_info.free_size, 98);
}

#[rstest]
fn plain_volumes_have_no_block_budget() {
    let mut vol = VolumeEntry::new("data", 10, Durability::default());
    let err = vol.modify_free_size(1).expect_err("not block hosting");
    assert!(matches!(err, BlockSizeError::NotBlockHosting { .. }));
}

#[rstest]
fn add_raw_capacity_grows_both_budgets(mut hosting: VolumeEntry) {
    hosting.info.size = 200;
    hosting.add_raw_capacity(100).expect("growth should fit");
    assert_eq!(hosting.info.block_info.free_size, 196);
    assert_eq!(hosting.info.block_info.reserved_size, 4);
}

#[rstest]
fn total_size_skips_pending_block_volumes(mut hosting: VolumeEntry) {
    let db = Db::temporary().expect("temporary store");
    let mut done = BlockVolumeEntry::new("done", 10, 0, false);
    let mut building = BlockVolumeEntry::new("building", 5, 0, false);
    building.pending = PendingMarker::OwnedBy("op".to_owned());
    done.info.hosting_volume = hosting.info.id.clone();
    hosting.info.block_info.block_volumes = vec![done.info.id.clone(), building.info.id.clone()];
    db.update(|tx| {
        tx.save(&done)?;
        tx.save(&building)
    })
    .expect("seed block volumes");

    let used = db
        .view(|tx| hosting.total_size_block_volumes(tx))
        .expect("sum hosted sizes");
    assert_eq!(used, 10);
    hosting.modify_free_size(-10).expect("account for the committed volume");
    assert!(hosting.block_hosting_size_is_correct(used));
}

#[rstest]
fn device_refuses_over_allocation() {
    let mut device = DeviceEntry::new("node", "/dev/sdb", 100);
    device.storage_allocate(60).expect("fits");
    let err = device.storage_allocate(41).expect_err("does not fit");
    assert!(matches!(err, CapacityError::Exhausted { free: 40, requested: 41, .. }));
    device.storage_free(60).expect("release");
    assert_eq!((device.free_size, device.used_size), (100, 0));
    assert!(device.storage_free(1).is_err());
}

#[rstest]
#[case(100, 1_048_576, 1_048_576, 5_243)]
#[case(150, 1_048_576, 1_572_864, 7_865)]
#[case(100, 1_024, 1_024, 2_048)]
fn brick_sizes_thin_pool_from_snapshot_factor(
    #[case] factor: u64,
    #[case] size: u64,
    #[case] tp_size: u64,
    #[case] metadata: u64,
) {
    let brick = BrickEntry::new(size, factor, "dev", "node", "vol");
    assert_eq!(brick.tp_size, tp_size);
    assert_eq!(brick.pool_metadata_size, metadata);
    assert_eq!(brick.total_size(), tp_size + metadata);
    assert!(brick.path.ends_with(&format!("brick_{}/brick", brick.id)));
}

#[rstest]
fn cloned_bricks_take_no_device_space() {
    let parent = BrickEntry::new(1024, 100, "dev", "node", "vol");
    let clone = BrickEntry::clone_of(&parent, "clone-vol");
    assert_eq!(clone.total_size(), 0);
    assert_eq!(clone.device_id, parent.device_id);
    assert_ne!(clone.id, parent.id);
}

#[rstest]
fn unknown_restriction_deserialises_and_has_no_rank() {
    let parsed: BlockRestriction =
        serde_json::from_str("\"frozen\"").expect("unknown values are tolerated");
    assert_eq!(parsed, BlockRestriction::Unknown);
    assert_eq!(parsed.rank(), None);
    assert_eq!(BlockRestriction::LockedByUpdate.rank(), Some(2));
}

#[rstest]
fn listings_hide_entities_that_are_still_being_created() {
    let db = Db::temporary().expect("temporary store");
    let committed = VolumeEntry::new("committed", 10, Durability::default());
    let mut creating = VolumeEntry::new("creating", 10, Durability::default());
    let mut op = PendingOperationEntry::new();
    op.record_add_volume(&mut creating).expect("record");
    db.update(|tx| {
        tx.save(&committed)?;
        tx.save(&creating)?;
        op.save(tx)
    })
    .expect("seed");

    let (visible, complete) = db
        .view(|tx| Ok::<_, DbError>((list_visible_volumes(tx)?, list_complete_volumes(tx)?)))
        .expect("list");
    assert_eq!(visible.len(), 1);
    assert_eq!(visible.first().map(|v| v.info.name.as_str()), Some("committed"));
    assert_eq!(complete, vec![committed.info.id.clone()]);
}

#[rstest]
fn block_volume_listings_hide_creates_but_keep_deletes() {
    let db = Db::temporary().expect("temporary store");
    let committed = BlockVolumeEntry::new("committed", 5, 0, false);
    let mut creating = BlockVolumeEntry::new("creating", 5, 0, false);
    let mut deleting = BlockVolumeEntry::new("deleting", 5, 0, false);
    let mut create_op = PendingOperationEntry::new();
    create_op
        .record_add_block_volume(&mut creating)
        .expect("record create");
    let mut delete_op = PendingOperationEntry::new();
    delete_op
        .record_delete_block_volume(&mut deleting)
        .expect("record delete");
    db.update(|tx| {
        tx.save(&committed)?;
        tx.save(&creating)?;
        tx.save(&deleting)?;
        create_op.save(tx)?;
        delete_op.save(tx)
    })
    .expect("seed");

    let (visible, mut complete) = db
        .view(|tx| {
            Ok::<_, DbError>((
                list_visible_block_volumes(tx)?,
                list_complete_block_volumes(tx)?,
            ))
        })
        .expect("list");
    let names: Vec<&str> = visible.iter().map(|b| b.info.name.as_str()).collect();
    assert_eq!(names, vec!["committed"]);

    complete.sort();
    let mut want = vec![committed.info.id.clone(), deleting.info.id.clone()];
    want.sort();
    assert_eq!(complete, want);
    assert!(!complete.contains(&creating.info.id));
}

#[rstest]
fn blank_names_are_generated_from_ids() {
    let vol = VolumeEntry::new("  ", 1, Durability::None);
    assert_eq!(vol.info.name, format!("vol_{}", vol.info.id));
    let bvol = BlockVolumeEntry::new("", 1, 0, false);
    assert_eq!(bvol.info.name, format!("blockvol_{}", bvol.info.id));
}
