//! Unit tests for the entity store.

use super::*;
use rstest::{fixture, rstest};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
struct Widget {
    id: String,
    size: u64,
}

impl Record for Widget {
    const BUCKET: Bucket = Bucket::Volume;

    fn record_id(&self) -> &str {
        &self.id
    }
}

fn widget(id: &str, size: u64) -> Widget {
    Widget {
        id: id.to_owned(),
        size,
    }
}

#[fixture]
fn db() -> Db {
    Db::temporary().expect("temporary store")
}

#[rstest]
fn update_commits_and_view_reads(db: Db) {
    db.update(|tx| tx.save(&widget("a", 1)))
        .expect("save should commit");
    let loaded = db
        .view(|tx| tx.load::<Widget>("a"))
        .expect("record should load");
    assert_eq!(loaded, widget("a", 1));
}

#[rstest]
fn failed_update_discards_writes(db: Db) {
    let result: Result<(), DbError> = db.update(|tx| {
        tx.save(&widget("a", 1))?;
        Err(DbError::ReadOnly)
    });
    assert!(result.is_err());
    let found = db.view(|tx| tx.contains::<Widget>("a"));
    assert_eq!(found, Ok(false));
}

#[rstest]
fn update_reads_its_own_writes(db: Db) {
    let size = db
        .update(|tx| {
            tx.save(&widget("a", 7))?;
            tx.load::<Widget>("a").map(|w| w.size)
        })
        .expect("update should succeed");
    assert_eq!(size, 7);
}

#[rstest]
fn deleting_missing_record_fails(db: Db) {
    let writable = db.view(|tx| Ok::<_, DbError>(tx.writable()));
    assert_eq!(writable, Ok(false));
    let err = db
        .update(|tx| tx.delete::<Widget>("missing"))
        .expect_err("deleting a missing record should fail");
    assert_eq!(
        err,
        DbError::NotFound {
            bucket: Bucket::Volume,
            id: String::from("missing")
        }
    );
}

#[rstest]
fn blank_ids_are_refused(db: Db) {
    let err = db
        .update(|tx| tx.save(&widget("", 1)))
        .expect_err("blank id should be rejected");
    assert_eq!(
        err,
        DbError::MissingId {
            bucket: Bucket::Volume
        }
    );
}

#[rstest]
fn ids_are_sorted(db: Db) {
    db.update(|tx| {
        tx.save(&widget("b", 2))?;
        tx.save(&widget("a", 1))
    })
    .expect("saves should commit");
    let ids = db.view(|tx| tx.ids::<Widget>());
    assert_eq!(ids, Ok(vec![String::from("a"), String::from("b")]));
}

#[rstest]
fn records_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("store"))
        .unwrap_or_else(|path| panic!("non UTF-8 temp path: {}", path.display()));

    let first = Db::open(&path).expect("open empty store");
    first
        .update(|tx| tx.save(&widget("a", 3)))
        .expect("save should commit");
    drop(first);

    let reopened = Db::open(&path).expect("reopen store");
    let loaded = reopened
        .view(|tx| tx.load::<Widget>("a"))
        .expect("record should survive reopen");
    assert_eq!(loaded.size, 3);
}

#[rstest]
fn read_transactions_refuse_writes(db: Db) {
    let mut tx = Tx {
        txn: Txn::Read(db.env.read_txn().expect("read transaction")),
        tables: &db.tables,
    };
    assert!(!tx.writable());
    assert_eq!(tx.save(&widget("a", 1)), Err(DbError::ReadOnly));
    assert_eq!(tx.delete::<Widget>("a"), Err(DbError::ReadOnly));
}

#[rstest]
fn aborted_updates_leave_earlier_commits_alone(db: Db) {
    db.update(|tx| tx.save(&widget("a", 1)))
        .expect("first save should commit");
    let result: Result<(), DbError> = db.update(|tx| {
        tx.delete::<Widget>("a")?;
        tx.save(&widget("b", 2))?;
        Err(DbError::ReadOnly)
    });
    assert!(result.is_err());
    let ids = db.view(|tx| tx.ids::<Widget>());
    assert_eq!(ids, Ok(vec![String::from("a")]));
}

#[rstest]
fn undecodable_records_name_their_bucket(db: Db) {
    db.update(|tx| {
        let table = tx.table(Bucket::Volume)?;
        table.put(tx.rw()?, "bad", b"not json")?;
        Ok::<_, DbError>(())
    })
    .expect("raw write should commit");
    let err = db
        .view(|tx| tx.load::<Widget>("bad"))
        .expect_err("garbage should not decode");
    assert!(
        matches!(err, DbError::Decode { bucket: Bucket::Volume, ref id, .. } if id == "bad"),
        "unexpected error: {err:?}"
    );
}

#[rstest]
#[case("cluster", Some(Bucket::Cluster))]
#[case("pending_operation", Some(Bucket::PendingOperation))]
#[case("bogus", None)]
fn bucket_names_round_trip(#[case] name: &str, #[case] expected: Option<Bucket>) {
    assert_eq!(Bucket::from_name(name), expected);
}
