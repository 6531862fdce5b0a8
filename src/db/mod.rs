//! Transactional entity store backed by LMDB.
//!
//! Records live in named buckets keyed by id, one LMDB database per bucket.
//! A [`Db`] hands out scoped transactions: [`Db::view`] for reads and
//! [`Db::update`] for writes. An update commits only when the closure returns
//! `Ok`; an `Err` aborts the write transaction and discards every write made
//! inside it. Reads inside an update observe the transaction's own earlier
//! writes.

use std::collections::BTreeMap;
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use heed::{Env, RoTxn, RwTxn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use thiserror::Error;

mod env;

use env::{DEFAULT_MAP_SIZE, EnvHandles, Table};

/// Named record collections held by the store.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    /// Cluster records.
    Cluster,
    /// Storage node records.
    Node,
    /// Block device records.
    Device,
    /// Brick records.
    Brick,
    /// Volume records.
    Volume,
    /// Block volume records.
    BlockVolume,
    /// Pending operation ledger entries.
    PendingOperation,
}

impl Bucket {
    /// Every bucket, one LMDB database each.
    pub const ALL: [Self; 7] = [
        Self::Cluster,
        Self::Node,
        Self::Device,
        Self::Brick,
        Self::Volume,
        Self::BlockVolume,
        Self::PendingOperation,
    ];

    /// Looks up a bucket by its stable name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|bucket| bucket.name() == name)
    }

    /// Returns the stable bucket name, also used as the LMDB database name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::Node => "node",
            Self::Device => "device",
            Self::Brick => "brick",
            Self::Volume => "volume",
            Self::BlockVolume => "block_volume",
            Self::PendingOperation => "pending_operation",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A structured record stored in a bucket under its own id.
pub trait Record: Serialize + DeserializeOwned {
    /// Bucket holding records of this type.
    const BUCKET: Bucket;

    /// Identifier the record is stored under.
    fn record_id(&self) -> &str;
}

/// Errors raised by the store.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DbError {
    /// Raised when a record id is absent from its bucket.
    #[error("{bucket} {id} not found")]
    NotFound {
        /// Bucket that was searched.
        bucket: Bucket,
        /// Identifier that was requested.
        id: String,
    },
    /// Raised when saving a record without an id.
    #[error("refusing to save {bucket} record with an empty id")]
    MissingId {
        /// Bucket the record belongs to.
        bucket: Bucket,
    },
    /// Raised when a record cannot be encoded.
    #[error("failed to encode {bucket} {id}: {message}")]
    Encode {
        /// Bucket the record belongs to.
        bucket: Bucket,
        /// Identifier of the record.
        id: String,
        /// Serializer error text.
        message: String,
    },
    /// Raised when a stored record cannot be decoded.
    #[error("failed to decode {bucket} {id}: {message}")]
    Decode {
        /// Bucket the record belongs to.
        bucket: Bucket,
        /// Identifier of the record.
        id: String,
        /// Deserializer error text.
        message: String,
    },
    /// Raised when a write is attempted inside a view transaction.
    #[error("write attempted in a read-only transaction")]
    ReadOnly,
    /// Raised when the store directory cannot be created.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Store directory.
        path: Utf8PathBuf,
        /// Operating system error text.
        message: String,
    },
    /// Raised by LMDB when opening, reading or committing.
    #[error("store error: {message}")]
    Store {
        /// LMDB error text.
        message: String,
    },
}

impl From<heed::Error> for DbError {
    fn from(value: heed::Error) -> Self {
        Self::Store {
            message: value.to_string(),
        }
    }
}

/// Embedded store with one writer at a time and concurrent readers.
pub struct Db {
    env: Env,
    tables: BTreeMap<Bucket, Table>,
    path: Utf8PathBuf,
    // Declared after `env` so the environment closes before the directory
    // is removed.
    scratch: Option<TempDir>,
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.path)
            .field("temporary", &self.scratch.is_some())
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Opens, creating when needed, the store environment in directory `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Io`] when the directory cannot be created and
    /// [`DbError::Store`] when LMDB refuses the environment.
    pub fn open(path: &Utf8Path) -> Result<Self, DbError> {
        let EnvHandles { env, tables } = env::open_rw(path, DEFAULT_MAP_SIZE)?;
        Ok(Self {
            env,
            tables,
            path: path.to_path_buf(),
            scratch: None,
        })
    }

    /// Opens a store in a fresh temporary directory that is removed when the
    /// store is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Io`] when no temporary directory can be created, or
    /// any error from [`Db::open`].
    pub fn temporary() -> Result<Self, DbError> {
        let scratch = tempfile::Builder::new()
            .prefix("brickwork-")
            .tempdir()
            .map_err(|err| DbError::Io {
                path: Utf8PathBuf::from_path_buf(std::env::temp_dir()).unwrap_or_default(),
                message: err.to_string(),
            })?;
        let path = Utf8PathBuf::from_path_buf(scratch.path().to_path_buf()).map_err(|_| {
            DbError::Io {
                path: Utf8PathBuf::new(),
                message: String::from("temporary directory is not valid UTF-8"),
            }
        })?;
        let mut db = Self::open(&path)?;
        db.scratch = Some(scratch);
        Ok(db)
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Runs `f` inside a read-only transaction.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns, or [`DbError::Store`] converted into `E`
    /// when the read transaction cannot start.
    pub fn view<T, E>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<DbError>,
    {
        let txn = self.env.read_txn().map_err(DbError::from)?;
        let tx = Tx {
            txn: Txn::Read(txn),
            tables: &self.tables,
        };
        f(&tx)
    }

    /// Runs `f` inside a read-write transaction. Changes become visible only
    /// when `f` succeeds and the transaction commits.
    ///
    /// # Errors
    ///
    /// Returns the error from `f` (aborting all its writes) or a
    /// [`DbError`] converted into `E` when the commit fails.
    pub fn update<T, E>(&self, f: impl FnOnce(&mut Tx<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<DbError>,
    {
        let txn = self.env.write_txn().map_err(DbError::from)?;
        let mut tx = Tx {
            txn: Txn::Write(txn),
            tables: &self.tables,
        };
        let out = f(&mut tx)?;
        tx.commit()?;
        Ok(out)
    }
}

enum Txn<'e> {
    Read(RoTxn<'e>),
    Write(RwTxn<'e>),
}

/// Handle passed to transaction closures.
pub struct Tx<'e> {
    txn: Txn<'e>,
    tables: &'e BTreeMap<Bucket, Table>,
}

impl<'e> Tx<'e> {
    fn ro(&self) -> &RoTxn<'e> {
        match &self.txn {
            Txn::Read(txn) => txn,
            Txn::Write(txn) => &**txn,
        }
    }

    fn rw(&mut self) -> Result<&mut RwTxn<'e>, DbError> {
        match &mut self.txn {
            Txn::Read(_) => Err(DbError::ReadOnly),
            Txn::Write(txn) => Ok(txn),
        }
    }

    fn table(&self, bucket: Bucket) -> Result<Table, DbError> {
        self.tables
            .get(&bucket)
            .copied()
            .ok_or_else(|| DbError::Store {
                message: format!("bucket {bucket} is not open"),
            })
    }

    fn commit(self) -> Result<(), DbError> {
        match self.txn {
            Txn::Read(txn) => txn.commit()?,
            Txn::Write(txn) => txn.commit()?,
        }
        Ok(())
    }

    /// Returns `true` when the transaction may write.
    #[must_use]
    pub const fn writable(&self) -> bool {
        matches!(self.txn, Txn::Write(_))
    }

    /// Loads the record stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] when absent or [`DbError::Decode`] when
    /// the stored value does not match `R`.
    pub fn load<R: Record>(&self, id: &str) -> Result<R, DbError> {
        self.try_load(id)?.ok_or_else(|| DbError::NotFound {
            bucket: R::BUCKET,
            id: id.to_owned(),
        })
    }

    /// Loads the record stored under `id`, returning `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Decode`] when the stored value does not match `R`.
    pub fn try_load<R: Record>(&self, id: &str) -> Result<Option<R>, DbError> {
        let table = self.table(R::BUCKET)?;
        let Some(bytes) = table.get(self.ro(), id)? else {
            return Ok(None);
        };
        serde_json::from_slice(bytes)
            .map(Some)
            .map_err(|err| DbError::Decode {
                bucket: R::BUCKET,
                id: id.to_owned(),
                message: err.to_string(),
            })
    }

    /// Returns `true` when a record of type `R` exists under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Store`] when the lookup fails.
    pub fn contains<R: Record>(&self, id: &str) -> Result<bool, DbError> {
        Ok(self.table(R::BUCKET)?.get(self.ro(), id)?.is_some())
    }

    /// Lists every id in the bucket of `R`, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Store`] when the bucket cannot be iterated.
    pub fn ids<R: Record>(&self) -> Result<Vec<String>, DbError> {
        let table = self.table(R::BUCKET)?;
        let mut ids = Vec::new();
        for item in table.iter(self.ro())? {
            let (id, _) = item?;
            ids.push(id.to_owned());
        }
        Ok(ids)
    }

    /// Loads every record in the bucket of `R`, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Decode`] when any stored value does not match `R`.
    pub fn load_all<R: Record>(&self) -> Result<Vec<R>, DbError> {
        let table = self.table(R::BUCKET)?;
        let mut records = Vec::new();
        for item in table.iter(self.ro())? {
            let (id, bytes) = item?;
            let record = serde_json::from_slice(bytes).map_err(|err| DbError::Decode {
                bucket: R::BUCKET,
                id: id.to_owned(),
                message: err.to_string(),
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Inserts or replaces `record`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ReadOnly`] in a view, [`DbError::MissingId`] for a
    /// blank id, or [`DbError::Encode`] when serialisation fails.
    pub fn save<R: Record>(&mut self, record: &R) -> Result<(), DbError> {
        let id = record.record_id();
        if id.is_empty() {
            return Err(DbError::MissingId { bucket: R::BUCKET });
        }
        let bytes = serde_json::to_vec(record).map_err(|err| DbError::Encode {
            bucket: R::BUCKET,
            id: id.to_owned(),
            message: err.to_string(),
        })?;
        let table = self.table(R::BUCKET)?;
        table.put(self.rw()?, id, &bytes)?;
        Ok(())
    }

    /// Removes the record stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ReadOnly`] in a view and [`DbError::NotFound`] when
    /// nothing is stored under `id`.
    pub fn delete<R: Record>(&mut self, id: &str) -> Result<(), DbError> {
        let table = self.table(R::BUCKET)?;
        if table.delete(self.rw()?, id)? {
            Ok(())
        } else {
            Err(DbError::NotFound {
                bucket: R::BUCKET,
                id: id.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests;
