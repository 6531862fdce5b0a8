//! LMDB environment setup for [`Db`](super::Db).

use std::collections::BTreeMap;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, Error as HeedError};

use super::{Bucket, DbError};

/// Address space reserved for the environment. LMDB only grows the file as
/// pages are written.
pub(super) const DEFAULT_MAP_SIZE: usize = 1 << 30;

pub(super) type Table = Database<Str, Bytes>;

pub(super) struct EnvHandles {
    pub(super) env: Env,
    pub(super) tables: BTreeMap<Bucket, Table>,
}

pub(super) fn open_rw(path: &Utf8Path, map_size: usize) -> Result<EnvHandles, DbError> {
    Dir::create_ambient_dir_all(path, ambient_authority()).map_err(|err| DbError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    let mut options = EnvOpenOptions::new();
    options.map_size(map_size);
    options.max_dbs(u32::try_from(Bucket::ALL.len()).unwrap_or(u32::MAX));

    // SAFETY: the environment is opened once per `Db`, and the directory is
    // not modified behind LMDB's back while it is open.
    let env = match unsafe { options.open(path.as_std_path()) } {
        Ok(env) => env,
        Err(HeedError::BadOpenOptions { env, .. }) => env,
        Err(err) => {
            tracing::error!(%path, map_size, ?err, "failed to open store environment");
            return Err(err.into());
        }
    };

    let mut txn = env.write_txn()?;
    let mut tables = BTreeMap::new();
    for bucket in Bucket::ALL {
        let table = env.create_database::<Str, Bytes>(&mut txn, Some(bucket.name()))?;
        tables.insert(bucket, table);
    }
    txn.commit()?;

    Ok(EnvHandles { env, tables })
}
