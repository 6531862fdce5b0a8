//! Bounded set of operations currently running in this process.

use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Coarse kind of tracked work.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpClass {
    /// An operation started on behalf of a caller.
    Normal,
    /// A cleanup replay. At most one runs at a time.
    Clean,
}

/// Tracks in-flight operation ids, up to a fixed limit.
///
/// Tracked ids are never marked stale, and the limit bounds how much remote
/// work runs concurrently.
#[derive(Debug)]
pub struct OpTracker {
    limit: usize,
    ops: Mutex<BTreeMap<String, OpClass>>,
}

impl OpTracker {
    /// Creates a tracker admitting at most `limit` ids.
    #[must_use]
    pub const fn new(limit: usize) -> Self {
        Self {
            limit,
            ops: Mutex::new(BTreeMap::new()),
        }
    }

    /// Maximum number of tracked ids.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Tracks `id` unconditionally.
    pub fn add(&self, id: &str, class: OpClass) {
        self.ops.lock().insert(id.to_owned(), class);
    }

    /// Stops tracking `id`. Unknown ids are ignored.
    pub fn remove(&self, id: &str) {
        self.ops.lock().remove(id);
    }

    /// Returns `true` while `id` is tracked.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.ops.lock().contains_key(id)
    }

    /// Number of tracked ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    /// Returns `true` when nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }

    /// Tracks `id` unless the tracker is saturated, returning `true` when the
    /// caller must back off.
    ///
    /// An id that is already tracked is never throttled. A [`OpClass::Clean`]
    /// id is also throttled while another cleanup is tracked.
    #[must_use]
    pub fn throttle_or_add(&self, id: &str, class: OpClass) -> bool {
        let mut ops = self.ops.lock();
        if ops.contains_key(id) {
            return false;
        }
        if ops.len() >= self.limit {
            tracing::debug!(op_id = %id, limit = self.limit, "operation throttled");
            return true;
        }
        if class == OpClass::Clean && ops.values().any(|tracked| *tracked == OpClass::Clean) {
            tracing::debug!(op_id = %id, "cleanup throttled behind another cleanup");
            return true;
        }
        ops.insert(id.to_owned(), class);
        false
    }
}
