use std::collections::{BTreeMap, BTreeSet};

use rhizo_types::{Key, OperationId, RhizoError, Value};

use crate::types::{Applied, KeyState, Snapshot};

/// Per-node key → value map with per-key version metadata.
///
/// Methods are synchronous: every mutation is a single in-memory step under
/// locks scoped to the keys it touches. Only the coordination-free engine
/// and the committed-log applier call [`mutate`](ReplicaStore::mutate).
pub trait ReplicaStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<KeyState>;

    /// Atomically read-modify-write `keys`.
    ///
    /// Locks are taken in key order, so concurrent callers never deadlock
    /// and disjoint key sets never contend. `f` sees the current value of
    /// every key and returns the new values to write, or `None` to leave
    /// them untouched.
    ///
    /// With `Some(op_id)` the id is recorded on every key; if it was already
    /// recorded on any of them, `f` is not called and the status is
    /// `Duplicate`. Idempotent merges pass `None` and keep no record.
    fn mutate<F>(&self, op_id: Option<OperationId>, keys: &BTreeSet<Key>, f: F) -> Result<Applied, RhizoError>
    where
        F: FnOnce(&BTreeMap<Key, Option<Value>>) -> Result<Option<BTreeMap<Key, Option<Value>>>, RhizoError>;

    /// Order token of the last committed consensus entry applied here.
    fn last_applied(&self) -> u64;

    fn set_last_applied(&self, index: u64);

    /// Capture every cell and the cursor. The cursor is read before the
    /// cells, so the image may hold entries past it but never misses one.
    fn build_snapshot(&self) -> Result<Snapshot, RhizoError>;

    /// Replace the whole replica state with `snapshot`. Must not race
    /// `mutate`; install before anything else writes to the store.
    fn install_snapshot(&self, snapshot: Snapshot) -> Result<(), RhizoError>;

    /// Number of keys holding a value.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
