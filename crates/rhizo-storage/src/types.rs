use std::collections::{BTreeMap, HashSet};

use rhizo_types::{Key, OperationId, ReplicaId, Value};

/// Current state of one key on this replica.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KeyState {
    /// `None` once the key has been deleted.
    pub value: Option<Value>,
    /// Bumped on every change to `value`.
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStatus {
    Changed,
    /// The mutation ran but chose not to write (e.g. a failed compare).
    Unchanged,
    /// The operation id had already been applied to these keys.
    Duplicate,
}

/// Result of [`ReplicaStore::mutate`](crate::ReplicaStore::mutate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub status: ApplyStatus,
    /// Value of every touched key after the mutation.
    pub values: BTreeMap<Key, Option<Value>>,
}

/// Per-key cell: value, version and the ids of tracked operations already
/// merged into it. Idempotent merges are not tracked.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct Cell {
    pub value: Option<Value>,
    pub version: u64,
    pub applied: HashSet<OperationId>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SnapshotMeta {
    /// Replica the snapshot was taken on.
    pub replica: ReplicaId,
    /// Consensus log cursor at the time of the snapshot.
    pub last_applied: u64,
    /// UUID v4 string identifying this snapshot.
    pub snapshot_id: String,
}

/// Internal serialized format stored in [`Snapshot::data`].
#[derive(serde::Serialize, serde::Deserialize)]
pub(crate) struct SnapshotContents {
    pub cells: Vec<(Key, Cell)>,
}

/// Full replica state, used to bootstrap a new replica from a peer.
///
/// `data` is a `bincode`-serialized [`SnapshotContents`]. Applied operation
/// ids travel with the values so the receiver keeps deduplicating deliveries
/// that were already merged on the sender.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}
