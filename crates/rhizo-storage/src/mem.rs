use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use rhizo_types::{Key, OperationId, ReplicaId, RhizoError, Value};

use crate::traits::ReplicaStore;
use crate::types::{Applied, ApplyStatus, Cell, KeyState, Snapshot, SnapshotContents, SnapshotMeta};

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, RhizoError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| RhizoError::Storage(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, RhizoError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| RhizoError::Storage(e.to_string()))
}

fn values_of(guards: &[(&Key, MutexGuard<'_, Cell>)]) -> BTreeMap<Key, Option<Value>> {
    guards.iter().map(|(k, g)| ((*k).clone(), g.value.clone())).collect()
}

/// In-memory `ReplicaStore`.
///
/// The outer map lock is only held to find or create a cell; reads and
/// merges then lock the individual cell.
pub struct MemReplicaStore {
    replica: ReplicaId,
    cells: RwLock<HashMap<Key, Arc<Mutex<Cell>>>>,
    last_applied: AtomicU64,
}

impl MemReplicaStore {
    pub fn new(replica: ReplicaId) -> Self {
        MemReplicaStore {
            replica,
            cells: RwLock::new(HashMap::new()),
            last_applied: AtomicU64::new(0),
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Number of operation ids recorded against `key` for deduplication.
    pub fn dedup_entries(&self, key: &str) -> usize {
        self.cells.read().get(key).map_or(0, |c| c.lock().applied.len())
    }

    fn cell(&self, key: &str) -> Arc<Mutex<Cell>> {
        if let Some(cell) = self.cells.read().get(key) {
            return cell.clone();
        }
        self.cells.write().entry(key.to_owned()).or_default().clone()
    }
}

impl ReplicaStore for MemReplicaStore {
    fn get(&self, key: &str) -> Option<KeyState> {
        let cell = self.cells.read().get(key)?.clone();
        let g = cell.lock();
        if g.version == 0 {
            return None;
        }
        Some(KeyState { value: g.value.clone(), version: g.version })
    }

    fn mutate<F>(&self, op_id: Option<OperationId>, keys: &BTreeSet<Key>, f: F) -> Result<Applied, RhizoError>
    where
        F: FnOnce(&BTreeMap<Key, Option<Value>>) -> Result<Option<BTreeMap<Key, Option<Value>>>, RhizoError>,
    {
        let cells: Vec<(&Key, Arc<Mutex<Cell>>)> = keys.iter().map(|k| (k, self.cell(k))).collect();
        // `keys` is ordered, so every caller locks in the same order.
        let mut guards: Vec<_> = cells.iter().map(|(k, c)| (*k, c.lock())).collect();

        if let Some(id) = op_id {
            if guards.iter().any(|(_, g)| g.applied.contains(&id)) {
                return Ok(Applied { status: ApplyStatus::Duplicate, values: values_of(&guards) });
            }
        }

        let current = values_of(&guards);
        let status = match f(&current)? {
            None => ApplyStatus::Unchanged,
            Some(mut updates) => {
                for (key, g) in guards.iter_mut() {
                    if let Some(value) = updates.remove(*key) {
                        g.value = value;
                        g.version += 1;
                    }
                }
                ApplyStatus::Changed
            }
        };
        if let Some(id) = op_id {
            for (_, g) in guards.iter_mut() {
                g.applied.insert(id);
            }
        }

        Ok(Applied { status, values: values_of(&guards) })
    }

    fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::Acquire)
    }

    fn set_last_applied(&self, index: u64) {
        self.last_applied.fetch_max(index, Ordering::AcqRel);
    }

    fn build_snapshot(&self) -> Result<Snapshot, RhizoError> {
        // Read the cursor first: cells may run ahead of it, never behind.
        // Entries past the cursor are replayed on install and dedup by id.
        let last_applied = self.last_applied();
        let cells: Vec<(Key, Cell)> = {
            let map = self.cells.read();
            map.iter().map(|(k, c)| (k.clone(), c.lock().clone())).collect()
        };
        Ok(Snapshot {
            meta: SnapshotMeta {
                replica: self.replica,
                last_applied,
                snapshot_id: uuid::Uuid::new_v4().to_string(),
            },
            data: encode(&SnapshotContents { cells })?,
        })
    }

    fn install_snapshot(&self, snapshot: Snapshot) -> Result<(), RhizoError> {
        let contents: SnapshotContents = decode(&snapshot.data)?;
        let mut map = self.cells.write();
        *map = contents
            .cells
            .into_iter()
            .map(|(k, cell)| (k, Arc::new(Mutex::new(cell))))
            .collect();
        self.last_applied.store(snapshot.meta.last_applied, Ordering::Release);
        Ok(())
    }

    fn len(&self) -> usize {
        self.cells.read().values().filter(|c| c.lock().value.is_some()).count()
    }
}
