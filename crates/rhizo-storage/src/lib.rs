pub mod mem;
pub mod traits;
pub mod types;

pub use mem::MemReplicaStore;
pub use traits::ReplicaStore;
pub use types::{Applied, ApplyStatus, KeyState, Snapshot, SnapshotMeta};
