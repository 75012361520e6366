//! Local persistence: entity files, atomic writes with backups, the run
//! lock, and the advisory SQLite index.

pub mod backup;
pub mod index;
pub mod lock;
pub mod store;

pub use backup::{AtomicWriter, ReadOutcome};
pub use index::{EntityIndex, IndexQuery, IndexedEntity, RebuildStats};
pub use lock::{LockHolder, RunLock};
pub use store::{DATA_DIR, EntityFilter, EntityIter, EntityStore, FileStamp};
