pub mod backend;
pub mod engine;
pub mod persistence;

pub use backend::{MapState, PersistentMap};
pub use engine::{JournalEntry, MemoryEngine, StorageEngine};
pub use persistence::{FileEngine, JOURNAL_FILE, SNAPSHOT_FILE, StoreSnapshot};
