pub mod error;
pub mod local_cache;
pub mod memory;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use error::StorageError;
pub use local_cache::{LocalCache, SyncState, DEFAULT_NAMESPACE};
pub use memory::MemoryKv;
pub use sqlite::SqliteKv;
pub use traits::*;
