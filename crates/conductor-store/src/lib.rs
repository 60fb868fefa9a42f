pub mod memory;
pub mod sqlite;

pub use memory::MemoryRunStore;
pub use sqlite::SqliteRunStore;
