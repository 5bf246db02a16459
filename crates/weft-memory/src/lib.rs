pub mod short_term;
pub mod sqlite;
pub mod state;

pub use short_term::ShortTermMemory;
pub use sqlite::SqliteStateStore;
pub use state::InMemoryStateStore;
