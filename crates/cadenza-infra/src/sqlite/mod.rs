//! SQLite-backed persistence.

pub mod pool;
pub mod workflow;

pub use pool::StorePool;
pub use workflow::SqliteWorkflowStore;
