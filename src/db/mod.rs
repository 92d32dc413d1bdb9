//! SQLite persistence for lease bookkeeping.

pub mod storage;

pub use storage::{init_db, DbPool, SqliteStorage};
