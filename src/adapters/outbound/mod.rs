mod sqlite_database;
mod sqlite_pool;

pub use sqlite_database::{SqliteDatabase, SqliteSessionStore};
pub use sqlite_pool::{PooledConnection, SqlitePool, SqlitePoolConfig, SqliteTarget};
