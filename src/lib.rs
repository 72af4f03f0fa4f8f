//! sqlstore
//!
//! Execution and resource-management core of a relational object mapper: a
//! bounded connection pool, an LRU identity map shared across concurrent
//! queries, and the collectors that turn result rows into typed values and
//! entities.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod query;
pub mod store;

pub use cache::{CacheStats, EntityCache};
pub use config::{CacheOptions, PoolOptions, StoreConfig};
pub use db::{Connection, ConnectionPool, Dialect, Driver, MemoryDriver, SqliteDriver, Value};
pub use error::{DbError, DbResult};
pub use models::{CacheKey, Entity, EntityData, EntityMapping};
pub use query::{ResultValue, SelectClause};
pub use store::Store;
