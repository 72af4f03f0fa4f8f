//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Driver seam with SQLite and in-process loopback implementations
//! - Connection pool management
//! - Dialect type table and typed column extraction

pub mod driver;
pub mod pool;
pub mod types;

pub use driver::{Driver, MemoryDriver, MemoryHandle, MemoryRow, SqliteDriver};
pub use pool::{Connection, ConnectionPool, ConnectionState, ConnectionSummary};
pub use types::{Dialect, ResultRow, Value, ValueType};
