//! Error types for the store core.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Each variant carries enough context for the caller to decide whether to retry,
//! abort the query, or treat the failure as a programming error.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// The driver refused to open a new physical connection.
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    /// A reused handle failed its forced validity probe.
    #[error("Stale connection handle: connection {connection_id} is no longer usable")]
    StaleHandle { connection_id: u64 },

    #[error("Connection pool is closed")]
    PoolClosed,

    /// The wrapper is not in the state the operation requires (e.g. double release).
    #[error("Invalid connection state: {message} (connection: {connection_id})")]
    ConnectionState { connection_id: u64, message: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "SQLITE_CONSTRAINT" or "42P01"
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Unknown column alias '{alias}' in result row")]
    UnknownColumnAlias { alias: String },

    #[error("Unsupported aggregation type: {function} over {value_type}")]
    UnsupportedAggregationType { function: String, value_type: String },

    /// Capacity overrun or index mismatch inside the entity cache.
    #[error("Cache invariant violated: {message}")]
    CacheInvariant { message: String },

    #[error("Mapping error: {message} (entity: {entity})")]
    Mapping { message: String, entity: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn stale_handle(connection_id: u64) -> Self {
        Self::StaleHandle { connection_id }
    }

    pub fn connection_state(connection_id: u64, message: impl Into<String>) -> Self {
        Self::ConnectionState {
            connection_id,
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    pub fn unknown_column_alias(alias: impl Into<String>) -> Self {
        Self::UnknownColumnAlias {
            alias: alias.into(),
        }
    }

    pub fn unsupported_aggregation(
        function: impl Into<String>,
        value_type: impl Into<String>,
    ) -> Self {
        Self::UnsupportedAggregationType {
            function: function.into(),
            value_type: value_type.into(),
        }
    }

    pub fn cache_invariant(message: impl Into<String>) -> Self {
        Self::CacheInvariant {
            message: message.into(),
        }
    }

    /// Create a mapping error for the given entity type.
    pub fn mapping(message: impl Into<String>, entity: impl Into<String>) -> Self {
        Self::Mapping {
            message: message.into(),
            entity: entity.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// The pool never retries on its own; this is a hint for the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Errors that indicate a bug in the caller or in this crate rather than
    /// an environmental failure.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::CacheInvariant { .. } | Self::ConnectionState { .. } | Self::Internal { .. }
        )
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 30),
            sqlx::Error::PoolClosed => DbError::PoolClosed,
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check that the database file or server is reachable",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => DbError::unknown_column_alias(col),
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "Reopen the connection",
            ),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for store operations.
pub type DbResult<T> = Result<T, DbError>;
