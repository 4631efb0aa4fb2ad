//! Pool manager error types.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while managing pools or using their connections.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool manager is closed and cannot get connection")]
    ManagerClosed,

    #[error("connection pool for database '{dbname}' is closed")]
    PoolClosed { dbname: String },

    #[error("timed out after {timeout:?} waiting for a connection to database '{dbname}'")]
    Timeout { dbname: String, timeout: Duration },

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("token provider error: {0}")]
    Token(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type PoolResult<T> = Result<T, PoolError>;
