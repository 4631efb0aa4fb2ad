//! poolkeeper-core — bounded, LRU-evicting per-database connection pools.
//!
//! Modules:
//! - **manager**: `LruPoolManager`, at most `max_db` pools with LRU eviction of non-persistent pools
//! - **pool**: `ConnectionPool` / `PoolFactory` traits and the semaphore-bounded default pool
//! - **session**: `Session` / `ConnectionFactory` traits and the per-connection configurator
//! - **args**: Connection argument template and per-database parameters
//! - **token**: Cached managed-authentication tokens used as passwords
//! - **text**: SQL_ASCII text decoding fallback
//! - **comment**: Query attribution comments
//! - **config**: poolkeeper.toml parsing

pub mod args;
pub mod comment;
pub mod config;
pub mod error;
pub mod manager;
pub mod pool;
pub mod session;
pub mod text;
pub mod token;

pub use args::{ConnectParams, ConnectionArgs, SslMode};
pub use config::{AuthConfig, ManagerConfig, PoolkeeperConfig};
pub use error::{PoolError, PoolResult};
pub use manager::{LruPoolManager, ManagedPoolStats, PooledConnection};
pub use pool::{
    BoundedPool, BoundedPoolFactory, ConnectionPool, PoolFactory, PoolRequest, PoolSettings, PoolStats,
};
pub use session::{ConnectionConfigurator, ConnectionFactory, Session, SessionConfigurator, Value};
pub use token::{Token, TokenProvider, TokenSource};
