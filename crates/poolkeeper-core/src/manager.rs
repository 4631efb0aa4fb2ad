//! LRU-evicting manager of per-database connection pools.
//!
//! `LruPoolManager` keeps at most `max_db` pools open, one per logical
//! database name. When a new database is requested at capacity, the least
//! recently used non-persistent pool is closed to make room; only when every
//! pool is persistent is the true least recently used one evicted instead.
//!
//! All bookkeeping (lookup, insert, evict, recency update) happens under a
//! single mutex. The mutex is released before a session is checked out, so
//! a caller waiting on a saturated pool never blocks callers of other
//! databases.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::args::ConnectionArgs;
use crate::comment::QueryCommenter;
use crate::config::ManagerConfig;
use crate::error::{PoolError, PoolResult};
use crate::pool::{ConnectionPool, PoolFactory, PoolRequest, PoolSettings, PoolStats};
use crate::session::{ConnectionConfigurator, Session, SessionConfigurator};
use crate::token::TokenProvider;

/// Upper bound on connections per pool; many databases may be open at once.
pub const MAX_CONNECTIONS_PER_POOL: usize = 2;

/// Pool counters plus the manager's own bookkeeping for one database.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedPoolStats {
    #[serde(flatten)]
    pub pool: PoolStats,
    /// Time of the last `get_connection`, relative to manager creation.
    pub last_used: Duration,
    pub persistent: bool,
}

struct PoolEntry {
    pool: Arc<dyn ConnectionPool>,
    last_used: Instant,
    persistent: bool,
    /// Access sequence number; lower means less recently used.
    seq: u64,
}

#[derive(Default)]
struct ManagerState {
    entries: HashMap<String, PoolEntry>,
    closed: bool,
    next_seq: u64,
}

impl ManagerState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Name of the entry to evict: the oldest non-persistent one, else the
    /// oldest overall.
    fn eviction_candidate(&self) -> Option<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.persistent)
            .min_by_key(|(_, entry)| entry.seq)
            .or_else(|| self.entries.iter().min_by_key(|(_, entry)| entry.seq))
            .map(|(name, _)| name.clone())
    }
}

/// Bounded, thread-safe cache of connection pools keyed by database name.
pub struct LruPoolManager {
    args: ConnectionArgs,
    max_db: usize,
    settings: PoolSettings,
    factory: Arc<dyn PoolFactory>,
    configurator: Arc<dyn ConnectionConfigurator>,
    token_provider: Option<Arc<TokenProvider>>,
    state: Mutex<ManagerState>,
    /// Reference point for reported `last_used` values.
    epoch: Instant,
}

impl LruPoolManager {
    /// Create a manager. Opens no connections.
    ///
    /// Pool settings are clamped: `min_size` is always 0 so idle pools cost
    /// nothing, and `max_size` never exceeds [`MAX_CONNECTIONS_PER_POOL`].
    pub fn new(
        args: ConnectionArgs,
        config: ManagerConfig,
        factory: Arc<dyn PoolFactory>,
    ) -> PoolResult<Self> {
        if config.max_db == 0 {
            return Err(PoolError::Config("max_db must be at least 1".to_string()));
        }

        let configurator = SessionConfigurator::new(QueryCommenter::new(&args.application_name))
            .with_statement_timeout(config.statement_timeout())
            .with_text_decoder(config.text_decoder()?);

        let requested = config.pool.to_settings();
        let settings = PoolSettings {
            min_size: 0,
            max_size: requested.max_size.clamp(1, MAX_CONNECTIONS_PER_POOL),
            ..requested
        };

        Ok(Self {
            args,
            max_db: config.max_db,
            settings,
            factory,
            configurator: Arc::new(configurator),
            token_provider: None,
            state: Mutex::new(ManagerState::default()),
            epoch: Instant::now(),
        })
    }

    /// Builder method: replace the per-connection configurator.
    pub fn with_configurator(self, configurator: Arc<dyn ConnectionConfigurator>) -> Self {
        Self {
            configurator,
            ..self
        }
    }

    /// Builder method: authenticate new connections with managed tokens.
    pub fn with_token_provider(self, token_provider: Arc<TokenProvider>) -> Self {
        Self {
            token_provider: Some(token_provider),
            ..self
        }
    }

    pub fn max_db(&self) -> usize {
        self.max_db
    }

    /// Effective per-pool settings after clamping.
    pub fn pool_settings(&self) -> &PoolSettings {
        &self.settings
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check out a connection to `dbname`, creating its pool if needed.
    ///
    /// Marks the pool most recently used. A `persistent` request protects
    /// the pool from eviction for the rest of its lifetime. The returned
    /// guard gives the session back to its pool when dropped.
    pub async fn get_connection(
        &self,
        dbname: &str,
        persistent: bool,
    ) -> PoolResult<PooledConnection> {
        let pool = self.pool_for(dbname, persistent)?;
        let session = pool.acquire().await?;
        Ok(PooledConnection {
            dbname: dbname.to_string(),
            pool,
            session: Some(session),
        })
    }

    /// Look up or create the pool for `dbname`, updating recency.
    fn pool_for(&self, dbname: &str, persistent: bool) -> PoolResult<Arc<dyn ConnectionPool>> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(PoolError::ManagerClosed);
        }

        let seq = state.next_seq();
        let stale = match state.entries.get_mut(dbname) {
            Some(entry) if !entry.pool.is_closed() => {
                entry.last_used = Instant::now();
                entry.persistent |= persistent;
                entry.seq = seq;
                return Ok(Arc::clone(&entry.pool));
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            state.entries.remove(dbname);
            tracing::debug!(database = %dbname, "dropping closed connection pool");
        }

        if state.entries.len() >= self.max_db {
            self.evict_one(&mut state);
        }

        let pool = self.factory.create_pool(PoolRequest {
            dbname: dbname.to_string(),
            params: self.args.params(dbname),
            settings: self.settings.clone(),
            configurator: Arc::clone(&self.configurator),
            token_provider: self.token_provider.clone(),
        })?;

        state.entries.insert(
            dbname.to_string(),
            PoolEntry {
                pool: Arc::clone(&pool),
                last_used: Instant::now(),
                persistent,
                seq,
            },
        );
        tracing::debug!(
            database = %dbname,
            persistent = persistent,
            open_pools = state.entries.len(),
            "created connection pool"
        );
        Ok(pool)
    }

    /// Close and remove one pool. Called with the state lock held.
    fn evict_one(&self, state: &mut ManagerState) {
        let Some(name) = state.eviction_candidate() else {
            return;
        };
        let Some(entry) = state.entries.remove(&name) else {
            return;
        };

        tracing::info!(
            database = %name,
            persistent = entry.persistent,
            max_db = self.max_db,
            "evicting least recently used connection pool"
        );
        if let Err(e) = entry.pool.close() {
            tracing::warn!(
                database = %name,
                error = %e,
                "failed to close evicted connection pool"
            );
        }
    }

    /// Pool counters and bookkeeping for `dbname`, or `None` if it has no
    /// pool. Does not count as a use.
    pub fn get_pool_stats(&self, dbname: &str) -> Option<ManagedPoolStats> {
        let state = self.lock_state();
        state.entries.get(dbname).map(|entry| ManagedPoolStats {
            pool: entry.pool.stats(),
            last_used: entry.last_used.duration_since(self.epoch),
            persistent: entry.persistent,
        })
    }

    /// Close every pool and refuse further `get_connection` calls.
    pub fn close_all(&self) {
        let mut state = self.lock_state();
        if state.closed {
            return;
        }
        state.closed = true;

        let count = state.entries.len();
        for (name, entry) in state.entries.drain() {
            if let Err(e) = entry.pool.close() {
                tracing::warn!(database = %name, error = %e, "failed to close connection pool");
            }
        }
        tracing::info!(closed = count, "closed all connection pools");
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Number of open pools.
    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Database names with an open pool, least recently used first.
    pub fn dbnames(&self) -> Vec<String> {
        let state = self.lock_state();
        let mut entries: Vec<_> = state.entries.iter().collect();
        entries.sort_by_key(|(_, entry)| entry.seq);
        entries.into_iter().map(|(name, _)| name.clone()).collect()
    }
}

impl std::fmt::Debug for LruPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruPoolManager")
            .field("max_db", &self.max_db)
            .field("settings", &self.settings)
            .field("open_pools", &self.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// A checked-out session that returns to its pool when dropped.
pub struct PooledConnection {
    dbname: String,
    pool: Arc<dyn ConnectionPool>,
    /// Always `Some` until drop.
    session: Option<Box<dyn Session>>,
}

impl PooledConnection {
    pub fn dbname(&self) -> &str {
        &self.dbname
    }
}

impl Deref for PooledConnection {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.session
            .as_deref()
            .expect("session is present until the guard is dropped")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
            .as_deref_mut()
            .expect("session is present until the guard is dropped")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("dbname", &self.dbname)
            .field("session", &self.session)
            .finish()
    }
}
