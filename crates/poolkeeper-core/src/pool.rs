//! Per-database connection pools.
//!
//! The manager only needs a pool to check sessions out, take them back,
//! report counters and close. That surface is the [`ConnectionPool`] trait;
//! pools are created through a [`PoolFactory`].
//! [`BoundedPool`] is the default implementation: sessions are opened
//! lazily through a [`ConnectionFactory`], configured once, reused LIFO, and
//! bounded by a semaphore.
//!
//! # Checkout flow
//!
//! ```text
//! acquire()
//!   → wait (up to acquire_timeout) for a semaphore permit
//!     → idle session younger than max_idle → reuse
//!     → no usable idle session → connect + configure → hand out
//! release(session)
//!   → healthy and pool open → back to idle list
//!   → broken or pool closed → closed and dropped
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::args::ConnectParams;
use crate::error::{PoolError, PoolResult};
use crate::session::{ConnectionConfigurator, ConnectionFactory, Session};
use crate::token::TokenProvider;

/// Sizing and timing knobs for one pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    /// Connections opened eagerly (default: 0).
    pub min_size: usize,
    /// Maximum connections per pool (default: 2).
    pub max_size: usize,
    /// Idle sessions older than this are closed instead of reused (default: 600s).
    pub max_idle: Duration,
    /// Maximum time to wait for a free connection (default: 30s).
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 2,
            max_idle: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Runtime counters reported by a pool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool_min: usize,
    pub pool_max: usize,
    /// Sessions currently open (checked out + idle).
    pub pool_size: usize,
    /// Idle sessions ready for checkout.
    pub pool_available: usize,
    /// Callers currently blocked waiting for a session.
    pub requests_waiting: u64,
    pub requests_num: u64,
    pub requests_errors: u64,
    /// Sessions successfully opened over the pool's lifetime.
    pub connections_num: u64,
    pub connections_errors: u64,
    /// Sessions returned in a broken state.
    pub returns_bad: u64,
}

/// A pool of sessions to one logical database.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Check out one session, opening a new one if needed.
    async fn acquire(&self) -> PoolResult<Box<dyn Session>>;
    /// Give a checked-out session back.
    fn release(&self, session: Box<dyn Session>);
    fn stats(&self) -> PoolStats;
    /// Close every idle session and refuse further checkouts.
    fn close(&self) -> PoolResult<()>;
    fn is_closed(&self) -> bool;
}

/// Everything a [`PoolFactory`] needs to build a pool for one database.
#[derive(Clone)]
pub struct PoolRequest {
    pub dbname: String,
    pub params: ConnectParams,
    pub settings: PoolSettings,
    pub configurator: Arc<dyn ConnectionConfigurator>,
    pub token_provider: Option<Arc<TokenProvider>>,
}

/// Creates pools on demand. Must not open network connections.
pub trait PoolFactory: Send + Sync {
    fn create_pool(&self, request: PoolRequest) -> PoolResult<Arc<dyn ConnectionPool>>;
}

/// [`PoolFactory`] producing [`BoundedPool`]s over a shared connection factory.
pub struct BoundedPoolFactory {
    connector: Arc<dyn ConnectionFactory>,
}

impl BoundedPoolFactory {
    pub fn new(connector: Arc<dyn ConnectionFactory>) -> Self {
        Self { connector }
    }
}

impl PoolFactory for BoundedPoolFactory {
    fn create_pool(&self, request: PoolRequest) -> PoolResult<Arc<dyn ConnectionPool>> {
        if request.settings.max_size == 0 {
            return Err(PoolError::Config("pool max_size must be at least 1".to_string()));
        }
        Ok(Arc::new(BoundedPool::new(request, Arc::clone(&self.connector))))
    }
}

/// An idle session with the time it was returned.
#[derive(Debug)]
struct IdleSession {
    session: Box<dyn Session>,
    returned_at: Instant,
}

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<IdleSession>,
    /// Open sessions, idle and checked out.
    total: usize,
}

#[derive(Debug, Default)]
struct Counters {
    requests_waiting: AtomicU64,
    requests_num: AtomicU64,
    requests_errors: AtomicU64,
    connections_num: AtomicU64,
    connections_errors: AtomicU64,
    returns_bad: AtomicU64,
}

/// Counts one waiting caller until dropped, including when the caller's
/// future is cancelled mid-wait.
struct WaitingGuard<'a>(&'a AtomicU64);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Semaphore-bounded pool of lazily opened sessions to one database.
pub struct BoundedPool {
    dbname: String,
    params: ConnectParams,
    settings: PoolSettings,
    connector: Arc<dyn ConnectionFactory>,
    configurator: Arc<dyn ConnectionConfigurator>,
    token_provider: Option<Arc<TokenProvider>>,
    /// Permits = sessions that may still be checked out.
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    counters: Counters,
    closed: AtomicBool,
}

impl BoundedPool {
    pub fn new(request: PoolRequest, connector: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(request.settings.max_size)),
            dbname: request.dbname,
            params: request.params,
            settings: request.settings,
            connector,
            configurator: request.configurator,
            token_provider: request.token_provider,
            state: Mutex::new(PoolState::default()),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self) -> PoolError {
        PoolError::PoolClosed {
            dbname: self.dbname.clone(),
        }
    }

    /// Pop the most recently returned idle session that is still usable,
    /// closing stale or broken ones along the way.
    fn take_idle(&self) -> Option<Box<dyn Session>> {
        let mut state = self.state();
        while let Some(mut idle) = state.idle.pop() {
            let stale = idle.returned_at.elapsed() > self.settings.max_idle;
            if stale || idle.session.is_closed() {
                idle.session.close();
                state.total = state.total.saturating_sub(1);
                tracing::debug!(
                    database = %self.dbname,
                    stale = stale,
                    "discarded idle connection"
                );
                continue;
            }
            return Some(idle.session);
        }
        None
    }

    /// Open and configure a new session.
    async fn open_session(&self) -> PoolResult<Box<dyn Session>> {
        let mut params = self.params.clone();
        if let Some(provider) = &self.token_provider {
            params.password = Some(provider.get_token().await?);
        }

        let mut session = self.connector.connect(&params).await?;
        if let Err(e) = self.configurator.configure(&mut *session).await {
            session.close();
            return Err(e);
        }
        Ok(session)
    }
}

#[async_trait]
impl ConnectionPool for BoundedPool {
    async fn acquire(&self) -> PoolResult<Box<dyn Session>> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.counters.requests_num.fetch_add(1, Ordering::Relaxed);

        let waited = {
            let _waiting = WaitingGuard::enter(&self.counters.requests_waiting);
            tokio::time::timeout(
                self.settings.acquire_timeout,
                Arc::clone(&self.semaphore).acquire_owned(),
            )
            .await
        };

        let permit = match waited {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                // Semaphore closed by close().
                self.counters.requests_errors.fetch_add(1, Ordering::Relaxed);
                return Err(self.closed_error());
            }
            Err(_) => {
                self.counters.requests_errors.fetch_add(1, Ordering::Relaxed);
                return Err(PoolError::Timeout {
                    dbname: self.dbname.clone(),
                    timeout: self.settings.acquire_timeout,
                });
            }
        };

        if let Some(session) = self.take_idle() {
            tracing::debug!(database = %self.dbname, "reused idle connection from pool");
            // The permit stays acquired while the session is checked out.
            permit.forget();
            return Ok(session);
        }

        let mut session = match self.open_session().await {
            Ok(session) => session,
            Err(e) => {
                self.counters.connections_errors.fetch_add(1, Ordering::Relaxed);
                self.counters.requests_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        self.counters.connections_num.fetch_add(1, Ordering::Relaxed);

        if self.is_closed() {
            session.close();
            return Err(self.closed_error());
        }

        let total = {
            let mut state = self.state();
            state.total += 1;
            state.total
        };
        tracing::debug!(
            database = %self.dbname,
            pool_size = total,
            "opened new connection"
        );
        permit.forget();
        Ok(session)
    }

    fn release(&self, mut session: Box<dyn Session>) {
        let closed = self.is_closed();
        {
            let mut state = self.state();
            let broken = session.is_closed();
            if broken {
                self.counters.returns_bad.fetch_add(1, Ordering::Relaxed);
            }
            if closed || broken || state.total > self.settings.max_size {
                session.close();
                state.total = state.total.saturating_sub(1);
                tracing::debug!(
                    database = %self.dbname,
                    broken = broken,
                    pool_closed = closed,
                    "closed connection on release"
                );
            } else {
                state.idle.push(IdleSession {
                    session,
                    returned_at: Instant::now(),
                });
            }
        }
        self.semaphore.add_permits(1);
    }

    fn stats(&self) -> PoolStats {
        let (pool_size, pool_available) = {
            let state = self.state();
            (state.total, state.idle.len())
        };
        PoolStats {
            pool_min: self.settings.min_size,
            pool_max: self.settings.max_size,
            pool_size,
            pool_available,
            requests_waiting: self.counters.requests_waiting.load(Ordering::Relaxed),
            requests_num: self.counters.requests_num.load(Ordering::Relaxed),
            requests_errors: self.counters.requests_errors.load(Ordering::Relaxed),
            connections_num: self.counters.connections_num.load(Ordering::Relaxed),
            connections_errors: self.counters.connections_errors.load(Ordering::Relaxed),
            returns_bad: self.counters.returns_bad.load(Ordering::Relaxed),
        }
    }

    fn close(&self) -> PoolResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.semaphore.close();

        let mut state = self.state();
        let idle_count = state.idle.len();
        for mut idle in state.idle.drain(..) {
            idle.session.close();
        }
        state.total = state.total.saturating_sub(idle_count);
        tracing::debug!(
            database = %self.dbname,
            closed = idle_count,
            checked_out = state.total,
            "closed connection pool"
        );
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for BoundedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedPool")
            .field("dbname", &self.dbname)
            .field("settings", &self.settings)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::args::ConnectionArgs;
    use crate::comment::QueryCommenter;
    use crate::session::{SessionConfigurator, Value};
    use crate::text::TextDecoder;
    use crate::token::{Token, TokenSource};

    // ── Mock session and connector ───────────────────────────────────

    #[derive(Debug)]
    struct MockSession {
        id: usize,
        password: Option<String>,
        broken: Arc<AtomicBool>,
        closes: Arc<AtomicUsize>,
        executed: Vec<String>,
    }

    #[async_trait]
    impl Session for MockSession {
        fn server_encoding(&self) -> &str {
            "UTF8"
        }

        fn set_autocommit(&mut self, _enabled: bool) -> PoolResult<()> {
            Ok(())
        }

        fn set_text_decoder(&mut self, _decoder: TextDecoder) {}

        fn set_commenter(&mut self, _commenter: QueryCommenter) {}

        async fn execute(&mut self, sql: &str) -> PoolResult<u64> {
            self.executed.push(sql.to_string());
            Ok(0)
        }

        async fn query(&mut self, _sql: &str) -> PoolResult<Vec<Vec<Value>>> {
            Ok(vec![vec![Value::Int(self.id as i64)]])
        }

        fn is_closed(&self) -> bool {
            self.broken.load(Ordering::SeqCst)
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockConnector {
        connects: AtomicUsize,
        closes: Arc<AtomicUsize>,
        broken: Arc<AtomicBool>,
        should_fail: AtomicBool,
    }

    impl MockConnector {
        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConnectionFactory for MockConnector {
        async fn connect(&self, params: &ConnectParams) -> PoolResult<Box<dyn Session>> {
            if self.should_fail.load(Ordering::SeqCst) {
                return Err(PoolError::Connect("connection refused".to_string()));
            }
            let id = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Box::new(MockSession {
                id,
                password: params.password.clone(),
                broken: Arc::clone(&self.broken),
                closes: Arc::clone(&self.closes),
                executed: vec![],
            }))
        }
    }

    struct FailingConfigurator;

    #[async_trait]
    impl ConnectionConfigurator for FailingConfigurator {
        async fn configure(&self, _session: &mut dyn Session) -> PoolResult<()> {
            Err(PoolError::Query("statement_timeout rejected".to_string()))
        }
    }

    fn test_settings() -> PoolSettings {
        PoolSettings {
            min_size: 0,
            max_size: 2,
            max_idle: Duration::from_secs(300),
            acquire_timeout: Duration::from_millis(50),
        }
    }

    fn request(settings: PoolSettings) -> PoolRequest {
        PoolRequest {
            dbname: "orders".to_string(),
            params: ConnectionArgs::new("test", "app").params("orders"),
            settings,
            configurator: Arc::new(SessionConfigurator::new(QueryCommenter::new("test"))),
            token_provider: None,
        }
    }

    fn make_pool(settings: PoolSettings) -> (BoundedPool, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::default());
        let pool = BoundedPool::new(request(settings), connector.clone());
        (pool, connector)
    }

    // ── Creation ─────────────────────────────────────────────────────

    #[test]
    fn settings_defaults() {
        let settings = PoolSettings::default();
        assert_eq!(settings.min_size, 0);
        assert_eq!(settings.max_size, 2);
        assert_eq!(settings.max_idle, Duration::from_secs(600));
        assert_eq!(settings.acquire_timeout, Duration::from_secs(30));
    }

    #[test]
    fn creating_pool_opens_nothing() {
        let (pool, connector) = make_pool(test_settings());
        assert_eq!(connector.connects(), 0);
        assert_eq!(pool.stats().pool_size, 0);
    }

    #[test]
    fn factory_rejects_zero_max_size() {
        let factory = BoundedPoolFactory::new(Arc::new(MockConnector::default()));
        let settings = PoolSettings {
            max_size: 0,
            ..test_settings()
        };
        assert!(matches!(
            factory.create_pool(request(settings)),
            Err(PoolError::Config(_))
        ));
    }

    // ── Acquire / release ────────────────────────────────────────────

    #[tokio::test]
    async fn acquire_opens_and_configures() {
        let (pool, connector) = make_pool(test_settings());
        let session = pool.acquire().await.unwrap();
        assert_eq!(connector.connects(), 1);

        let stats = pool.stats();
        assert_eq!(stats.pool_size, 1);
        assert_eq!(stats.pool_available, 0);
        assert_eq!(stats.connections_num, 1);
        assert_eq!(stats.requests_num, 1);
        pool.release(session);
    }

    #[tokio::test]
    async fn released_session_is_reused() {
        let (pool, connector) = make_pool(test_settings());
        let session = pool.acquire().await.unwrap();
        pool.release(session);
        assert_eq!(pool.stats().pool_available, 1);

        let session = pool.acquire().await.unwrap();
        assert_eq!(connector.connects(), 1);
        pool.release(session);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let (pool, _) = make_pool(test_settings());
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout { .. }));
        assert_eq!(pool.stats().requests_errors, 1);
        assert_eq!(pool.stats().requests_waiting, 0);

        pool.release(a);
        pool.release(b);
    }

    #[tokio::test]
    async fn release_frees_slot_for_waiter() {
        let settings = PoolSettings {
            max_size: 1,
            acquire_timeout: Duration::from_secs(5),
            ..test_settings()
        };
        let (pool, connector) = make_pool(settings);
        let pool = Arc::new(pool);

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(|s| pool.release(s)) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().requests_waiting, 1);
        pool.release(held);

        waiter.await.unwrap().unwrap();
        assert_eq!(connector.connects(), 1, "waiter reused the released session");
    }

    #[tokio::test]
    async fn cancelled_waiters_are_not_counted() {
        let settings = PoolSettings {
            max_size: 1,
            acquire_timeout: Duration::from_secs(5),
            ..test_settings()
        };
        let (pool, _) = make_pool(settings);
        let held = pool.acquire().await.unwrap();

        for _ in 0..3 {
            let res = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
            assert!(res.is_err(), "caller gave up before a slot freed");
        }
        assert_eq!(pool.stats().requests_waiting, 0);

        pool.release(held);
        let session = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().requests_waiting, 0);
        pool.release(session);
    }

    #[tokio::test]
    async fn broken_session_discarded_on_release() {
        let (pool, connector) = make_pool(test_settings());
        let session = pool.acquire().await.unwrap();
        connector.broken.store(true, Ordering::SeqCst);
        pool.release(session);

        let stats = pool.stats();
        assert_eq!(stats.returns_bad, 1);
        assert_eq!(stats.pool_size, 0);
        assert_eq!(connector.closes(), 1);
    }

    #[tokio::test]
    async fn stale_idle_session_is_replaced() {
        let settings = PoolSettings {
            max_idle: Duration::from_millis(1),
            ..test_settings()
        };
        let (pool, connector) = make_pool(settings);
        let session = pool.acquire().await.unwrap();
        pool.release(session);

        tokio::time::sleep(Duration::from_millis(10)).await;

        let session = pool.acquire().await.unwrap();
        assert_eq!(connector.connects(), 2);
        assert_eq!(connector.closes(), 1);
        assert_eq!(pool.stats().pool_size, 1);
        pool.release(session);
    }

    #[tokio::test]
    async fn connect_failure_propagates_and_frees_permit() {
        let settings = PoolSettings {
            max_size: 1,
            ..test_settings()
        };
        let (pool, connector) = make_pool(settings);
        connector.should_fail.store(true, Ordering::SeqCst);

        let err = pool.acquire().await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(pool.stats().connections_errors, 1);

        connector.should_fail.store(false, Ordering::SeqCst);
        let session = pool.acquire().await.unwrap();
        pool.release(session);
    }

    #[tokio::test]
    async fn configure_failure_closes_session() {
        let connector = Arc::new(MockConnector::default());
        let req = PoolRequest {
            configurator: Arc::new(FailingConfigurator),
            ..request(test_settings())
        };
        let pool = BoundedPool::new(req, connector.clone());

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Query(_)));
        assert_eq!(connector.closes(), 1);
        assert_eq!(pool.stats().pool_size, 0);
    }

    #[tokio::test]
    async fn statement_timeout_applied_once_per_session() {
        let connector = Arc::new(MockConnector::default());
        let configurator = SessionConfigurator::new(QueryCommenter::new("test"))
            .with_statement_timeout(Some(Duration::from_secs(5)));
        let req = PoolRequest {
            configurator: Arc::new(configurator),
            ..request(test_settings())
        };
        let pool = BoundedPool::new(req, connector.clone());

        let session = pool.acquire().await.unwrap();
        pool.release(session);
        let session = pool.acquire().await.unwrap();
        let rendered = format!("{session:?}");
        assert_eq!(rendered.matches("SET statement_timeout = 5000").count(), 1);
        pool.release(session);
    }

    #[tokio::test]
    async fn token_provider_supplies_password() {
        struct FixedSource;
        #[async_trait]
        impl TokenSource for FixedSource {
            async fn fetch_token(&self) -> PoolResult<Token> {
                Ok(Token::with_ttl("iam-token", Duration::from_secs(900)))
            }
        }

        let connector = Arc::new(MockConnector::default());
        let req = PoolRequest {
            token_provider: Some(Arc::new(TokenProvider::new(Box::new(FixedSource)))),
            ..request(test_settings())
        };
        let pool = BoundedPool::new(req, connector.clone());

        let session = pool.acquire().await.unwrap();
        assert!(format!("{session:?}").contains("iam-token"));
        pool.release(session);
    }

    // ── Close ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn close_closes_idle_and_rejects_acquire() {
        let (pool, connector) = make_pool(test_settings());
        let session = pool.acquire().await.unwrap();
        pool.release(session);

        pool.close().unwrap();
        assert!(pool.is_closed());
        assert_eq!(connector.closes(), 1);
        assert_eq!(pool.stats().pool_size, 0);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::PoolClosed { .. }));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (pool, connector) = make_pool(test_settings());
        let session = pool.acquire().await.unwrap();
        pool.release(session);

        pool.close().unwrap();
        pool.close().unwrap();
        assert_eq!(connector.closes(), 1, "idle session closed exactly once");
    }

    #[tokio::test]
    async fn session_returned_after_close_is_closed() {
        let (pool, connector) = make_pool(test_settings());
        let session = pool.acquire().await.unwrap();

        pool.close().unwrap();
        pool.release(session);

        assert_eq!(connector.closes(), 1);
        assert_eq!(pool.stats().pool_size, 0);
    }
}
