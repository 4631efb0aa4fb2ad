//! poolkeeper-pg — PostgreSQL sessions for poolkeeper pools.
//!
//! [`PgConnectionFactory`] turns [`ConnectParams`] into a
//! `tokio_postgres::Config`, connects (over TLS unless `sslmode=disable`),
//! spawns the connection driver on the ambient tokio runtime and reads the
//! server encoding so the configurator can decide whether the text decoding
//! fallback is needed.

pub mod auth;
mod session;
mod tls;

use std::time::Duration;

use async_trait::async_trait;
use poolkeeper_core::{ConnectParams, ConnectionFactory, PoolError, PoolResult, Session, SslMode};
use tokio_postgres::{Client, NoTls};

pub use auth::{AwsRdsTokenSource, AzureTokenSource, token_provider};
pub use session::PgSession;

/// Default time allowed for TCP connect plus startup handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Host used when the connection arguments carry none.
const DEFAULT_HOST: &str = "localhost";

/// Opens [`PgSession`]s with `tokio-postgres`.
#[derive(Debug, Clone)]
pub struct PgConnectionFactory {
    connect_timeout: Duration,
}

impl Default for PgConnectionFactory {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl PgConnectionFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

/// Map libpq `sslmode` onto the three modes tokio-postgres knows about.
fn pg_ssl_mode(mode: SslMode) -> tokio_postgres::config::SslMode {
    match mode {
        SslMode::Disable => tokio_postgres::config::SslMode::Disable,
        SslMode::Allow | SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
        SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
            tokio_postgres::config::SslMode::Require
        }
    }
}

fn pg_config(params: &ConnectParams, connect_timeout: Duration) -> tokio_postgres::Config {
    let mut config = tokio_postgres::Config::new();
    config
        .application_name(&params.application_name)
        .user(&params.user)
        .host(params.host.as_deref().unwrap_or(DEFAULT_HOST))
        .ssl_mode(pg_ssl_mode(params.sslmode))
        .connect_timeout(connect_timeout);

    // An empty dbname defaults to the user name server-side.
    if !params.dbname.is_empty() {
        config.dbname(&params.dbname);
    }
    if let Some(port) = params.port {
        config.port(port);
    }
    if let Some(password) = &params.password {
        config.password(password);
    }
    config
}

fn connect_error(params: &ConnectParams, e: tokio_postgres::Error) -> PoolError {
    PoolError::Connect(format!(
        "{}@{}/{}: {e}",
        params.user,
        params.host.as_deref().unwrap_or(DEFAULT_HOST),
        params.dbname
    ))
}

async fn read_server_encoding(client: &Client) -> PoolResult<String> {
    let row = client
        .query_one("SHOW server_encoding", &[])
        .await
        .map_err(|e| PoolError::Query(format!("reading server_encoding: {e}")))?;
    row.try_get::<_, String>(0)
        .map_err(|e| PoolError::Query(format!("reading server_encoding: {e}")))
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, params: &ConnectParams) -> PoolResult<Box<dyn Session>> {
        let config = pg_config(params, self.connect_timeout);
        let dbname = params.dbname.clone();

        let client = if params.sslmode == SslMode::Disable {
            let (client, connection) = config
                .connect(NoTls)
                .await
                .map_err(|e| connect_error(params, e))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!(database = %dbname, error = %e, "postgres connection error");
                }
            });
            client
        } else {
            let tls = tls::connector(params)?;
            let (client, connection) = config
                .connect(tls)
                .await
                .map_err(|e| connect_error(params, e))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!(database = %dbname, error = %e, "postgres connection error");
                }
            });
            client
        };

        let server_encoding = read_server_encoding(&client).await?;
        tracing::debug!(
            database = %params.dbname,
            host = ?params.host,
            sslmode = %params.sslmode,
            server_encoding = %server_encoding,
            "opened postgres connection"
        );
        Ok(Box::new(PgSession::new(client, &params.dbname, server_encoding)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolkeeper_core::ConnectionArgs;
    use tokio_postgres::config::Host;

    fn args() -> ConnectionArgs {
        ConnectionArgs::new("poolkeeper-test", "monitor")
            .with_address("db.internal", 5433)
            .with_password("hunter2")
    }

    #[test]
    fn config_carries_connection_params() {
        let config = pg_config(&args().params("orders"), Duration::from_secs(3));

        assert_eq!(config.get_application_name(), Some("poolkeeper-test"));
        assert_eq!(config.get_user(), Some("monitor"));
        assert_eq!(config.get_dbname(), Some("orders"));
        assert_eq!(config.get_hosts(), &[Host::Tcp("db.internal".to_string())]);
        assert_eq!(config.get_ports(), &[5433]);
        assert_eq!(config.get_password(), Some(&b"hunter2"[..]));
        assert_eq!(config.get_connect_timeout(), Some(&Duration::from_secs(3)));
    }

    #[test]
    fn missing_host_defaults_to_localhost() {
        let params = ConnectionArgs::new("poolkeeper-test", "monitor").params("orders");
        let config = pg_config(&params, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.get_hosts(), &[Host::Tcp("localhost".to_string())]);
        assert!(config.get_ports().is_empty());
        assert!(config.get_password().is_none());
    }

    #[test]
    fn empty_dbname_is_left_to_server() {
        let config = pg_config(&args().params(""), DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.get_dbname(), None);
    }

    #[test]
    fn ssl_modes_map_onto_driver_modes() {
        use tokio_postgres::config::SslMode as PgSslMode;

        assert_eq!(pg_ssl_mode(SslMode::Disable), PgSslMode::Disable);
        assert_eq!(pg_ssl_mode(SslMode::Allow), PgSslMode::Prefer);
        assert_eq!(pg_ssl_mode(SslMode::Prefer), PgSslMode::Prefer);
        assert_eq!(pg_ssl_mode(SslMode::Require), PgSslMode::Require);
        assert_eq!(pg_ssl_mode(SslMode::VerifyFull), PgSslMode::Require);
    }

    #[test]
    fn factory_default_timeout() {
        assert_eq!(
            PgConnectionFactory::default().connect_timeout(),
            DEFAULT_CONNECT_TIMEOUT
        );
    }

    #[tokio::test]
    async fn unreachable_server_is_connect_error() {
        let factory = PgConnectionFactory::new(Duration::from_millis(500));
        let params = ConnectionArgs::new("poolkeeper-test", "monitor")
            .with_address("127.0.0.1", 1)
            .with_ssl_mode(SslMode::Disable)
            .params("orders");

        let err = factory.connect(&params).await.unwrap_err();
        assert!(matches!(err, PoolError::Connect(_)), "got {err:?}");
    }
}
