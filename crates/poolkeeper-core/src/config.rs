//! poolkeeper.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::args::{ConnectionArgs, SslMode};
use crate::error::{PoolError, PoolResult};
use crate::pool::PoolSettings;
use crate::text::TextDecoder;
use crate::token::DEFAULT_TOKEN_SKEW;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolkeeperConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_application_name")]
    pub application_name: String,
    #[serde(default)]
    pub username: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub password: Option<String>,
    /// Database used when no explicit one is requested.
    #[serde(default = "default_dbname")]
    pub dbname: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
    pub ssl_cert: Option<String>,
    pub ssl_root_cert: Option<String>,
    pub ssl_key: Option<String>,
    pub ssl_password: Option<String>,
    /// Managed authentication; the fetched token replaces `password`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
}

/// Where short-lived database passwords come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum AuthConfig {
    /// AWS RDS IAM authentication, signed with credentials from the environment.
    Aws {
        region: String,
        #[serde(default = "default_token_skew_secs")]
        skew_secs: u64,
    },
    /// Azure managed identity, fetched from the instance metadata service.
    Azure {
        client_id: Option<String>,
        identity_scope: Option<String>,
        #[serde(default = "default_token_skew_secs")]
        skew_secs: u64,
    },
}

impl AuthConfig {
    /// Refresh margin before token expiry.
    pub fn skew(&self) -> Duration {
        match self {
            AuthConfig::Aws { skew_secs, .. } | AuthConfig::Azure { skew_secs, .. } => {
                Duration::from_secs(*skew_secs)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Maximum number of simultaneously open pools.
    #[serde(default = "default_max_db")]
    pub max_db: usize,
    pub statement_timeout_ms: Option<u64>,
    /// Encodings tried, in order, when the server reports SQL_ASCII.
    pub sqlascii_encodings: Option<Vec<String>>,
    #[serde(default)]
    pub pool: PoolSettingsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettingsConfig {
    #[serde(default)]
    pub min_size: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_application_name() -> String {
    "poolkeeper".to_string()
}

fn default_dbname() -> String {
    "postgres".to_string()
}

fn default_token_skew_secs() -> u64 {
    DEFAULT_TOKEN_SKEW.as_secs()
}

fn default_max_db() -> usize {
    30
}

fn default_max_size() -> usize {
    2
}

fn default_max_idle_secs() -> u64 {
    600
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            application_name: default_application_name(),
            username: String::new(),
            host: None,
            port: None,
            password: None,
            dbname: default_dbname(),
            ssl_mode: SslMode::default(),
            ssl_cert: None,
            ssl_root_cert: None,
            ssl_key: None,
            ssl_password: None,
            auth: None,
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("application_name", &self.application_name)
            .field("username", &self.username)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("dbname", &self.dbname)
            .field("ssl_mode", &self.ssl_mode)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl ConnectionConfig {
    /// The connection arguments template shared by every pool.
    pub fn to_args(&self) -> ConnectionArgs {
        ConnectionArgs {
            application_name: self.application_name.clone(),
            username: self.username.clone(),
            host: self.host.clone(),
            port: self.port,
            password: self.password.clone(),
            ssl_mode: self.ssl_mode,
            ssl_cert: self.ssl_cert.clone(),
            ssl_root_cert: self.ssl_root_cert.clone(),
            ssl_key: self.ssl_key.clone(),
            ssl_password: self.ssl_password.clone(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_db: default_max_db(),
            statement_timeout_ms: None,
            sqlascii_encodings: None,
            pool: PoolSettingsConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_ms.map(Duration::from_millis)
    }

    pub fn text_decoder(&self) -> PoolResult<TextDecoder> {
        TextDecoder::from_names(self.sqlascii_encodings.as_deref())
    }

    /// Builder method: set the pool cap.
    pub fn with_max_db(self, max_db: usize) -> Self {
        Self { max_db, ..self }
    }

    /// Builder method: set the statement timeout in milliseconds.
    pub fn with_statement_timeout_ms(self, statement_timeout_ms: Option<u64>) -> Self {
        Self {
            statement_timeout_ms,
            ..self
        }
    }
}

impl Default for PoolSettingsConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: default_max_size(),
            max_idle_secs: default_max_idle_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl PoolSettingsConfig {
    pub fn to_settings(&self) -> PoolSettings {
        PoolSettings {
            min_size: self.min_size,
            max_size: self.max_size,
            max_idle: Duration::from_secs(self.max_idle_secs),
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
        }
    }
}

impl PoolkeeperConfig {
    pub fn from_file(path: &Path) -> PoolResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PoolError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> PoolResult<Self> {
        let config: PoolkeeperConfig =
            toml::from_str(content).map_err(|e| PoolError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> PoolResult<String> {
        toml::to_string_pretty(self).map_err(|e| PoolError::Config(e.to_string()))
    }

    pub fn validate(&self) -> PoolResult<()> {
        if self.manager.max_db == 0 {
            return Err(PoolError::Config("manager.max_db must be at least 1".to_string()));
        }
        if self.manager.pool.max_size == 0 {
            return Err(PoolError::Config(
                "manager.pool.max_size must be at least 1".to_string(),
            ));
        }
        if !self.connection.application_name.is_ascii() {
            return Err(PoolError::Config(
                "connection.application_name must contain only ASCII characters".to_string(),
            ));
        }
        if self.connection.ssl_password.as_deref().is_some_and(|p| !p.is_empty()) {
            return Err(PoolError::Config(
                "connection.ssl_password is not supported; use an unencrypted PKCS#8 client key"
                    .to_string(),
            ));
        }
        if let Some(AuthConfig::Aws { region, .. }) = &self.connection.auth {
            if region.is_empty() {
                return Err(PoolError::Config(
                    "connection.auth.region is required for aws".to_string(),
                ));
            }
            if self.connection.host.as_deref().is_none_or(str::is_empty) {
                return Err(PoolError::Config(
                    "connection.host is required for aws authentication".to_string(),
                ));
            }
        }
        self.manager.text_decoder()?;
        Ok(())
    }
}
