//! Connection arguments shared by every per-database pool.
//!
//! A [`ConnectionArgs`] template is built once per check configuration and
//! stamped with a database name via [`ConnectionArgs::params`] each time the
//! manager needs a new pool.

use std::fmt;

use serde::{Deserialize, Serialize};

/// libpq-compatible `sslmode` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    /// Try plaintext first, TLS if the server demands it (default).
    #[default]
    Allow,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Allow => "allow",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable connection template: everything except the database name.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ConnectionArgs {
    pub application_name: String,
    pub username: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub password: Option<String>,
    pub ssl_mode: SslMode,
    pub ssl_cert: Option<String>,
    pub ssl_root_cert: Option<String>,
    pub ssl_key: Option<String>,
    pub ssl_password: Option<String>,
}

impl ConnectionArgs {
    pub fn new(application_name: &str, username: &str) -> Self {
        Self {
            application_name: application_name.to_string(),
            username: username.to_string(),
            ..Self::default()
        }
    }

    /// Builder method: set host and port.
    pub fn with_address(self, host: &str, port: u16) -> Self {
        Self {
            host: Some(host.to_string()),
            port: Some(port),
            ..self
        }
    }

    /// Builder method: set the password.
    pub fn with_password(self, password: &str) -> Self {
        Self {
            password: Some(password.to_string()),
            ..self
        }
    }

    /// Builder method: set the TLS mode.
    pub fn with_ssl_mode(self, ssl_mode: SslMode) -> Self {
        Self { ssl_mode, ..self }
    }

    /// Connection parameters for `dbname`.
    ///
    /// Optional fields that are unset or empty are left out entirely so the
    /// driver falls back to its own defaults (e.g. a Unix socket when no host
    /// is given). An empty `dbname` is passed through as-is.
    pub fn params(&self, dbname: &str) -> ConnectParams {
        ConnectParams {
            application_name: self.application_name.clone(),
            user: self.username.clone(),
            dbname: dbname.to_string(),
            sslmode: self.ssl_mode,
            host: non_empty(&self.host),
            port: self.port.filter(|p| *p != 0),
            password: non_empty(&self.password),
            sslcert: non_empty(&self.ssl_cert),
            sslrootcert: non_empty(&self.ssl_root_cert),
            sslkey: non_empty(&self.ssl_key),
            sslpassword: non_empty(&self.ssl_password),
        }
    }
}

impl fmt::Debug for ConnectionArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionArgs")
            .field("application_name", &self.application_name)
            .field("username", &self.username)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ssl_mode", &self.ssl_mode)
            .finish_non_exhaustive()
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

/// Fully resolved parameters for opening a connection to one database.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub application_name: String,
    pub user: String,
    pub dbname: String,
    pub sslmode: SslMode,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub password: Option<String>,
    pub sslcert: Option<String>,
    pub sslrootcert: Option<String>,
    pub sslkey: Option<String>,
    pub sslpassword: Option<String>,
}

impl ConnectParams {
    /// libpq keyword/value pairs, mandatory keys first.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("application_name", self.application_name.clone()),
            ("user", self.user.clone()),
            ("dbname", self.dbname.clone()),
            ("sslmode", self.sslmode.to_string()),
        ];
        if let Some(host) = &self.host {
            pairs.push(("host", host.clone()));
        }
        if let Some(password) = &self.password {
            pairs.push(("password", password.clone()));
        }
        if let Some(port) = self.port {
            pairs.push(("port", port.to_string()));
        }
        let optional = [
            ("sslcert", &self.sslcert),
            ("sslrootcert", &self.sslrootcert),
            ("sslkey", &self.sslkey),
            ("sslpassword", &self.sslpassword),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                pairs.push((key, value.clone()));
            }
        }
        pairs
    }

    /// Render as a libpq conninfo string (`key='value' ...`).
    pub fn conninfo(&self) -> String {
        self.to_pairs()
            .into_iter()
            .map(|(key, value)| format!("{key}='{}'", escape_conninfo(&value)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("application_name", &self.application_name)
            .field("user", &self.user)
            .field("dbname", &self.dbname)
            .field("sslmode", &self.sslmode)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

fn escape_conninfo(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
