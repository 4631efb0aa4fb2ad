//! Physical database sessions and the configuration applied to each one.
//!
//! A [`ConnectionFactory`] opens a raw [`Session`]; before the pool hands a
//! freshly opened session to any caller it runs a
//! [`ConnectionConfigurator`] over it. The default [`SessionConfigurator`]
//! enables autocommit, installs the text-decoding fallback on ASCII-only
//! servers, attaches the query commenter and pushes the statement timeout
//! down to the server.

use std::time::Duration;

use async_trait::async_trait;

use crate::args::ConnectParams;
use crate::comment::QueryCommenter;
use crate::error::PoolResult;
use crate::text::{TextDecoder, is_ascii_encoding};

/// A decoded column value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// One open connection to a database server.
///
/// Implementations own the transport. Statements passed to `execute` and
/// `query` are expected to be routed through the installed commenter.
#[async_trait]
pub trait Session: Send + std::fmt::Debug {
    /// Encoding name the server reported for this session.
    fn server_encoding(&self) -> &str;
    fn set_autocommit(&mut self, enabled: bool) -> PoolResult<()>;
    fn set_text_decoder(&mut self, decoder: TextDecoder);
    fn set_commenter(&mut self, commenter: QueryCommenter);
    /// Run a statement, returning the number of rows affected.
    async fn execute(&mut self, sql: &str) -> PoolResult<u64>;
    async fn query(&mut self, sql: &str) -> PoolResult<Vec<Vec<Value>>>;
    /// Whether the session is known to be unusable.
    fn is_closed(&self) -> bool;
    fn close(&mut self);
}

/// Opens new sessions.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> PoolResult<Box<dyn Session>>;
}

/// Applies session-level settings to a freshly opened session.
#[async_trait]
pub trait ConnectionConfigurator: Send + Sync {
    async fn configure(&self, session: &mut dyn Session) -> PoolResult<()>;
}

/// Default configurator used by the pool manager.
#[derive(Clone, Debug)]
pub struct SessionConfigurator {
    pub statement_timeout: Option<Duration>,
    pub text_decoder: TextDecoder,
    pub commenter: QueryCommenter,
}

impl SessionConfigurator {
    pub fn new(commenter: QueryCommenter) -> Self {
        Self {
            statement_timeout: None,
            text_decoder: TextDecoder::default(),
            commenter,
        }
    }

    /// Builder method: set the statement timeout.
    pub fn with_statement_timeout(self, statement_timeout: Option<Duration>) -> Self {
        Self {
            statement_timeout,
            ..self
        }
    }

    /// Builder method: set the fallback text decoder.
    pub fn with_text_decoder(self, text_decoder: TextDecoder) -> Self {
        Self {
            text_decoder,
            ..self
        }
    }
}

#[async_trait]
impl ConnectionConfigurator for SessionConfigurator {
    async fn configure(&self, session: &mut dyn Session) -> PoolResult<()> {
        session.set_autocommit(true)?;

        if is_ascii_encoding(session.server_encoding()) {
            tracing::debug!(
                encoding = %session.server_encoding(),
                fallbacks = ?self.text_decoder.encodings(),
                "installing text decoder fallback"
            );
            session.set_text_decoder(self.text_decoder.clone());
        }

        session.set_commenter(self.commenter.clone());

        if let Some(timeout) = self.statement_timeout {
            session
                .execute(&format!("SET statement_timeout = {}", timeout.as_millis()))
                .await?;
        }
        Ok(())
    }
}
