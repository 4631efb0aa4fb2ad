//! `Session` implementation over a `tokio_postgres::Client`.

use std::collections::HashMap;
use std::error::Error;

use async_trait::async_trait;
use poolkeeper_core::comment::QueryCommenter;
use poolkeeper_core::text::{self, TextDecoder};
use poolkeeper_core::{PoolError, PoolResult, Session, Value};
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{Client, Row};

/// Resolves a `regclass` OID to its relation name in the server encoding.
const RELATION_NAME_SQL: &str = "SELECT $1::oid::regclass::text";

/// Text-bearing column value, undecoded.
struct RawText<'a>(&'a [u8]);

impl<'a> FromSql<'a> for RawText<'a> {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        Ok(Self(raw))
    }

    fn accepts(ty: &Type) -> bool {
        // regclass arrives as a binary OID; its name is looked up separately.
        *ty != Type::REGCLASS && text::is_text_type(ty.name())
    }
}

/// OID-valued columns (`oid`, `regclass`, ...), sent as a big-endian u32.
struct Oid(u32);

impl<'a> FromSql<'a> for Oid {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        let bytes: [u8; 4] = raw.try_into()?;
        Ok(Self(u32::from_be_bytes(bytes)))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::OID || *ty == Type::REGCLASS || *ty == Type::REGTYPE || *ty == Type::REGPROC
    }
}

/// A decoded column, or a `regclass` whose name still has to be resolved.
#[derive(Debug, PartialEq)]
enum Cell {
    Value(Value),
    RegClass(u32),
}

/// Decode text bytes with the installed fallback decoder, or as strict UTF-8.
pub(crate) fn decode_text(raw: &[u8], decoder: Option<&TextDecoder>) -> PoolResult<String> {
    match decoder {
        Some(decoder) => Ok(decoder.decode(raw)),
        None => String::from_utf8(raw.to_vec())
            .map_err(|e| PoolError::Query(format!("invalid UTF-8 in text column: {e}"))),
    }
}

fn column_error(column: &str, e: tokio_postgres::Error) -> PoolError {
    PoolError::Query(format!("decoding column {column}: {e}"))
}

fn decode_column(row: &Row, idx: usize, decoder: Option<&TextDecoder>) -> PoolResult<Cell> {
    let column = &row.columns()[idx];
    let ty = column.type_();
    let name = column.name();

    let value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)
            .map_err(|e| column_error(name, e))?
            .map(Value::Bool)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)
            .map_err(|e| column_error(name, e))?
            .map(|v| Value::Int(v.into()))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)
            .map_err(|e| column_error(name, e))?
            .map(|v| Value::Int(v.into()))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)
            .map_err(|e| column_error(name, e))?
            .map(Value::Int)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)
            .map_err(|e| column_error(name, e))?
            .map(|v| Value::Float(v.into()))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)
            .map_err(|e| column_error(name, e))?
            .map(Value::Float)
    } else if *ty == Type::REGCLASS {
        return Ok(row
            .try_get::<_, Option<Oid>>(idx)
            .map_err(|e| column_error(name, e))?
            .map_or(Cell::Value(Value::Null), |oid| Cell::RegClass(oid.0)));
    } else if <Oid as FromSql<'_>>::accepts(ty) {
        row.try_get::<_, Option<Oid>>(idx)
            .map_err(|e| column_error(name, e))?
            .map(|oid| Value::Int(oid.0.into()))
    } else if <RawText<'_> as FromSql<'_>>::accepts(ty) {
        match row
            .try_get::<_, Option<RawText<'_>>>(idx)
            .map_err(|e| column_error(name, e))?
        {
            Some(raw) => Some(Value::Text(decode_text(raw.0, decoder)?)),
            None => None,
        }
    } else {
        return Err(PoolError::Query(format!(
            "column {name} has unsupported type {}",
            ty.name()
        )));
    };
    Ok(Cell::Value(value.unwrap_or(Value::Null)))
}

/// One PostgreSQL connection. Dropping the client terminates it.
pub struct PgSession {
    client: Option<Client>,
    dbname: String,
    server_encoding: String,
    decoder: Option<TextDecoder>,
    commenter: Option<QueryCommenter>,
}

impl PgSession {
    pub(crate) fn new(client: Client, dbname: &str, server_encoding: String) -> Self {
        Self {
            client: Some(client),
            dbname: dbname.to_string(),
            server_encoding,
            decoder: None,
            commenter: None,
        }
    }

    fn client(&self) -> PoolResult<&Client> {
        self.client.as_ref().ok_or_else(|| PoolError::PoolClosed {
            dbname: self.dbname.clone(),
        })
    }

    async fn relation_name(&self, oid: u32) -> PoolResult<String> {
        let row = self
            .client()?
            .query_one(RELATION_NAME_SQL, &[&oid])
            .await
            .map_err(|e| PoolError::Query(format!("resolving regclass {oid}: {e}")))?;
        let raw = row
            .try_get::<_, RawText<'_>>(0)
            .map_err(|e| column_error("regclass", e))?;
        decode_text(raw.0, self.decoder.as_ref())
    }

    fn prepare_sql(&self, sql: &str) -> String {
        match &self.commenter {
            Some(commenter) => commenter.comment(sql),
            None => sql.to_string(),
        }
    }
}

#[async_trait]
impl Session for PgSession {
    fn server_encoding(&self) -> &str {
        &self.server_encoding
    }

    fn set_autocommit(&mut self, enabled: bool) -> PoolResult<()> {
        if enabled {
            return Ok(());
        }
        Err(PoolError::Unsupported(
            "pooled sessions always run in autocommit mode".to_string(),
        ))
    }

    fn set_text_decoder(&mut self, decoder: TextDecoder) {
        self.decoder = Some(decoder);
    }

    fn set_commenter(&mut self, commenter: QueryCommenter) {
        self.commenter = Some(commenter);
    }

    async fn execute(&mut self, sql: &str) -> PoolResult<u64> {
        let sql = self.prepare_sql(sql);
        tracing::trace!(database = %self.dbname, sql = %sql, "execute");
        self.client()?
            .execute(sql.as_str(), &[])
            .await
            .map_err(|e| PoolError::Query(e.to_string()))
    }

    async fn query(&mut self, sql: &str) -> PoolResult<Vec<Vec<Value>>> {
        let sql = self.prepare_sql(sql);
        tracing::trace!(database = %self.dbname, sql = %sql, "query");
        let rows = self
            .client()?
            .query(sql.as_str(), &[])
            .await
            .map_err(|e| PoolError::Query(e.to_string()))?;

        let decoder = self.decoder.as_ref();
        let mut relations: HashMap<u32, String> = HashMap::new();
        let mut decoded = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(row.len());
            for idx in 0..row.len() {
                let value = match decode_column(row, idx, decoder)? {
                    Cell::Value(value) => value,
                    Cell::RegClass(oid) => match relations.get(&oid) {
                        Some(name) => Value::Text(name.clone()),
                        None => {
                            let name = self.relation_name(oid).await?;
                            relations.insert(oid, name.clone());
                            Value::Text(name)
                        }
                    },
                };
                values.push(value);
            }
            decoded.push(values);
        }
        Ok(decoded)
    }

    fn is_closed(&self) -> bool {
        self.client.as_ref().is_none_or(Client::is_closed)
    }

    fn close(&mut self) {
        if self.client.take().is_some() {
            tracing::debug!(database = %self.dbname, "closed postgres connection");
        }
    }
}

impl std::fmt::Debug for PgSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSession")
            .field("dbname", &self.dbname)
            .field("server_encoding", &self.server_encoding)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
