//! A thin engine layer so the same statements run against SQLite and
//! PostgreSQL.
//!
//! Statements are written once with `$1`-style placeholders (numbered in
//! parameter order); for SQLite they are mechanically rewritten to `?1`.
//! Values and rows pass through a small dynamic type so the session layer
//! never sees an engine-specific API.
use crate::{
    config::{DbBackend, DbConfig},
    util::parse_timestamp,
    Error, Result,
};
use chrono::{DateTime, Utc};
use postgres::{types::Type as PgType, NoTls};
use std::{
    collections::HashMap,
    sync::{Condvar, Mutex},
};

pub const POOL_SIZE: usize = 5;

/// A single bindable/readable value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Bool(bool),
    Text(String),
}

impl SqlValue {
    pub fn opt_text(value: Option<&str>) -> Self {
        match value {
            Some(s) => Self::Text(s.to_owned()),
            None => Self::Null,
        }
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<bool> for SqlValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for SqlValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

/// One result row, keyed by column name.
#[derive(Debug, Clone)]
pub struct SqlRow(HashMap<String, SqlValue>);

impl SqlRow {
    pub fn text(&self, col: &str) -> Result<Option<String>> {
        match self.0.get(col) {
            Some(SqlValue::Text(s)) => Ok(Some(s.clone())),
            Some(SqlValue::Int(n)) => Ok(Some(n.to_string())),
            Some(SqlValue::Null) | None => Ok(None),
            Some(other) => Err(Error::key(format!("column {col} is not text: {other:?}"))),
        }
    }

    pub fn req_text(&self, col: &str) -> Result<String> {
        self.text(col)?
            .ok_or_else(|| Error::key(format!("column {col} is null")))
    }

    pub fn bool(&self, col: &str) -> Result<bool> {
        match self.0.get(col) {
            Some(SqlValue::Bool(b)) => Ok(*b),
            Some(SqlValue::Int(n)) => Ok(*n != 0),
            other => Err(Error::key(format!("column {col} is not a bool: {other:?}"))),
        }
    }

    pub fn timestamp(&self, col: &str) -> Result<DateTime<Utc>> {
        parse_timestamp(&self.req_text(col)?)
    }
}

pub enum Engine {
    Sqlite(rusqlite::Connection),
    Postgres(postgres::Client),
}

impl Engine {
    pub fn connect(config: &DbConfig) -> Result<Self> {
        match config.backend {
            DbBackend::Sqlite => {
                let conn = rusqlite::Connection::open(&config.sqlite_path)?;
                conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
                Ok(Self::Sqlite(conn))
            }

            DbBackend::Postgres => {
                let mut params = format!(
                    "host={} port={} user={} dbname={}",
                    config.pg_host, config.pg_port, config.pg_user, config.pg_name
                );

                if !config.pg_pass.is_empty() {
                    params.push_str(&format!(" password={}", config.pg_pass));
                }

                Ok(Self::Postgres(postgres::Client::connect(&params, NoTls)?))
            }
        }
    }

    #[cfg(test)]
    pub fn memory() -> Self {
        let conn = rusqlite::Connection::open_in_memory().expect("to open an in-memory db");
        Self::Sqlite(conn)
    }

    /// Run a statement that returns no rows. Returns the affected row count.
    pub fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        match self {
            Self::Sqlite(conn) => {
                let translated = sqlite_sql(sql);
                let values: Vec<rusqlite::types::Value> =
                    params.iter().map(to_sqlite).collect();

                Ok(conn.execute(&translated, rusqlite::params_from_iter(values))?)
            }

            Self::Postgres(client) => {
                let boxed = to_postgres(params);
                let refs: Vec<&(dyn postgres::types::ToSql + Sync)> =
                    boxed.iter().map(|b| b.as_ref()).collect();

                Ok(client.execute(sql, &refs)? as usize)
            }
        }
    }

    pub fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        match self {
            Self::Sqlite(conn) => {
                let translated = sqlite_sql(sql);
                let mut stmt = conn.prepare(&translated)?;
                let names: Vec<String> =
                    stmt.column_names().iter().map(|n| n.to_string()).collect();

                let values: Vec<rusqlite::types::Value> =
                    params.iter().map(to_sqlite).collect();
                let mut rows = stmt.query(rusqlite::params_from_iter(values))?;

                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let mut map = HashMap::new();
                    for (i, name) in names.iter().enumerate() {
                        map.insert(name.clone(), from_sqlite(row.get_ref(i)?));
                    }
                    out.push(SqlRow(map));
                }

                Ok(out)
            }

            Self::Postgres(client) => {
                let boxed = to_postgres(params);
                let refs: Vec<&(dyn postgres::types::ToSql + Sync)> =
                    boxed.iter().map(|b| b.as_ref()).collect();

                let mut out = Vec::new();
                for row in client.query(sql, &refs)? {
                    let mut map = HashMap::new();
                    for (i, col) in row.columns().iter().enumerate() {
                        map.insert(col.name().to_owned(), from_postgres(&row, i)?);
                    }
                    out.push(SqlRow(map));
                }

                Ok(out)
            }
        }
    }

    pub fn query_one(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlRow>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// Run raw statements without parameters (DDL, transaction control).
    pub fn batch(&mut self, sql: &str) -> Result<()> {
        match self {
            Self::Sqlite(conn) => Ok(conn.execute_batch(sql)?),
            Self::Postgres(client) => Ok(client.batch_execute(sql)?),
        }
    }
}

fn sqlite_sql(sql: &str) -> String {
    sql.replace('$', "?")
}

fn to_sqlite(value: &SqlValue) -> rusqlite::types::Value {
    use rusqlite::types::Value;

    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Int(n) => Value::Integer(*n),
        SqlValue::Bool(b) => Value::Integer(i64::from(*b)),
        SqlValue::Text(s) => Value::Text(s.clone()),
    }
}

fn from_sqlite(value: rusqlite::types::ValueRef<'_>) -> SqlValue {
    use rusqlite::types::ValueRef;

    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(n) => SqlValue::Int(n),
        ValueRef::Real(f) => SqlValue::Text(f.to_string()),
        ValueRef::Text(s) => SqlValue::Text(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => SqlValue::Text(String::from_utf8_lossy(b).into_owned()),
    }
}

fn to_postgres(params: &[SqlValue]) -> Vec<Box<dyn postgres::types::ToSql + Sync>> {
    params
        .iter()
        .map(|value| -> Box<dyn postgres::types::ToSql + Sync> {
            match value {
                SqlValue::Null => Box::new(None::<String>),
                SqlValue::Int(n) => Box::new(*n),
                SqlValue::Bool(b) => Box::new(*b),
                SqlValue::Text(s) => Box::new(s.clone()),
            }
        })
        .collect()
}

fn from_postgres(row: &postgres::Row, i: usize) -> Result<SqlValue> {
    let col_type = row.columns()[i].type_();

    let value = if *col_type == PgType::BOOL {
        match row.try_get::<_, Option<bool>>(i)? {
            Some(b) => SqlValue::Bool(b),
            None => SqlValue::Null,
        }
    } else if *col_type == PgType::INT2 {
        match row.try_get::<_, Option<i16>>(i)? {
            Some(n) => SqlValue::Int(i64::from(n)),
            None => SqlValue::Null,
        }
    } else if *col_type == PgType::INT4 {
        match row.try_get::<_, Option<i32>>(i)? {
            Some(n) => SqlValue::Int(i64::from(n)),
            None => SqlValue::Null,
        }
    } else if *col_type == PgType::INT8 {
        match row.try_get::<_, Option<i64>>(i)? {
            Some(n) => SqlValue::Int(n),
            None => SqlValue::Null,
        }
    } else {
        match row.try_get::<_, Option<String>>(i)? {
            Some(s) => SqlValue::Text(s),
            None => SqlValue::Null,
        }
    };

    Ok(value)
}

/// A fixed-size blocking connection pool. Store and cache operations are
/// short, so a checkout never holds a connection across a suspension point.
pub struct Pool {
    conns: Mutex<Vec<Engine>>,
    available: Condvar,
}

impl Pool {
    pub fn new(conns: Vec<Engine>) -> Self {
        Self {
            conns: Mutex::new(conns),
            available: Condvar::new(),
        }
    }

    pub fn checkout(&self) -> Engine {
        let mut conns = self.conns.lock().unwrap();

        loop {
            if let Some(conn) = conns.pop() {
                return conn;
            }

            conns = self.available.wait(conns).unwrap();
        }
    }

    pub fn checkin(&self, conn: Engine) {
        self.conns.lock().unwrap().push(conn);
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_placeholders_are_translated() {
        assert_eq!(
            sqlite_sql("SELECT * FROM inboxes WHERE domain = $1 OR actor = $1"),
            "SELECT * FROM inboxes WHERE domain = ?1 OR actor = ?1"
        );
    }

    #[test]
    fn values_round_trip_through_sqlite() {
        let mut engine = Engine::memory();
        engine
            .batch("CREATE TABLE t (a TEXT, b INTEGER, c BOOLEAN, d TEXT)")
            .unwrap();

        engine
            .execute(
                "INSERT INTO t (a, b, c, d) VALUES ($1, $2, $3, $4)",
                &[
                    SqlValue::from("hello"),
                    SqlValue::from(42i64),
                    SqlValue::from(true),
                    SqlValue::Null,
                ],
            )
            .unwrap();

        let row = engine
            .query_one("SELECT * FROM t", &[])
            .unwrap()
            .expect("one row");

        assert_eq!(row.req_text("a").unwrap(), "hello");
        assert_eq!(row.text("b").unwrap(), Some("42".to_owned()));
        assert!(row.bool("c").unwrap());
        assert_eq!(row.text("d").unwrap(), None);
    }

    #[test]
    fn affected_row_counts_are_reported() {
        let mut engine = Engine::memory();
        engine.batch("CREATE TABLE t (a TEXT)").unwrap();

        for v in ["x", "y"] {
            engine
                .execute("INSERT INTO t (a) VALUES ($1)", &[SqlValue::from(v)])
                .unwrap();
        }

        let n = engine.execute("DELETE FROM t", &[]).unwrap();
        assert_eq!(n, 2);
    }
}
