//! SQLite implementation of [`RowStore`]

use chrono::SecondsFormat;
use relmap_core::store::StoreResult;
use relmap_core::{Row, RowStore, StoreError, Value};
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, InterruptHandle, ToSql};

use crate::config::StoreConfig;
use crate::db;
use crate::errors::{classify, Result};

/// Row store over one SQLite connection
///
/// Statements are prepared through the connection's statement cache.
/// Transactions use `BEGIN IMMEDIATE` so that lock contention surfaces when
/// the commit starts rather than on its first write.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Open and configure the database described by `config`
    pub fn open(config: &StoreConfig) -> Result<Self> {
        db::open_configured(config).map(Self::new)
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(&StoreConfig::in_memory())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Handle that cancels the running statement from another thread; the
    /// statement fails with a cancelled store error
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.conn.get_interrupt_handle()
    }

    pub fn into_inner(self) -> Connection {
        self.conn
    }
}

impl RowStore for SqliteStore {
    fn execute(&mut self, sql: &str, params: &[Value]) -> StoreResult<Vec<Row>> {
        let mut statement = self.conn.prepare_cached(sql).map_err(|e| classify(&e))?;
        let bound = params_from_iter(params.iter().map(Param));

        if statement.column_count() == 0 {
            statement.execute(bound).map_err(|e| classify(&e))?;
            return Ok(Vec::new());
        }

        let columns: Vec<String> = statement
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut rows = statement.query(bound).map_err(|e| classify(&e))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| classify(&e))? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(read_value(row.get_ref(i).map_err(|e| classify(&e))?, &columns[i])?);
            }
            out.push(Row::new(columns.clone(), values));
        }
        Ok(out)
    }

    fn begin_transaction(&mut self) -> StoreResult<()> {
        tracing::trace!("BEGIN IMMEDIATE");
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| classify(&e))
    }

    fn commit(&mut self) -> StoreResult<()> {
        tracing::trace!("COMMIT");
        self.conn.execute_batch("COMMIT").map_err(|e| classify(&e))
    }

    fn rollback(&mut self) -> StoreResult<()> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        tracing::trace!("ROLLBACK");
        self.conn.execute_batch("ROLLBACK").map_err(|e| classify(&e))
    }
}

/// Bind adapter for mapper values
struct Param<'a>(&'a Value);

impl ToSql for Param<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Real(r) => ToSqlOutput::Owned(SqlValue::Real(*r)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Timestamp(t) => ToSqlOutput::Owned(SqlValue::Text(
                t.to_rfc3339_opts(SecondsFormat::Micros, true),
            )),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

/// SQLite has no boolean or timestamp storage class; the mapper coerces
/// integers and text back to the column type
fn read_value(value: ValueRef<'_>, column: &str) -> StoreResult<Value> {
    Ok(match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(r) => Value::Real(r),
        ValueRef::Text(t) => Value::Text(
            String::from_utf8(t.to_vec())
                .map_err(|e| StoreError::other(format!("column {}: invalid UTF-8 text: {}", column, e)))?,
        ),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use relmap_core::StoreErrorKind;

    fn store_with_table() -> SqliteStore {
        let mut store = SqliteStore::in_memory().unwrap();
        store
            .execute(
                "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL, done INTEGER, at TEXT)",
                &[],
            )
            .unwrap();
        store
    }

    #[test]
    fn test_values_are_bound_and_read_back() {
        let mut store = store_with_table();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        store
            .execute(
                "INSERT INTO notes (id, body, done, at) VALUES (?, ?, ?, ?)",
                &[Value::Integer(1), Value::from("hello"), Value::Bool(true), Value::Timestamp(at)],
            )
            .unwrap();

        let rows = store
            .execute("SELECT id AS n__id, body, done, at FROM notes WHERE id = ?", &[Value::Integer(1)])
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("n__id"), Some(&Value::Integer(1)));
        assert_eq!(rows[0].get("body"), Some(&Value::from("hello")));
        assert_eq!(rows[0].get("done"), Some(&Value::Integer(1)));
        assert_eq!(rows[0].get("at"), Some(&Value::from("2024-05-01T12:00:00.000000Z")));
    }

    #[test]
    fn test_blob_bytes_survive_round_trip() {
        let mut store = SqliteStore::in_memory().unwrap();
        store
            .execute("CREATE TABLE files (id INTEGER PRIMARY KEY, data BLOB)", &[])
            .unwrap();
        let bytes = vec![0xff, 0xfe, 0x00, 0x80];
        store
            .execute(
                "INSERT INTO files (id, data) VALUES (?, ?)",
                &[Value::Integer(1), Value::Blob(bytes.clone())],
            )
            .unwrap();

        let rows = store.execute("SELECT data FROM files", &[]).unwrap();

        assert_eq!(rows[0].get("data"), Some(&Value::Blob(bytes)));
    }

    #[test]
    fn test_insert_returning_yields_generated_key() {
        let mut store = store_with_table();
        let rows = store
            .execute("INSERT INTO notes (body) VALUES (?) RETURNING id", &[Value::from("x")])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&Value::Integer(1)));
    }

    #[test]
    fn test_rollback_discards_writes() {
        let mut store = store_with_table();
        store.begin_transaction().unwrap();
        store
            .execute("INSERT INTO notes (id, body) VALUES (?, ?)", &[Value::Integer(1), Value::from("x")])
            .unwrap();
        store.rollback().unwrap();

        let rows = store.execute("SELECT id FROM notes", &[]).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_rollback_without_transaction_is_noop() {
        let mut store = store_with_table();
        assert!(store.rollback().is_ok());
    }

    #[test]
    fn test_constraint_failure_is_classified() {
        let mut store = store_with_table();
        let err = store
            .execute("INSERT INTO notes (id, body) VALUES (?, ?)", &[Value::Integer(1), Value::Null])
            .unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::Constraint);
    }
}
