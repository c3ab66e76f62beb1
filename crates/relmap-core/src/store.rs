//! Boundary to the relational store
//!
//! The mapper never talks to a database directly. It issues parameterised
//! SQL through [`RowStore`] and brackets its flush in one store transaction.

use crate::model::Value;

/// Result type for store round-trips
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Classification of store failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// The store rejected a write (unique, not-null, foreign key, check)
    Constraint,
    /// The store gave up waiting (lock timeout)
    Timeout,
    /// The statement was interrupted by the caller
    Cancelled,
    /// Anything else
    Other,
}

/// Error reported by a [`RowStore`] implementation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StoreError {
    kind: StoreErrorKind,
    message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Constraint, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Cancelled, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Other, message)
    }

    pub fn kind(&self) -> StoreErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// One result row, addressed by column label
///
/// A label without a value (a store that returned fewer values than
/// columns) reads as absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Value of the column with the given label
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// Synchronous relational store
///
/// Implementations must honour their own timeout and cancellation contract
/// and report it through [`StoreErrorKind::Timeout`] and
/// [`StoreErrorKind::Cancelled`]; the mapper propagates both unchanged.
pub trait RowStore {
    /// Run one statement. Statements that produce no result set return an
    /// empty vector.
    fn execute(&mut self, sql: &str, params: &[Value]) -> StoreResult<Vec<Row>>;

    /// Open a transaction for the statements that follow
    fn begin_transaction(&mut self) -> StoreResult<()>;

    /// Make the open transaction durable
    fn commit(&mut self) -> StoreResult<()>;

    /// Discard the open transaction. Must be safe to call after a failed
    /// `commit` or when no transaction is open.
    fn rollback(&mut self) -> StoreResult<()>;
}

impl<S: RowStore + ?Sized> RowStore for &mut S {
    fn execute(&mut self, sql: &str, params: &[Value]) -> StoreResult<Vec<Row>> {
        (**self).execute(sql, params)
    }

    fn begin_transaction(&mut self) -> StoreResult<()> {
        (**self).begin_transaction()
    }

    fn commit(&mut self) -> StoreResult<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> StoreResult<()> {
        (**self).rollback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_lookup_by_label() {
        let row = Row::new(
            vec!["t0__id".to_string(), "t0__name".to_string()],
            vec![Value::Integer(1), Value::Text("Pushkin".to_string())],
        );
        assert_eq!(row.get("t0__name"), Some(&Value::Text("Pushkin".to_string())));
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn test_row_with_missing_values_reads_absent() {
        let row = Row::new(
            vec!["t0__id".to_string(), "t0__name".to_string()],
            vec![Value::Integer(1)],
        );
        assert_eq!(row.get("t0__id"), Some(&Value::Integer(1)));
        assert_eq!(row.get("t0__name"), None);
    }

    #[test]
    fn test_store_error_kinds() {
        assert_eq!(StoreError::constraint("x").kind(), StoreErrorKind::Constraint);
        assert_eq!(StoreError::cancelled("x").kind(), StoreErrorKind::Cancelled);
        assert_eq!(StoreError::other("boom").to_string(), "boom");
    }
}
