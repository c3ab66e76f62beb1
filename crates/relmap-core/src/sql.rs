//! SQL text generation
//!
//! All statements are parameterised with `?` placeholders. Identifiers come
//! from validated descriptors and are emitted as-is.

use crate::model::Value;

/// A statement ready to send to the store
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
    /// Parallel to `params`; true where the value must not reach a log line
    pub redact: Vec<bool>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            redact: Vec::new(),
        }
    }

    #[must_use]
    pub fn bind(mut self, value: Value) -> Self {
        self.push(value, false);
        self
    }

    pub fn push(&mut self, value: Value, sensitive: bool) {
        self.params.push(value);
        self.redact.push(sensitive);
    }
}

/// `?, ?, ?`
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub fn insert(table: &str, columns: &[String]) -> String {
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders(columns.len())
    )
}

/// INSERT that returns the key the store generated for the row
pub fn insert_returning(table: &str, columns: &[String], key_column: &str) -> String {
    if columns.is_empty() {
        return format!("INSERT INTO {} DEFAULT VALUES RETURNING {}", table, key_column);
    }
    format!("{} RETURNING {}", insert(table, columns), key_column)
}

pub fn update(table: &str, columns: &[String], key_column: &str) -> String {
    let assignments: Vec<String> = columns.iter().map(|c| format!("{} = ?", c)).collect();
    format!(
        "UPDATE {} SET {} WHERE {} = ?",
        table,
        assignments.join(", "),
        key_column
    )
}

pub fn delete(table: &str, key_column: &str) -> String {
    format!("DELETE FROM {} WHERE {} = ?", table, key_column)
}

pub fn delete_link(table: &str, owner_column: &str, target_column: &str) -> String {
    format!(
        "DELETE FROM {} WHERE {} = ? AND {} = ?",
        table, owner_column, target_column
    )
}

/// Column label of `column` read through `alias`
pub fn label(alias: &str, column: &str) -> String {
    format!("{}__{}", alias, column)
}

/// Incrementally assembled SELECT
#[derive(Debug, Default, Clone)]
pub struct Select {
    distinct: bool,
    columns: Vec<String>,
    from: String,
    joins: Vec<String>,
    conditions: Vec<String>,
    order_by: Vec<String>,
}

impl Select {
    pub fn from(source: &str, alias: &str) -> Self {
        Self {
            from: format!("{} {}", source, alias),
            ..Self::default()
        }
    }

    pub fn distinct(&mut self) {
        self.distinct = true;
    }

    /// Select `alias.column` labelled `alias__column`
    pub fn column(&mut self, alias: &str, column: &str) {
        self.columns
            .push(format!("{}.{} AS {}", alias, column, label(alias, column)));
    }

    pub fn column_as(&mut self, expr: &str, label: &str) {
        self.columns.push(format!("{} AS {}", expr, label));
    }

    pub fn join(&mut self, clause: String) {
        self.joins.push(clause);
    }

    pub fn condition(&mut self, clause: String) {
        self.conditions.push(clause);
    }

    pub fn order_by(&mut self, label: String) {
        self.order_by.push(label);
    }

    pub fn to_sql(&self) -> String {
        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(&self.columns.join(", "));
        sql.push_str(" FROM ");
        sql.push_str(&self.from);
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if !self.conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.conditions.join(" AND "));
        }
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by.join(", "));
        }
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_sql() {
        let sql = insert("books", &["id".to_string(), "title".to_string()]);
        assert_eq!(sql, "INSERT INTO books (id, title) VALUES (?, ?)");
    }

    #[test]
    fn test_insert_returning_sql() {
        let sql = insert_returning("courses", &["course_name".to_string()], "id");
        assert_eq!(sql, "INSERT INTO courses (course_name) VALUES (?) RETURNING id");
        assert_eq!(
            insert_returning("markers", &[], "id"),
            "INSERT INTO markers DEFAULT VALUES RETURNING id"
        );
    }

    #[test]
    fn test_update_sql() {
        let sql = update("books", &["title".to_string(), "author_id".to_string()], "id");
        assert_eq!(sql, "UPDATE books SET title = ?, author_id = ? WHERE id = ?");
    }

    #[test]
    fn test_select_with_join() {
        let mut select = Select::from("authors", "t0");
        select.distinct();
        select.column("t0", "id");
        select.column("j1", "id");
        select.join("LEFT JOIN books j1 ON j1.author_id = t0.id".to_string());
        select.condition("t0.name = ?".to_string());
        select.order_by(label("t0", "id"));
        assert_eq!(
            select.to_sql(),
            "SELECT DISTINCT t0.id AS t0__id, j1.id AS j1__id FROM authors t0 \
             LEFT JOIN books j1 ON j1.author_id = t0.id WHERE t0.name = ? ORDER BY t0__id"
        );
    }

    #[test]
    fn test_statement_tracks_redaction() {
        let mut stmt = Statement::new("INSERT INTO users (id, password) VALUES (?, ?)");
        stmt.push(Value::Integer(1), false);
        stmt.push(Value::from("hunter2"), true);
        assert_eq!(stmt.redact, vec![false, true]);
    }
}
