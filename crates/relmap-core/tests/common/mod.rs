#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;

use relmap_core::{
    CascadeSet, ColumnMapping, ColumnType, EntityDescriptor, IdStrategy, Registry,
    RelationshipDescriptor, Row, RowStore, StoreError, Value,
};

/// In-memory store double
///
/// Records every statement, answers SELECTs from a queue of scripted result
/// sets (empty once the queue runs dry) and can fail one write. Inserts with
/// a RETURNING clause get keys 101, 102, ... in execution order.
#[derive(Debug, Default)]
pub struct ScriptedStore {
    pub executed: Vec<(String, Vec<Value>)>,
    pub transactions: Vec<&'static str>,
    responses: VecDeque<Vec<Row>>,
    fail_at: Option<(usize, StoreError)>,
    writes: usize,
    generated: i64,
}

#[allow(dead_code)]
impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result set of the next SELECT
    pub fn respond(&mut self, rows: Vec<Row>) -> &mut Self {
        self.responses.push_back(rows);
        self
    }

    /// Fail the n-th write (1-based, counted across commits) once
    pub fn fail_write(&mut self, n: usize, error: StoreError) -> &mut Self {
        self.fail_at = Some((n, error));
        self
    }

    pub fn writes(&self) -> Vec<String> {
        self.executed
            .iter()
            .filter(|(sql, _)| !sql.starts_with("SELECT"))
            .map(|(sql, _)| sql.clone())
            .collect()
    }

    pub fn queries(&self) -> Vec<String> {
        self.executed
            .iter()
            .filter(|(sql, _)| sql.starts_with("SELECT"))
            .map(|(sql, _)| sql.clone())
            .collect()
    }
}

impl RowStore for ScriptedStore {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
        self.executed.push((sql.to_string(), params.to_vec()));
        if sql.starts_with("SELECT") {
            return Ok(self.responses.pop_front().unwrap_or_default());
        }
        self.writes += 1;
        if let Some((n, _)) = &self.fail_at {
            if *n == self.writes {
                let (_, error) = self.fail_at.take().unwrap();
                return Err(error);
            }
        }
        if let Some((_, key_column)) = sql.split_once(" RETURNING ") {
            self.generated += 1;
            return Ok(vec![row(&[(key_column, Value::Integer(100 + self.generated))])]);
        }
        Ok(Vec::new())
    }

    fn begin_transaction(&mut self) -> Result<(), StoreError> {
        self.transactions.push("begin");
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.transactions.push("commit");
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.transactions.push("rollback");
        Ok(())
    }
}

/// Build a row from (label, value) pairs
#[allow(dead_code)]
pub fn row(pairs: &[(&str, Value)]) -> Row {
    Row::new(
        pairs.iter().map(|(c, _)| c.to_string()).collect(),
        pairs.iter().map(|(_, v)| v.clone()).collect(),
    )
}

/// Author (assigned integer keys) with books (generated keys) and tags
///
/// - Author.books: inverse one-to-many, cascade all, orphan removal
/// - Book.author: owning many-to-one, no cascade
/// - Book.tags: owning many-to-many through book_tags
/// - User (abstract) with Programmer and Manager, users.password is sensitive
#[allow(dead_code)]
pub fn library_registry() -> Registry {
    let mut builder = Registry::builder();
    builder
        .register(
            EntityDescriptor::new("Author", "authors")
                .id("id", ColumnType::Integer, IdStrategy::Assigned)
                .column(ColumnMapping::new("name", ColumnType::Text).not_null())
                .relationship(
                    RelationshipDescriptor::one_to_many("books", "Book")
                        .mapped_by("author")
                        .cascade(CascadeSet::all())
                        .orphan_removal(true),
                ),
        )
        .unwrap()
        .register(
            EntityDescriptor::new("Book", "books")
                .column(ColumnMapping::new("title", ColumnType::Text))
                .relationship(RelationshipDescriptor::many_to_one("author", "Author"))
                .relationship(
                    RelationshipDescriptor::many_to_many("tags", "Tag")
                        .join_table("book_tags", "book_id", "tag_id"),
                ),
        )
        .unwrap()
        .register(
            EntityDescriptor::new("Tag", "tags")
                .column(ColumnMapping::new("label", ColumnType::Text))
                .relationship(RelationshipDescriptor::many_to_many("books", "Book").mapped_by("tags")),
        )
        .unwrap()
        .register(
            EntityDescriptor::new("User", "")
                .abstract_type()
                .column(ColumnMapping::new("login", ColumnType::Text))
                .column(ColumnMapping::new("password", ColumnType::Text).sensitive()),
        )
        .unwrap()
        .register(
            EntityDescriptor::new("Programmer", "programmers")
                .extends("User")
                .column(ColumnMapping::new("language", ColumnType::Text)),
        )
        .unwrap()
        .register(
            EntityDescriptor::new("Manager", "managers")
                .extends("User")
                .column(ColumnMapping::new("reports", ColumnType::Integer)),
        )
        .unwrap();
    builder.validate().unwrap()
}
