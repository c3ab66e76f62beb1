//! Demo domain
//!
//! Mapping and schema for the library (authors, books, tags), companies with
//! their users, chats joined through an association entity, and courses with
//! students. The library part drives the fetch-strategy comparison: the same
//! 25 authors are read with each strategy and the SELECT count is reported.
//!
//! Cascade and orphan-removal settings differ on purpose:
//! - `Author.books`: cascade all, orphan removal (unlinked books are deleted)
//! - `Company.users`: cascade persist/merge, no orphan removal (FK is nulled)
//! - `Course.students`: cascade all, no orphan removal, `course_id NOT NULL`
//!   (unlinking a student violates the constraint)
//!
//! Authors, companies, courses, students and chat memberships are keyed by
//! the store on insert. Users keep UUIDs: their rows live in one table per
//! concrete type. Every user embeds a [`personal_info`] component whose
//! birth date is stored as a plain `YYYY-MM-DD` date.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, TimeZone, Utc};
use relmap_core::{
    AttributeConverter, CascadeOp, CascadeSet, ColumnMapping, ColumnType, Converter, Embeddable,
    Embedded, EntityDescriptor, FetchGraph, FetchMode, IdStrategy, Query, Registry,
    RelationshipDescriptor, RowStore, SessionConfig, Statistics, UnitOfWork, Value,
};
use rusqlite::Connection;

use crate::errors::{from_relmap, from_rusqlite, Result};

const DEMO_SCHEMA: &str = include_str!("../sql/demo_schema.sql");

/// Batch size of `Author.books` under [`Strategy::Batched`]
pub const BATCH_SIZE: usize = 10;

/// Name of the graph on `Author` that loads its books
pub const WITH_BOOKS: &str = "withBooks";

/// How `Author.books` is loaded when reading the library
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Declared lazy: one query per author on first access
    Lazy,
    /// Declared `batched(10)`: one query per ten authors
    Batched,
    /// Ad-hoc join fetch on the root query
    Join,
    /// Named entity graph: one batched query for all authors
    Graph,
    /// Declared eager: one query per author right after the root query
    Eager,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::Lazy,
        Strategy::Batched,
        Strategy::Join,
        Strategy::Graph,
        Strategy::Eager,
    ];

    /// Declared fetch mode of `Author.books`
    pub fn books_fetch(self) -> FetchMode {
        match self {
            Strategy::Batched => FetchMode::Batched(BATCH_SIZE),
            Strategy::Eager => FetchMode::Eager,
            Strategy::Lazy | Strategy::Join | Strategy::Graph => FetchMode::Lazy,
        }
    }

    /// Root query listing all authors
    pub fn query(self) -> Query {
        let query = Query::new("Author");
        match self {
            Strategy::Join => query.join_fetch("books"),
            Strategy::Graph => query.named_graph(WITH_BOOKS),
            _ => query,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::Lazy => "lazy",
            Strategy::Batched => "batched",
            Strategy::Join => "join",
            Strategy::Graph => "graph",
            Strategy::Eager => "eager",
        };
        f.pad(s)
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Strategy::ALL
            .into_iter()
            .find(|strategy| strategy.to_string() == s.to_ascii_lowercase())
            .ok_or_else(|| {
                format!(
                    "unknown strategy '{}' (expected one of: lazy, batched, join, graph, eager)",
                    s
                )
            })
    }
}

fn text(field: &str) -> ColumnMapping {
    ColumnMapping::new(field, ColumnType::Text)
}

const BIRTHDAY_FORMAT: &str = "%Y-%m-%d";

/// Birthdays held as midnight-UTC timestamps and stored as calendar dates
#[derive(Debug, Clone, Copy, Default)]
pub struct BirthdayConverter;

impl AttributeConverter for BirthdayConverter {
    fn field_type(&self) -> ColumnType {
        ColumnType::Timestamp
    }

    fn to_column(&self, value: Value) -> std::result::Result<Value, String> {
        value
            .as_timestamp()
            .map(|t| Value::Text(t.format(BIRTHDAY_FORMAT).to_string()))
            .ok_or_else(|| format!("expected timestamp, got {}", value.type_name()))
    }

    fn to_field(&self, value: Value) -> std::result::Result<Value, String> {
        let text = value
            .as_str()
            .ok_or_else(|| format!("expected date text, got {}", value.type_name()))?;
        let midnight = NaiveDate::parse_from_str(text, BIRTHDAY_FORMAT)
            .map_err(|e| format!("invalid birthday '{}': {}", text, e))?
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| format!("invalid birthday '{}'", text))?;
        Ok(Value::Timestamp(Utc.from_utc_datetime(&midnight)))
    }
}

/// Name and birth date of a user, stored in the user's own table
pub fn personal_info() -> Embeddable {
    Embeddable::new("PersonalInfo")
        .column(text("first_name"))
        .column(text("last_name"))
        .column(
            text("birth_date").convert(Converter::new("birthday", BirthdayConverter)),
        )
}

/// Validated registry of the demo domain with `Author.books` declared for
/// `strategy`
pub fn registry(strategy: Strategy) -> relmap_core::Result<Registry> {
    let mut builder = Registry::builder();
    builder
        .register(
            EntityDescriptor::new("Author", "authors")
                .id("id", ColumnType::Integer, IdStrategy::Identity)
                .column(text("name").not_null())
                .relationship(
                    RelationshipDescriptor::one_to_many("books", "Book")
                        .mapped_by("author")
                        .cascade(CascadeSet::all())
                        .orphan_removal(true)
                        .fetch(strategy.books_fetch()),
                )
                .named_graph(WITH_BOOKS, FetchGraph::of(["books"])),
        )?
        .register(
            EntityDescriptor::new("Book", "books")
                .column(text("title").not_null())
                .relationship(RelationshipDescriptor::many_to_one("author", "Author"))
                .relationship(
                    RelationshipDescriptor::many_to_many("tags", "Tag")
                        .join_table("book_tags", "book_id", "tag_id"),
                ),
        )?
        .register(
            EntityDescriptor::new("Tag", "tags")
                .column(text("label").not_null().unique())
                .relationship(RelationshipDescriptor::many_to_many("books", "Book").mapped_by("tags")),
        )?
        .register(
            EntityDescriptor::new("Company", "companies")
                .id("id", ColumnType::Integer, IdStrategy::Identity)
                .column(text("name").not_null().unique())
                .relationship(
                    RelationshipDescriptor::one_to_many("users", "User")
                        .mapped_by("company")
                        .cascade(CascadeSet::of(&[CascadeOp::Persist, CascadeOp::Merge])),
                ),
        )?
        .register(
            EntityDescriptor::new("User", "")
                .abstract_type()
                .column(text("username").not_null().unique())
                .column(text("role"))
                .column(text("password").sensitive())
                .column(ColumnMapping::new("created_at", ColumnType::Timestamp))
                .embed(Embedded::new("personal_info", personal_info()))
                .relationship(RelationshipDescriptor::many_to_one("company", "Company"))
                .relationship(
                    RelationshipDescriptor::one_to_one("profile", "Profile")
                        .mapped_by("user")
                        .cascade(CascadeSet::all()),
                )
                .relationship(RelationshipDescriptor::one_to_many("chats", "UserChat").mapped_by("user")),
        )?
        .register(
            EntityDescriptor::new("Programmer", "programmers")
                .extends("User")
                .column(text("language")),
        )?
        .register(
            EntityDescriptor::new("Manager", "managers")
                .extends("User")
                .column(text("project")),
        )?
        .register(
            EntityDescriptor::new("Profile", "profiles")
                .column(text("street"))
                .column(text("language"))
                .relationship(RelationshipDescriptor::one_to_one("user", "User")),
        )?
        .register(
            EntityDescriptor::new("Chat", "chats")
                .column(text("name").not_null())
                .relationship(
                    RelationshipDescriptor::one_to_many("members", "UserChat")
                        .mapped_by("chat")
                        .cascade(CascadeSet::all())
                        .orphan_removal(true),
                ),
        )?
        .register(
            EntityDescriptor::new("UserChat", "users_chat")
                .id("id", ColumnType::Integer, IdStrategy::Identity)
                .column(ColumnMapping::new("created_at", ColumnType::Timestamp))
                .column(text("created_by"))
                .relationship(RelationshipDescriptor::many_to_one("user", "User"))
                .relationship(RelationshipDescriptor::many_to_one("chat", "Chat")),
        )?
        .register(
            EntityDescriptor::new("Course", "courses")
                .id("id", ColumnType::Integer, IdStrategy::Identity)
                .column(text("name").column("course_name").not_null().unique())
                .relationship(
                    RelationshipDescriptor::one_to_many("students", "Student")
                        .mapped_by("course")
                        .cascade(CascadeSet::all()),
                ),
        )?
        .register(
            EntityDescriptor::new("Student", "students")
                .id("id", ColumnType::Integer, IdStrategy::Identity)
                .column(text("name").column("student_name"))
                .relationship(RelationshipDescriptor::many_to_one("course", "Course").optional(false))
                .relationship(
                    RelationshipDescriptor::one_to_one("profile", "StudentProfile")
                        .mapped_by("student")
                        .cascade(CascadeSet::all()),
                ),
        )?
        .register(
            EntityDescriptor::new("StudentProfile", "student_profile")
                .column(text("grade"))
                .column(ColumnMapping::new("attendance", ColumnType::Real))
                .column(text("performance"))
                .relationship(RelationshipDescriptor::one_to_one("student", "Student")),
        )?;
    builder.validate()
}

/// Create the demo tables (idempotent)
pub fn install_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(DEMO_SCHEMA).map_err(from_rusqlite)?;
    tracing::debug!("demo schema installed");
    Ok(())
}

/// Persist `authors` authors with `books_per_author` books each in one
/// commit; the store numbers the authors in creation order
pub fn populate_library<S: RowStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    authors: usize,
    books_per_author: usize,
) -> relmap_core::Result<()> {
    for a in 1..=authors {
        let author = uow.create("Author")?;
        uow.set(author, "name", format!("Author {}", a))?;
        for b in 1..=books_per_author {
            let book = uow.create("Book")?;
            uow.set(book, "title", format!("Book {}.{}", a, b))?;
            uow.link(book, "author", author)?;
        }
        uow.persist(author)?;
    }
    uow.commit()
}

/// One author with the titles of their books
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shelf {
    pub author: String,
    pub titles: Vec<String>,
}

/// Outcome of reading the library with one strategy
#[derive(Debug, Clone)]
pub struct DemoReport {
    pub strategy: Strategy,
    pub shelves: Vec<Shelf>,
    pub statistics: Statistics,
}

/// Read every author and their books through `strategy`
pub fn read_shelves<S: RowStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    strategy: Strategy,
) -> relmap_core::Result<Vec<Shelf>> {
    let authors = uow.list(&strategy.query())?;
    let mut shelves = Vec::with_capacity(authors.len());
    for author in authors {
        let mut titles = Vec::new();
        for book in uow.related(author, "books")? {
            titles.push(uow.get(book, "title")?.as_str().unwrap_or_default().to_string());
        }
        shelves.push(Shelf {
            author: uow.get(author, "name")?.as_str().unwrap_or_default().to_string(),
            titles,
        });
    }
    Ok(shelves)
}

/// Populate an empty library and read it back with `strategy` in a fresh
/// unit of work
pub fn run<S: RowStore + ?Sized>(
    store: &mut S,
    strategy: Strategy,
    authors: usize,
    books_per_author: usize,
    config: &SessionConfig,
) -> Result<DemoReport> {
    let registry = registry(strategy).map_err(from_relmap)?;
    {
        let mut uow = UnitOfWork::with_config(&registry, &mut *store, config.clone());
        populate_library(&mut uow, authors, books_per_author).map_err(from_relmap)?;
    }
    let mut uow = UnitOfWork::with_config(&registry, &mut *store, config.clone());
    let shelves = read_shelves(&mut uow, strategy).map_err(from_relmap)?;
    tracing::info!(
        strategy = %strategy,
        queries = uow.statistics().queries_executed,
        authors = shelves.len() as u64,
        "library read"
    );
    Ok(DemoReport {
        strategy,
        shelves,
        statistics: uow.statistics(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_validates_for_every_strategy() {
        for strategy in Strategy::ALL {
            assert!(registry(strategy).is_ok(), "{strategy}");
        }
    }

    #[test]
    fn test_strategy_names_round_trip() {
        for strategy in Strategy::ALL {
            assert_eq!(strategy.to_string().parse::<Strategy>(), Ok(strategy));
        }
        assert!("hash".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_birthday_converter_keeps_calendar_date() {
        let converter = BirthdayConverter;
        let born = Utc.with_ymd_and_hms(1990, 5, 17, 0, 0, 0).unwrap();
        assert_eq!(converter.to_column(Value::Timestamp(born)), Ok(Value::from("1990-05-17")));
        assert_eq!(converter.to_field(Value::from("1990-05-17")), Ok(Value::Timestamp(born)));
        assert!(converter.to_field(Value::from("17/05/1990")).is_err());
    }

    #[test]
    fn test_schema_installs_twice() {
        let conn = Connection::open_in_memory().unwrap();
        install_schema(&conn).unwrap();
        install_schema(&conn).unwrap();
    }
}
