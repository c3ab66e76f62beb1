// Integration tests for seed parsing and import

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{count, demo_store, fixtures_dir, registry};
use relmap_core::{ExErrorKind, SessionConfig, UnitOfWork, Value};
use relmap_store::demo::Strategy;
use relmap_store::seed::{import_seed, import_seed_file, parse_seed_file, parse_seed_str};

#[test]
fn test_parse_library_seed() {
    // Given: The library fixture
    let path = fixtures_dir().join("library.yaml");

    // When: We parse it
    let seed = parse_seed_file(&path).unwrap();

    // Then: Entities keep file order and references are read
    assert_eq!(seed.schema_version, 0);
    assert_eq!(seed.entities.len(), 7);
    assert_eq!(seed.entities[0].entity_type, "Author");
    assert_eq!(seed.entities[0].get("id"), Some(&Value::Integer(1)));
    assert_eq!(seed.entities[2].references.len(), 1);
    assert_eq!(seed.links.len(), 4);
}

#[test]
fn test_reject_invalid_schema_version() {
    let path = fixtures_dir().join("seed_invalid_schema_version.yaml");

    let err = parse_seed_file(&path).unwrap_err();

    assert_eq!(err.kind(), ExErrorKind::InvalidInput);
    assert!(err.message().contains("Unsupported schema_version: 2"));
}

#[test]
fn test_missing_file_is_reported() {
    let err = parse_seed_file(&fixtures_dir().join("nope.yaml")).unwrap_err();
    assert!(err.message().contains("Failed to read seed file"));
}

#[test]
fn test_import_library_seed() {
    // Given: An empty demo database
    let mut store = demo_store();
    let registry = registry(Strategy::Lazy);

    // When: The library seed is imported
    let report = import_seed_file(
        &fixtures_dir().join("library.yaml"),
        &registry,
        &mut store,
        &SessionConfig::default(),
    )
    .unwrap();

    // Then: Rows, foreign keys and join rows are written
    assert_eq!(report.entities, 7);
    assert_eq!(report.references, 3);
    assert_eq!(report.links, 4);
    assert_eq!(count(&store, "authors"), 2);
    assert_eq!(count(&store, "books"), 3);
    assert_eq!(count(&store, "tags"), 2);
    assert_eq!(count(&store, "book_tags"), 4);

    let author_id: i64 = store
        .connection()
        .query_row("SELECT author_id FROM books WHERE id = 'b3'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(author_id, 2);
}

#[test]
fn test_import_resolves_references_against_store() {
    // Given: A database that already holds author 1
    let mut store = demo_store();
    let registry = registry(Strategy::Lazy);
    let authors = parse_seed_str(
        "schema_version: 0\nentities:\n  - entity_type: Author\n    values: { id: 1, name: Pushkin }\n",
    )
    .unwrap();
    {
        let mut uow = UnitOfWork::new(&registry, &mut store);
        import_seed(&authors, &mut uow).unwrap();
    }

    // When: A second seed references that author
    let books = parse_seed_str(
        r#"
schema_version: 0
entities:
  - entity_type: Book
    values: { id: b1, title: Poltava }
    references: { author: 1 }
"#,
    )
    .unwrap();
    let mut uow = UnitOfWork::new(&registry, &mut store);
    let report = import_seed(&books, &mut uow).unwrap();

    // Then: The reference is resolved through a lookup (plus the load of
    // the author's books when the inverse side is updated)
    assert_eq!(report.references, 1);
    assert_eq!(uow.statistics().queries_executed, 2);
    let author = uow.get_by_key("Author", 1_i64).unwrap();
    assert_eq!(uow.related(author, "books").unwrap().len(), 1);
}

#[test]
fn test_unknown_reference_writes_nothing() {
    let mut store = demo_store();
    let registry = registry(Strategy::Lazy);

    let err = import_seed_file(
        &fixtures_dir().join("seed_unknown_reference.yaml"),
        &registry,
        &mut store,
        &SessionConfig::default(),
    )
    .unwrap_err();

    assert_eq!(err.kind(), ExErrorKind::InvalidInput);
    assert!(err.message().contains("unknown Author with key 99"));
    assert_eq!(count(&store, "books"), 0);
}

#[test]
fn test_unknown_entity_type_is_rejected() {
    let mut store = demo_store();
    let registry = registry(Strategy::Lazy);
    let seed = parse_seed_str(
        "schema_version: 0\nentities:\n  - entity_type: Publisher\n    values: { name: Penguin }\n",
    )
    .unwrap();

    let mut uow = UnitOfWork::new(&registry, &mut store);
    let err = import_seed(&seed, &mut uow).unwrap_err();

    assert_eq!(err.entity_type(), Some("Publisher"));
}
