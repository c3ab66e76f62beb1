//! Registry Tests
//!
//! Validation of descriptors, inheritance flattening and association
//! resolution.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::library_registry;
use relmap_core::registry::AssociationMapping;
use relmap_core::{
    ColumnMapping, ColumnType, EntityDescriptor, FetchGraph, IdStrategy, Registry,
    RelationshipDescriptor, RelmapError,
};

fn validate(descriptors: Vec<EntityDescriptor>) -> relmap_core::Result<Registry> {
    let mut builder = Registry::builder();
    for descriptor in descriptors {
        builder.register(descriptor)?;
    }
    builder.validate()
}

#[test]
fn test_duplicate_registration_is_rejected() {
    let mut builder = Registry::builder();
    builder.register(EntityDescriptor::new("Author", "authors")).unwrap();

    let err = builder
        .register(EntityDescriptor::new("Author", "writers"))
        .unwrap_err();

    assert_eq!(
        err,
        RelmapError::DuplicateMapping {
            entity_type: "Author".to_string()
        }
    );
}

#[test]
fn test_unregistered_target_is_unresolved() {
    let err = validate(vec![EntityDescriptor::new("Book", "books")
        .relationship(RelationshipDescriptor::many_to_one("publisher", "Publisher"))])
    .unwrap_err();

    match err {
        RelmapError::UnresolvedReference { member, target, .. } => {
            assert_eq!(member, "publisher");
            assert_eq!(target, "Publisher");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_unknown_mapped_by_is_unresolved() {
    let err = validate(vec![
        EntityDescriptor::new("Author", "authors")
            .relationship(RelationshipDescriptor::one_to_many("books", "Book").mapped_by("writer")),
        EntityDescriptor::new("Book", "books")
            .relationship(RelationshipDescriptor::many_to_one("author", "Author")),
    ])
    .unwrap_err();

    assert!(matches!(err, RelmapError::UnresolvedReference { .. }));
}

#[test]
fn test_one_to_many_must_be_inverse() {
    let err = validate(vec![
        EntityDescriptor::new("Author", "authors")
            .relationship(RelationshipDescriptor::one_to_many("books", "Book")),
        EntityDescriptor::new("Book", "books"),
    ])
    .unwrap_err();

    assert!(matches!(err, RelmapError::InvalidMapping { .. }));
}

#[test]
fn test_owning_many_to_many_needs_join_table() {
    let err = validate(vec![
        EntityDescriptor::new("Book", "books")
            .relationship(RelationshipDescriptor::many_to_many("tags", "Tag")),
        EntityDescriptor::new("Tag", "tags"),
    ])
    .unwrap_err();

    assert!(matches!(err, RelmapError::InvalidMapping { .. }));
}

#[test]
fn test_uuid_strategy_needs_text_key() {
    let err = validate(vec![EntityDescriptor::new("Author", "authors").id(
        "id",
        ColumnType::Integer,
        IdStrategy::Uuid,
    )])
    .unwrap_err();

    assert!(matches!(err, RelmapError::InvalidMapping { .. }));
}

#[test]
fn test_orphan_removal_on_many_to_one_is_rejected() {
    let err = validate(vec![
        EntityDescriptor::new("Author", "authors"),
        EntityDescriptor::new("Book", "books").relationship(
            RelationshipDescriptor::many_to_one("author", "Author").orphan_removal(true),
        ),
    ])
    .unwrap_err();

    assert!(matches!(err, RelmapError::InvalidMapping { .. }));
}

#[test]
fn test_inheritance_cycle_is_rejected() {
    let err = validate(vec![
        EntityDescriptor::new("A", "a").extends("B"),
        EntityDescriptor::new("B", "b").extends("A"),
    ])
    .unwrap_err();

    assert!(matches!(err, RelmapError::InvalidMapping { .. }));
}

#[test]
fn test_invalid_named_graph_fails_validation() {
    let err = validate(vec![EntityDescriptor::new("Author", "authors")
        .named_graph("everything", FetchGraph::of(["books"]))])
    .unwrap_err();

    assert!(matches!(err, RelmapError::InvalidMapping { .. }));
}

#[test]
fn test_subtype_inherits_key_and_columns() {
    let registry = library_registry();

    let programmer = registry.describe("Programmer").unwrap();
    let fields: Vec<&str> = programmer.columns.iter().map(|c| c.field.as_str()).collect();

    assert_eq!(fields, vec!["login", "password", "language"]);
    assert_eq!(programmer.primary_key.field, "id");
    assert_eq!(registry.root_of("Programmer").unwrap(), "User");
    assert!(registry.is_a("Programmer", "User"));
    assert!(!registry.is_a("User", "Programmer"));
    assert!(registry.describe("Programmer").unwrap().column_for("password").unwrap().sensitive);
}

#[test]
fn test_abstract_root_reads_through_union_of_variants() {
    let registry = library_registry();

    let user = registry.entity("User").unwrap();
    let programmer = registry.entity("Programmer").unwrap();

    assert_eq!(user.variants, vec!["Manager", "Programmer"]);
    assert!(user.source.polymorphic);
    assert!(user.source.from.contains(" UNION ALL "));
    assert!(user.source.from.contains("NULL AS language"));
    assert_eq!(
        user.source.columns,
        vec!["id", "login", "password", "reports", "language"]
    );
    assert!(!programmer.source.polymorphic);
    assert_eq!(programmer.source.from, "programmers");
}

#[test]
fn test_relationship_sides_resolve_to_one_mapping() {
    let registry = library_registry();

    let owning = registry.relationship("Book", "author").unwrap();
    let inverse = registry.relationship("Author", "books").unwrap();

    assert!(owning.is_owning());
    assert!(!inverse.is_owning());
    assert_eq!(owning.inverse.as_deref(), Some("books"));
    assert_eq!(inverse.inverse.as_deref(), Some("author"));
    assert_eq!(
        owning.mapping,
        AssociationMapping::FkOnSource {
            column: "author_id".to_string()
        }
    );
    assert_eq!(
        inverse.mapping,
        AssociationMapping::FkOnTarget {
            column: "author_id".to_string()
        }
    );
}

#[test]
fn test_inverse_many_to_many_swaps_link_columns() {
    let registry = library_registry();

    let mapping = &registry.relationship("Tag", "books").unwrap().mapping;

    assert_eq!(
        mapping,
        &AssociationMapping::JoinTable {
            table: "book_tags".to_string(),
            owner_column: "tag_id".to_string(),
            target_column: "book_id".to_string(),
        }
    );
}

#[test]
fn test_link_references_cover_both_sides() {
    let registry = library_registry();

    assert_eq!(
        registry.link_references("Book"),
        vec![("book_tags".to_string(), "book_id".to_string())]
    );
    assert_eq!(
        registry.link_references("Tag"),
        vec![("book_tags".to_string(), "tag_id".to_string())]
    );
    assert!(registry.link_references("Author").is_empty());
}

#[test]
fn test_unknown_lookups_fail() {
    let registry = library_registry();

    assert!(matches!(
        registry.entity("Publisher"),
        Err(RelmapError::UnknownEntityType { .. })
    ));
    assert!(matches!(
        registry.relationship("Author", "publisher"),
        Err(RelmapError::UnknownRelationship { .. })
    ));
}

#[test]
fn test_entity_types_are_listed_in_name_order() {
    let registry = validate(vec![
        EntityDescriptor::new("Tag", "tags")
            .column(ColumnMapping::new("label", ColumnType::Text)),
        EntityDescriptor::new("Author", "authors"),
    ])
    .unwrap();

    assert_eq!(registry.entity_types().collect::<Vec<_>>(), vec!["Author", "Tag"]);
}

#[test]
fn test_generated_keys_need_integer_column() {
    let err = validate(vec![EntityDescriptor::new("Course", "courses").id(
        "code",
        ColumnType::Text,
        IdStrategy::Identity,
    )])
    .unwrap_err();

    assert!(matches!(err, RelmapError::InvalidMapping { .. }));
}

#[test]
fn test_generated_keys_cannot_span_hierarchy_tables() {
    let err = validate(vec![
        EntityDescriptor::new("User", "")
            .abstract_type()
            .id("id", ColumnType::Integer, IdStrategy::Identity),
        EntityDescriptor::new("Programmer", "programmers").extends("User"),
        EntityDescriptor::new("Manager", "managers").extends("User"),
    ])
    .unwrap_err();

    match err {
        RelmapError::InvalidMapping { entity_type, reason } => {
            assert_eq!(entity_type, "User");
            assert!(reason.contains("inheritance"), "{reason}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
