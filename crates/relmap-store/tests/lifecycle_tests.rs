// Integration tests for cascades, orphan removal and atomic commit
// against SQLite with foreign keys enforced

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use common::{count, demo_file_store, demo_store, registry};
use relmap_core::{EntityState, ExErrorKind, Key, Query, RelmapError, UnitOfWork, Value};
use relmap_store::demo::{self, Strategy};

#[test]
fn test_orphaned_books_are_deleted() {
    // GIVEN an author with two books
    let mut store = demo_store();
    let registry = registry(Strategy::Lazy);
    {
        let mut uow = UnitOfWork::new(&registry, &mut store);
        demo::populate_library(&mut uow, 1, 2).unwrap();
    }

    // WHEN one book is removed from the author's collection
    {
        let mut uow = UnitOfWork::new(&registry, &mut store);
        let author = uow.get_by_key("Author", 1_i64).unwrap();
        let books = uow.related(author, "books").unwrap();
        uow.unlink(author, "books", books[0]).unwrap();
        uow.commit().unwrap();

        assert_eq!(uow.state(books[0]).unwrap(), EntityState::Transient);
    }

    // THEN the orphan row is gone
    assert_eq!(count(&store, "books"), 1);
    assert_eq!(count(&store, "authors"), 1);
}

#[test]
fn test_removing_author_cascades_to_books() {
    let mut store = demo_store();
    let registry = registry(Strategy::Lazy);
    {
        let mut uow = UnitOfWork::new(&registry, &mut store);
        demo::populate_library(&mut uow, 2, 3).unwrap();
    }

    {
        let mut uow = UnitOfWork::new(&registry, &mut store);
        let author = uow.get_by_key("Author", 1_i64).unwrap();
        uow.remove(author).unwrap();
        uow.commit().unwrap();
    }

    assert_eq!(count(&store, "authors"), 1);
    assert_eq!(count(&store, "books"), 3);
}

#[test]
fn test_unlinked_user_keeps_row_with_null_company() {
    // GIVEN a company with one programmer, no orphan removal on users
    let mut store = demo_store();
    let registry = registry(Strategy::Lazy);
    {
        let mut uow = UnitOfWork::new(&registry, &mut store);
        let company = uow.create("Company").unwrap();
        uow.set(company, "id", 1_i64).unwrap();
        uow.set(company, "name", "Initech").unwrap();
        let programmer = uow.create("Programmer").unwrap();
        uow.set(programmer, "username", "milton").unwrap();
        uow.set(programmer, "language", "rust").unwrap();
        uow.link(programmer, "company", company).unwrap();
        uow.persist(company).unwrap();
        uow.commit().unwrap();
    }

    // WHEN the programmer is removed from the company's users
    {
        let mut uow = UnitOfWork::new(&registry, &mut store);
        let company = uow.get_by_key("Company", 1_i64).unwrap();
        let users = uow.related(company, "users").unwrap();
        assert_eq!(users.len(), 1);
        uow.unlink(company, "users", users[0]).unwrap();
        uow.commit().unwrap();
    }

    // THEN the row survives with its foreign key cleared
    let company_id: Option<i64> = store
        .connection()
        .query_row("SELECT company_id FROM programmers WHERE username = 'milton'", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(company_id, None);
}

#[test]
fn test_unlinked_student_violates_not_null_and_rolls_back() {
    // GIVEN a course with one student whose course_id is NOT NULL
    let mut store = demo_store();
    let registry = registry(Strategy::Lazy);
    {
        let mut uow = UnitOfWork::new(&registry, &mut store);
        let course = uow.create("Course").unwrap();
        uow.set(course, "id", 10_i64).unwrap();
        uow.set(course, "name", "Databases").unwrap();
        let student = uow.create("Student").unwrap();
        uow.set(student, "name", "Ada").unwrap();
        uow.link(student, "course", course).unwrap();
        uow.persist(course).unwrap();
        uow.commit().unwrap();
    }

    // WHEN the student is removed from the course without orphan removal
    let err = {
        let mut uow = UnitOfWork::new(&registry, &mut store);
        let course = uow.get_by_key("Course", 10_i64).unwrap();
        let students = uow.related(course, "students").unwrap();
        uow.unlink(course, "students", students[0]).unwrap();
        let err = uow.commit().unwrap_err();
        assert_eq!(uow.statistics().rollbacks, 1);
        err
    };

    // THEN the store rejects the NULL and nothing changed
    assert!(matches!(err, RelmapError::ConstraintViolation { .. }));
    assert_eq!(err.kind(), ExErrorKind::ConstraintViolation);
    let course_id: i64 = store
        .connection()
        .query_row("SELECT course_id FROM students", [], |row| row.get(0))
        .unwrap();
    assert_eq!(course_id, 10);
}

#[test]
fn test_generated_keys_link_course_students_and_profiles() {
    // GIVEN a new course with two students and their profiles, no keys set
    let mut store = demo_store();
    let registry = registry(Strategy::Lazy);
    {
        let mut uow = UnitOfWork::new(&registry, &mut store);
        let course = uow.create("Course").unwrap();
        uow.set(course, "name", "Compilers").unwrap();
        for (name, grade) in [("Ada", "A"), ("Alan", "B")] {
            let student = uow.create("Student").unwrap();
            uow.set(student, "name", name).unwrap();
            uow.link(student, "course", course).unwrap();
            let profile = uow.create("StudentProfile").unwrap();
            uow.set(profile, "grade", grade).unwrap();
            uow.link(profile, "student", student).unwrap();
        }
        uow.persist(course).unwrap();

        // WHEN the graph is committed
        uow.commit().unwrap();

        // THEN the course carries the key SQLite assigned
        assert_eq!(uow.key(course).unwrap(), Some(Key::Int(1)));
    }

    // AND every foreign key points at a generated parent key
    let conn = store.connection();
    let orphaned_students: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM students s LEFT JOIN courses c ON c.id = s.course_id \
             WHERE c.id IS NULL",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(orphaned_students, 0);
    let matched: Vec<(String, String)> = conn
        .prepare(
            "SELECT s.student_name, p.grade FROM student_profile p \
             JOIN students s ON s.id = p.student_id ORDER BY s.id",
        )
        .unwrap()
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        matched,
        vec![
            ("Ada".to_string(), "A".to_string()),
            ("Alan".to_string(), "B".to_string())
        ]
    );

    // AND a fresh unit reaches the students through the generated key
    let mut uow = UnitOfWork::new(&registry, &mut store);
    let course = uow.get_by_key("Course", 1_i64).unwrap();
    assert_eq!(uow.related(course, "students").unwrap().len(), 2);
}

#[test]
fn test_failed_commit_writes_nothing() {
    // GIVEN a new author whose second book has no title
    let mut store = demo_store();
    let registry = registry(Strategy::Lazy);
    let err = {
        let mut uow = UnitOfWork::new(&registry, &mut store);
        let author = uow.create("Author").unwrap();
        uow.set(author, "id", 1_i64).unwrap();
        uow.set(author, "name", "Gogol").unwrap();
        for title in [Value::from("Dead Souls"), Value::Null] {
            let book = uow.create("Book").unwrap();
            uow.set(book, "title", title).unwrap();
            uow.link(book, "author", author).unwrap();
        }
        uow.persist(author).unwrap();

        // WHEN the unit commits
        let err = uow.commit().unwrap_err();
        assert_eq!(uow.state(author).unwrap(), EntityState::Persistent);
        err
    };

    // THEN the insert of the author was rolled back with the rest
    assert_eq!(err.kind(), ExErrorKind::ConstraintViolation);
    assert_eq!(count(&store, "authors"), 0);
    assert_eq!(count(&store, "books"), 0);
}

#[test]
fn test_inverse_side_alone_is_not_persisted() {
    // GIVEN a stored author and a stored book without an author
    let mut store = demo_store();
    let registry = registry(Strategy::Lazy);
    {
        let mut uow = UnitOfWork::new(&registry, &mut store);
        demo::populate_library(&mut uow, 1, 0).unwrap();
        let book = uow.create("Book").unwrap();
        uow.set(book, "id", "stray").unwrap();
        uow.set(book, "title", "Stray").unwrap();
        uow.persist(book).unwrap();
        uow.commit().unwrap();
    }

    // WHEN only the author's collection is changed
    {
        let mut uow = UnitOfWork::new(&registry, &mut store);
        let author = uow.get_by_key("Author", 1_i64).unwrap();
        let book = uow.get_by_key("Book", "stray").unwrap();
        uow.add_to(author, "books", book).unwrap();
        uow.commit().unwrap();
    }

    // THEN the foreign key column is untouched
    let author_id: Option<i64> = store
        .connection()
        .query_row("SELECT author_id FROM books WHERE id = 'stray'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(author_id, None);

    // AND setting the owning side writes it
    {
        let mut uow = UnitOfWork::new(&registry, &mut store);
        let author = uow.get_by_key("Author", 1_i64).unwrap();
        let book = uow.get_by_key("Book", "stray").unwrap();
        uow.set_reference(book, "author", Some(author)).unwrap();
        uow.commit().unwrap();
    }
    let author_id: Option<i64> = store
        .connection()
        .query_row("SELECT author_id FROM books WHERE id = 'stray'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(author_id, Some(1));
}

#[test]
fn test_many_to_many_writes_join_rows() {
    let mut store = demo_store();
    let registry = registry(Strategy::Lazy);
    {
        let mut uow = UnitOfWork::new(&registry, &mut store);
        let book = uow.create("Book").unwrap();
        uow.set(book, "title", "Eugene Onegin").unwrap();
        for label in ["novel", "verse"] {
            let tag = uow.create("Tag").unwrap();
            uow.set(tag, "label", label).unwrap();
            uow.persist(tag).unwrap();
            uow.link(book, "tags", tag).unwrap();
        }
        uow.persist(book).unwrap();
        uow.commit().unwrap();

        assert_eq!(uow.statistics().link_rows_inserted, 2);
    }
    assert_eq!(count(&store, "book_tags"), 2);

    // Reading the inverse side goes through the join table
    let mut uow = UnitOfWork::new(&registry, &mut store);
    let tags = uow.list(&Query::new("Tag").filter("label", "verse")).unwrap();
    assert_eq!(tags.len(), 1);
    let books = uow.related(tags[0], "books").unwrap();
    assert_eq!(books.len(), 1);
    assert_eq!(uow.get(books[0], "title").unwrap(), Value::from("Eugene Onegin"));
}

#[test]
fn test_polymorphic_query_returns_every_subtype() {
    let mut store = demo_store();
    let registry = registry(Strategy::Lazy);
    {
        let mut uow = UnitOfWork::new(&registry, &mut store);
        for (entity_type, username) in [("Programmer", "ada"), ("Manager", "grace")] {
            let user = uow.create(entity_type).unwrap();
            uow.set(user, "username", username).unwrap();
            uow.set(user, "password", "secret").unwrap();
            uow.persist(user).unwrap();
        }
        uow.commit().unwrap();
    }

    let mut uow = UnitOfWork::new(&registry, &mut store);
    let users = uow.list(&Query::new("User")).unwrap();

    let mut found: Vec<(String, String)> = users
        .iter()
        .map(|u| {
            (
                uow.entity_type(*u).unwrap().to_string(),
                uow.get(*u, "username").unwrap().as_str().unwrap().to_string(),
            )
        })
        .collect();
    found.sort();
    assert_eq!(
        found,
        vec![
            ("Manager".to_string(), "grace".to_string()),
            ("Programmer".to_string(), "ada".to_string()),
        ]
    );
    assert_eq!(uow.statistics().queries_executed, 1);
}

#[test]
fn test_lazy_access_after_close_fails() {
    let mut store = demo_store();
    let registry = registry(Strategy::Lazy);
    {
        let mut uow = UnitOfWork::new(&registry, &mut store);
        demo::populate_library(&mut uow, 1, 1).unwrap();
    }

    let mut uow = UnitOfWork::new(&registry, &mut store);
    let author = uow.get_by_key("Author", 1_i64).unwrap();
    uow.close();

    let err = uow.related(author, "books").unwrap_err();
    assert_eq!(err.kind(), ExErrorKind::LazyInitialization);
}

#[test]
fn test_merge_from_closed_unit_on_another_connection() {
    // GIVEN two connections to one database file
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("library.db");
    let mut store_a = demo_file_store(&path, 1_000);
    let mut store_b = demo_file_store(&path, 1_000);
    let registry = registry(Strategy::Lazy);
    {
        let mut uow = UnitOfWork::new(&registry, &mut store_a);
        demo::populate_library(&mut uow, 1, 2).unwrap();
    }

    // WHEN an author read through the first is edited after its unit closed
    let mut source = UnitOfWork::new(&registry, &mut store_a);
    let author = source.get_by_key("Author", 1_i64).unwrap();
    source.close();
    source.set(author, "name", "Renamed").unwrap();

    // AND merged into a unit on the second connection
    {
        let mut target = UnitOfWork::new(&registry, &mut store_b);
        let merged = target.merge_from(&source, author).unwrap();
        assert_eq!(target.state(merged).unwrap(), EntityState::Persistent);
        target.commit().unwrap();
        assert_eq!(target.statistics().updates, 1);
    }
    drop(source);

    // THEN the change is stored and the books are untouched
    let name: String = store_a
        .connection()
        .query_row("SELECT name FROM authors WHERE id = 1", [], |row| row.get(0))
        .unwrap();
    assert_eq!(name, "Renamed");
    assert_eq!(count(&store_a, "books"), 2);
}

#[test]
fn test_lock_contention_surfaces_as_timeout() {
    // GIVEN a second connection holding the write lock
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("locked.db");
    let mut holder = demo_file_store(&path, 1_000);
    let mut store = demo_file_store(&path, 50);
    relmap_core::RowStore::begin_transaction(&mut holder).unwrap();

    // WHEN a unit of work commits through the first
    let registry = registry(Strategy::Lazy);
    let mut uow = UnitOfWork::new(&registry, &mut store);
    let err = demo::populate_library(&mut uow, 1, 0).unwrap_err();

    // THEN the busy timeout expires and is reported as such
    assert_eq!(err.kind(), ExErrorKind::Timeout);
    assert_eq!(uow.statistics().commits, 0);
}

#[test]
fn test_personal_info_round_trips_through_user_tables() {
    // GIVEN a programmer with an embedded personal info and a birth date
    let mut store = demo_store();
    let registry = registry(Strategy::Lazy);
    let born = Utc.with_ymd_and_hms(1987, 3, 9, 0, 0, 0).unwrap();
    {
        let mut uow = UnitOfWork::new(&registry, &mut store);
        let programmer = uow.create("Programmer").unwrap();
        uow.set(programmer, "username", "ada").unwrap();
        let info = BTreeMap::from([
            ("first_name".to_string(), Value::from("Ada")),
            ("last_name".to_string(), Value::from("Lovelace")),
            ("birth_date".to_string(), Value::Timestamp(born)),
        ]);
        uow.set_component(programmer, "personal_info", Some(&info)).unwrap();
        uow.persist(programmer).unwrap();

        // WHEN it is committed
        uow.commit().unwrap();
    }

    // THEN the members land in the user's own columns, the date as a calendar date
    let (first, birth): (String, String) = store
        .connection()
        .query_row(
            "SELECT first_name, birth_date FROM programmers WHERE username = 'ada'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!((first.as_str(), birth.as_str()), ("Ada", "1987-03-09"));

    // AND a polymorphic query filtered on the converted field reads it back whole
    {
        let mut uow = UnitOfWork::new(&registry, &mut store);
        let users = uow
            .list(&Query::new("User").filter("personal_info.birth_date", born))
            .unwrap();
        assert_eq!(users.len(), 1);
        let info = uow.component(users[0], "personal_info").unwrap().unwrap();
        assert_eq!(info["last_name"], Value::from("Lovelace"));
        assert_eq!(info["birth_date"], Value::Timestamp(born));

        // WHEN the component is cleared
        uow.set_component(users[0], "personal_info", None).unwrap();
        uow.commit().unwrap();
    }

    // THEN every member column is null and the component reads as absent
    let mut uow = UnitOfWork::new(&registry, &mut store);
    let users = uow.list(&Query::new("Programmer").filter("username", "ada")).unwrap();
    assert_eq!(uow.component(users[0], "personal_info").unwrap(), None);
    assert!(matches!(
        uow.set_component(
            users[0],
            "personal_info",
            Some(&BTreeMap::from([("nickname".to_string(), Value::from("A"))]))
        ),
        Err(RelmapError::UnknownField { .. })
    ));
}
