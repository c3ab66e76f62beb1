//! CLI integration tests
//!
//! Run the built binary in a temporary directory holding a `relmap.toml`
//! that silences logging.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

use rusqlite::Connection;
use tempfile::TempDir;

fn setup_dir() -> TempDir {
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("relmap.toml"),
        "[logging]\nprofile = \"test\"\n",
    )
    .unwrap();
    temp_dir
}

fn run(temp_dir: &TempDir, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_relmap-cli"))
        .current_dir(temp_dir.path())
        .args(args)
        .output()
        .expect("Failed to execute CLI")
}

fn stdout(output: &Output) -> String {
    assert!(
        output.status.success(),
        "CLI command should succeed. Stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn store_fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("relmap-store")
        .join("tests")
        .join("fixtures")
        .join(name)
}

#[test]
fn test_demo_reports_query_count() {
    let temp_dir = setup_dir();

    let out = stdout(&run(&temp_dir, &["demo", "batched"]));

    assert_eq!(out.trim(), "batched  25 authors, 100 books: 4 queries");
}

#[test]
fn test_demo_runs_every_strategy() {
    let temp_dir = setup_dir();

    let out = stdout(&run(&temp_dir, &["demo", "--authors", "5", "--books", "2"]));

    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 5);
    assert!(lines[0].starts_with("lazy"));
    assert!(lines[0].ends_with("6 queries"));
    assert!(lines[2].starts_with("join"));
    assert!(lines[2].ends_with("1 queries"));
}

#[test]
fn test_demo_json_output() {
    let temp_dir = setup_dir();

    let out = stdout(&run(&temp_dir, &["demo", "graph", "--json"]));

    let summary: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
    assert_eq!(summary["strategy"], "graph");
    assert_eq!(summary["books"], 100);
    assert_eq!(summary["statistics"]["queries_executed"], 2);
}

#[test]
fn test_unknown_strategy_is_rejected() {
    let temp_dir = setup_dir();

    let output = run(&temp_dir, &["demo", "hash"]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown strategy"));
}

#[test]
fn test_explain_join_fetch() {
    let temp_dir = setup_dir();

    let out = stdout(&run(&temp_dir, &["explain", "join"]));

    assert!(out.starts_with("Author\n  books (one-to-many -> Book): join\n"));
    assert!(out.contains("estimated statements: 1"));
}

#[test]
fn test_explain_lazy_has_no_plan() {
    let temp_dir = setup_dir();

    let out = stdout(&run(&temp_dir, &["explain", "lazy"]));

    assert!(out.starts_with("Author\n"));
    assert!(out.contains("load on first access"));
}

#[test]
fn test_seed_import_writes_database() {
    let temp_dir = setup_dir();
    let db_path = temp_dir.path().join("library.db");
    let fixture = store_fixture("library.yaml");

    let out = stdout(&run(
        &temp_dir,
        &[
            "seed",
            "import",
            fixture.to_str().unwrap(),
            "--db",
            db_path.to_str().unwrap(),
        ],
    ));

    assert!(out.contains("Imported 7 entities, 3 references, 4 links"));
    let conn = Connection::open(&db_path).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM book_tags", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 4);
}

#[test]
fn test_invalid_config_is_reported() {
    let temp_dir = setup_dir();
    fs::write(temp_dir.path().join("bad.toml"), "[logging]\nprofile = 3\n").unwrap();

    let output = run(&temp_dir, &["--config", "bad.toml", "explain", "lazy"]);

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid relmap.toml"));
}
