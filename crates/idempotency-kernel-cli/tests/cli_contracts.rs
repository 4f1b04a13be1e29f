#![allow(clippy::single_match_else)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use idempotency_kernel_core::{
    HttpMethod, MutationContext, ReplayCoordinator, StoredResponse, TriState,
    UpdateMemberProfileRequest,
};
use idempotency_kernel_store_sqlite::SqliteDedupStore;
use rusqlite::Connection;
use serde_json::{json, Value};
use ulid::Ulid;

fn ik_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ik"))
}

fn temp_db(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("ik-cli-{label}-{}.sqlite3", Ulid::new()))
}

fn cleanup(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut file = path.as_os_str().to_owned();
        file.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(file));
    }
}

fn ik_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(ik_binary_path());
    command
        .env_remove("IK_ISSUER")
        .env_remove("IK_LOG")
        .arg("--db")
        .arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run ik command {args:?}: {err}"),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn seed_profile_update(db_path: &Path, key: &str, email: &str) -> StoredResponse {
    let store = match SqliteDedupStore::open(db_path, "local") {
        Ok(value) => value,
        Err(err) => panic!("failed to open seed store: {err:#}"),
    };
    if let Err(err) = store.migrate() {
        panic!("failed to migrate seed store: {err:#}");
    }
    let coordinator = ReplayCoordinator::new(store);
    let body = UpdateMemberProfileRequest {
        email: TriState::Present(email.to_string()),
        ..UpdateMemberProfileRequest::default()
    };
    let context = MutationContext {
        idempotency_key: Some(key),
        caller: "user-1",
        method: HttpMethod::Patch,
        route: "/members/me",
    };
    match coordinator.execute(&context, &body, |canonical| {
        StoredResponse::json(200, &json!({ "email": canonical.email }))
    }) {
        Ok(outcome) => outcome.response,
        Err(err) => panic!("seed execution failed: {err}"),
    }
}

#[test]
fn help_lists_every_command() {
    let output = match Command::new(ik_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["migrate", "canonicalize", "lookup", "purge", "stats"] {
        assert!(stdout.contains(required), "help output missing `{required}`");
    }
}

#[test]
fn migrate_creates_schema_on_disk() {
    let db = temp_db("migrate");
    let output = ik_output(&db, &["migrate"]);
    assert!(output.status.success());
    assert_eq!(
        stdout_json(&output),
        json!({"issuer": "local", "schema_versions": [1]})
    );

    let conn = match Connection::open(&db) {
        Ok(value) => value,
        Err(err) => panic!("failed to open migrated db: {err}"),
    };
    let tables: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('idempotency_records', 'schema_migrations')",
        [],
        |row| row.get(0),
    ) {
        Ok(value) => value,
        Err(err) => panic!("failed to inspect schema: {err}"),
    };
    assert_eq!(tables, 2);

    drop(conn);
    cleanup(&db);
}

#[test]
fn canonicalize_prints_canonical_json_and_digest() {
    let db = temp_db("canonicalize");
    let spaced = stdout_json(&ik_output(
        &db,
        &["canonicalize", "--body", r#"{"displayName":"  Jane  Doe "}"#],
    ));
    let compact = stdout_json(&ik_output(
        &db,
        &["canonicalize", "--body", r#"{"displayName":"Jane Doe"}"#],
    ));

    assert_eq!(spaced["canonical"], json!(r#"{"displayName":"Jane Doe"}"#));
    assert_eq!(spaced["body_hash"], compact["body_hash"]);
    assert!(!db.exists(), "canonicalize must not create a database");
}

#[test]
fn canonicalize_rejects_malformed_body_with_failure_status() {
    let db = temp_db("malformed");
    let output = ik_output(&db, &["canonicalize", "--body", r#"{"displayName": 7}"#]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid request body"));
}

#[test]
fn lookup_finds_records_written_by_the_coordinator() {
    let db = temp_db("lookup");
    let response = seed_profile_update(&db, "abc-123", "a@x.com");

    let meta = stdout_json(&ik_output(
        &db,
        &[
            "lookup", "--key", "abc-123", "--caller", "user-1", "--method", "PATCH", "--route",
            "/members/me",
        ],
    ));
    assert_eq!(meta["found"], json!(true));
    assert_eq!(meta["record"]["status_code"], json!(0));
    assert_eq!(meta["record"]["content_type"], json!("text/plain"));

    let accepted = match meta["record"]["accepted_body_hash"].as_str() {
        Some(value) => value.to_string(),
        None => panic!("meta lookup missing accepted hash: {meta}"),
    };
    let cached = stdout_json(&ik_output(
        &db,
        &[
            "lookup", "--key", "abc-123", "--caller", "user-1", "--method", "PATCH", "--route",
            "/members/me", "--body-hash", &accepted,
        ],
    ));
    assert_eq!(cached["record"]["kind"], json!("response"));
    assert_eq!(
        cached["record"]["body"].as_str().map(str::as_bytes),
        Some(response.body.as_slice())
    );

    let other_caller = stdout_json(&ik_output(
        &db,
        &[
            "lookup", "--key", "abc-123", "--caller", "user-2", "--method", "PATCH", "--route",
            "/members/me",
        ],
    ));
    assert_eq!(other_caller["found"], json!(false));

    cleanup(&db);
}

#[test]
fn stats_and_purge_respect_issuer_scope() {
    let db = temp_db("stats");
    seed_profile_update(&db, "k1", "a@x.com");
    seed_profile_update(&db, "k2", "b@x.com");

    let stats = stdout_json(&ik_output(&db, &["stats"]));
    assert_eq!(stats["issuer"], json!("local"));
    assert_eq!(stats["meta_records"], json!(2));
    assert_eq!(stats["response_records"], json!(2));

    let other = stdout_json(&ik_output(&db, &["--issuer", "other", "stats"]));
    assert_eq!(other["meta_records"], json!(0));

    let purge = stdout_json(&ik_output(&db, &["purge", "--max-age-hours", "24"]));
    assert_eq!(purge["purged"], json!(0), "fresh records must survive purge");

    let rejected = ik_output(&db, &["purge", "--max-age-hours", "0"]);
    assert!(!rejected.status.success());

    cleanup(&db);
}
