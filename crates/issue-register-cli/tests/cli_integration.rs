use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_ir<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_ir"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute ir binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_ir(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!("ir command failed (status={}):\nstdout:\n{}\nstderr:\n{}", output.status, stdout, stderr);
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout).unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn pointer_u64(value: &Value, pointer: &str) -> u64 {
    value
        .pointer(pointer)
        .and_then(Value::as_u64)
        .unwrap_or_else(|| panic!("missing integer at `{pointer}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_file(path: &Path, body: &str) {
    fs::write(path, body).unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
}

#[test]
fn db_migrate_reports_plan_then_up_to_date() {
    let dir = unique_temp_dir("ir-cli-migrate");
    let db = dir.join("register.sqlite3");

    let plan = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(as_str(&plan, "contract_version"), "cli.v1");
    assert_eq!(plan.get("dry_run").and_then(Value::as_bool), Some(true));
    assert_eq!(plan.get("would_apply_versions"), Some(&serde_json::json!([1, 2])));

    let applied = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(applied.get("up_to_date").and_then(Value::as_bool), Some(true));

    let status = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(status.get("up_to_date").and_then(Value::as_bool), Some(true));

    let integrity = run_json(["--db", path_str(&db), "db", "integrity-check"]);
    assert_eq!(integrity.get("quick_check_ok").and_then(Value::as_bool), Some(true));
}

#[test]
fn stale_issue_edit_exits_non_zero_with_conflict_message() {
    let dir = unique_temp_dir("ir-cli-stale");
    let db = dir.join("register.sqlite3");
    let db = path_str(&db);

    let created =
        run_json(["--db", db, "issue", "create", "--title", "Office lease renewal", "--domain", "Facilities"]);
    let issue_id = as_str(&created, "id").to_string();
    assert_eq!(created.get("revision").and_then(Value::as_u64), Some(1));

    let edited =
        run_json(["--db", db, "issue", "edit", &issue_id, "--base-revision", "1", "--owner", "dana"]);
    assert_eq!(edited.get("revision").and_then(Value::as_u64), Some(2));

    let stale = run_ir(["--db", db, "issue", "edit", &issue_id, "--base-revision", "1", "--title", "Lease"]);
    assert!(!stale.status.success());
    assert!(stale.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&stale.stderr);
    assert!(stderr.contains("stale revision"), "unexpected stderr: {stderr}");

    let history = run_json(["--db", db, "issue", "history", &issue_id]);
    assert_eq!(history.get("payload").and_then(Value::as_array).map(Vec::len), Some(2));
}

#[test]
fn ingest_pending_confirm_and_report_flow() {
    let dir = unique_temp_dir("ir-cli-ingest");
    let db = dir.join("register.sqlite3");
    let db = path_str(&db);

    let seed = dir.join("seed.ndjson");
    write_file(
        &seed,
        "{\"source_id\":\"doc-1\",\"text\":\"Supplier lead times slipped to twelve weeks\",\"domain\":\"Supply Chain\"}\n",
    );
    let first = run_json(["--db", db, "ingest", "run", "--file", path_str(&seed)]);
    assert_eq!(pointer_u64(&first, "/summary/created"), 1);

    let batch = dir.join("batch.json");
    write_file(
        &batch,
        r#"[
            {"source_id":"doc-2","text":"Supplier lead times now affect the spring launch","domain":"Supply Chain"},
            {"source_id":"doc-3","text":"Office lease renewal due in March","domain":"Facilities"}
        ]"#,
    );
    let second = run_json(["--db", db, "ingest", "run", "--file", path_str(&batch)]);
    assert_eq!(pointer_u64(&second, "/summary/pending"), 1);
    assert_eq!(pointer_u64(&second, "/summary/created"), 1);

    let pending = run_json(["--db", db, "pending", "list", "--status", "pending"]);
    let pending_id = pending
        .pointer("/payload/0/pending_id")
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing pending id: {pending}"))
        .to_string();
    let shown = run_json(["--db", db, "pending", "show", &pending_id]);
    assert_eq!(as_str(&shown, "status"), "pending");
    assert_eq!(shown.pointer("/candidate/source_id").and_then(Value::as_str), Some("doc-2"));

    let confirmed = run_json(["--db", db, "pending", "confirm", &pending_id, "--note", "same supplier"]);
    assert_eq!(as_str(&confirmed, "outcome"), "revised");
    let resolved = run_json(["--db", db, "pending", "show", &pending_id]);
    assert_eq!(as_str(&resolved, "status"), "confirmed");
    assert_eq!(as_str(&resolved, "resolution_note"), "same supplier");

    let cited = run_json(["--db", db, "source", "evidence", "--source-id", "doc-2"]);
    let links = cited.get("payload").and_then(Value::as_array).unwrap_or_else(|| panic!("missing payload: {cited}"));
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].get("issue_id"), confirmed.get("issue_id"));

    let meetings = run_json(["--db", db, "source", "evidence", "--source-kind", "meeting", "--source-id", "doc-2"]);
    assert_eq!(meetings.get("payload").and_then(Value::as_array).map(Vec::len), Some(0));

    let unknown = run_ir(["--db", db, "pending", "show", "01ARZ3NDEKTSV4RRFFQ69G5FAV"]);
    assert!(!unknown.status.success());

    let last_run = run_json(["--db", db, "ingest", "last-run"]);
    assert!(last_run.get("finished_at").and_then(Value::as_str).is_some());

    let report = run_json(["--db", db, "report", "--start", "2000-01-01", "--end", "2999-12-31"]);
    assert_eq!(report.get("recent_issues").and_then(Value::as_array).map(Vec::len), Some(2));
    assert_eq!(report.get("system_revisions").and_then(Value::as_array).map(Vec::len), Some(2));
}

#[test]
fn merge_suggestions_need_config_opt_in() {
    let dir = unique_temp_dir("ir-cli-merges");
    let db = dir.join("register.sqlite3");
    let db = path_str(&db);
    run_json(["--db", db, "issue", "create", "--title", "Supplier lead times slipped", "--domain", "Supply Chain"]);
    run_json([
        "--db",
        db,
        "issue",
        "create",
        "--title",
        "Supplier lead times slipped again",
        "--domain",
        "Supply Chain",
    ]);

    let disabled = run_ir(["--db", db, "merges", "suggest"]);
    assert!(!disabled.status.success());
    assert!(String::from_utf8_lossy(&disabled.stderr).contains("merge detection is disabled"));

    let config = dir.join("config.yaml");
    write_file(&config, "merge_detection:\n  enabled: true\n  threshold: 0.6\n");
    let suggestions = run_json(["--db", db, "--config", path_str(&config), "merges", "suggest"]);
    assert_eq!(suggestions.get("payload").and_then(Value::as_array).map(Vec::len), Some(1));

    let bad_config = dir.join("bad.yaml");
    write_file(&bad_config, "merge_detection:\n  enabled: true\n");
    let rejected = run_ir(["--db", db, "--config", path_str(&bad_config), "merges", "suggest"]);
    assert!(!rejected.status.success());
    assert!(String::from_utf8_lossy(&rejected.stderr).contains("threshold MUST be set"));
}

#[test]
fn document_tags_create_meetings_that_drive_the_agenda() {
    let dir = unique_temp_dir("ir-cli-agenda");
    let db = dir.join("register.sqlite3");
    let db = path_str(&db);

    let document = run_json([
        "--db",
        db,
        "source",
        "add-document",
        "--title",
        "Ops sync notes",
        "--path",
        "/library/ops-sync.epub",
        "--tag",
        "Meetings.2025-03-04",
        "--tag",
        "Ops",
    ]);
    let meeting_id = document
        .pointer("/meetings/0/source_id")
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing meeting: {document}"))
        .to_string();

    let issue = run_json(["--db", db, "issue", "create", "--title", "Scanner outages", "--domain", "Operations"]);
    let issue_id = as_str(&issue, "id").to_string();
    run_json([
        "--db",
        db,
        "issue",
        "link-evidence",
        &issue_id,
        "--source-kind",
        "meeting",
        "--source-id",
        &meeting_id,
        "--excerpt",
        "scanners dropped twice",
        "--observed-at",
        "2025-03-04T15:30:00Z",
    ]);

    let agenda = run_json(["--db", db, "agenda", "--as-of", "2025-03-05T09:00:00Z", "--window-days", "7"]);
    assert_eq!(agenda.pointer("/payload/0/issue_id").and_then(Value::as_str), Some(issue_id.as_str()));

    let quiet = run_json(["--db", db, "agenda", "--as-of", "2025-06-01T09:00:00Z"]);
    assert_eq!(quiet.get("payload").and_then(Value::as_array).map(Vec::len), Some(0));
}

#[test]
fn export_import_and_backup_restore_round_trip() {
    let dir = unique_temp_dir("ir-cli-snapshot");
    let source_db = dir.join("source.sqlite3");
    let target_db = dir.join("target.sqlite3");
    let restored_db = dir.join("restored.sqlite3");
    let export_dir = dir.join("export");
    let backup = dir.join("backup.sqlite3");

    run_json(["--db", path_str(&source_db), "issue", "create", "--title", "Badge readers", "--domain", "Facilities"]);
    let exported = run_json(["--db", path_str(&source_db), "db", "export", "--out", path_str(&export_dir)]);
    assert!(exported.pointer("/manifest/files").and_then(Value::as_array).is_some_and(|files| !files.is_empty()));

    let imported = run_json(["--db", path_str(&target_db), "db", "import", "--in", path_str(&export_dir)]);
    assert_eq!(pointer_u64(&imported, "/imported_issues"), 1);

    let tampered = export_dir.join("issues.ndjson");
    let mut body = fs::read_to_string(&tampered).unwrap_or_else(|err| panic!("failed to read export: {err}"));
    body.push('\n');
    write_file(&tampered, &body);
    let rejected = run_ir(["--db", path_str(&restored_db), "db", "import", "--in", path_str(&export_dir)]);
    assert!(!rejected.status.success());

    run_json(["--db", path_str(&source_db), "db", "backup", "--out", path_str(&backup)]);
    run_json(["--db", path_str(&restored_db), "db", "restore", "--in", path_str(&backup)]);
    let listed = run_json(["--db", path_str(&restored_db), "issue", "list"]);
    assert_eq!(listed.get("payload").and_then(Value::as_array).map(Vec::len), Some(1));
}
