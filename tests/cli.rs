use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn docrelay_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("docrelay");
    path
}

/// Filesystem object store with one container (`docs`), sqlite queue and
/// index, OCR disabled.
fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let docs = root.join("objects").join("docs");
    fs::create_dir_all(docs.join("reports")).unwrap();
    fs::create_dir_all(docs.join("tmp")).unwrap();
    fs::write(
        docs.join("reports").join("alpha.md"),
        "# Alpha\n\nQuarterly revenue grew in every region.",
    )
    .unwrap();
    fs::write(
        docs.join("reports").join("beta.txt"),
        "Beta notes.\n\nDeployment moved to the new cluster.",
    )
    .unwrap();
    fs::write(docs.join("tmp").join("scratch.txt"), "scratch").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/docrelay.sqlite"

[storage]
backend = "filesystem"
root = "{root}/objects"

[queue]
backend = "sqlite"
visibility_timeout_secs = 60
max_attempts = 3
backoff_base_secs = 1
backoff_max_secs = 5

[index]
backend = "sqlite"

[processor]
attempt_timeout_secs = 5

[notifier]
include_globs = ["**"]
exclude_globs = ["tmp/**"]

[ocr]
enabled = false

[logging]
level = "warn"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("docrelay.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docrelay(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docrelay_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("DOCRELAY_LOG")
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docrelay binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn run_ok(config_path: &Path, args: &[&str]) -> String {
    let (stdout, stderr, success) = run_docrelay(config_path, args);
    assert!(
        success,
        "docrelay {:?} failed: stdout={}, stderr={}",
        args, stdout, stderr
    );
    stdout
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let stdout = run_ok(&config_path, &["init"]);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data").join("docrelay.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    run_ok(&config_path, &["init"]);
    run_ok(&config_path, &["init"]);
}

#[test]
fn test_notify_work_get() {
    let (_tmp, config_path) = setup_test_env();
    run_ok(&config_path, &["init"]);

    let stdout = run_ok(&config_path, &["notify", "docs", "reports/alpha.md"]);
    assert!(stdout.contains("Enqueued docs/reports/alpha.md"));

    let stdout = run_ok(&config_path, &["work", "--once"]);
    assert!(stdout.contains("1 received, 1 acked"), "{}", stdout);

    let stdout = run_ok(&config_path, &["get", "docs/reports/alpha.md"]);
    assert!(stdout.contains("source_locator: docs/reports/alpha.md"));
    assert!(stdout.contains("content_type:   text/markdown"));
    assert!(stdout.contains("Quarterly revenue grew"));
}

#[test]
fn test_reprocessing_unchanged_object_is_a_no_op() {
    let (_tmp, config_path) = setup_test_env();
    run_ok(&config_path, &["init"]);

    for _ in 0..3 {
        run_ok(&config_path, &["notify", "docs", "reports/alpha.md"]);
    }
    let stdout = run_ok(&config_path, &["work", "--once"]);
    assert!(stdout.contains("3 received, 3 acked"), "{}", stdout);

    let stdout = run_ok(&config_path, &["status"]);
    assert!(stdout.contains("(1 records)"), "{}", stdout);

    let stdout = run_ok(&config_path, &["process", "docs", "reports/alpha.md"]);
    assert!(stdout.starts_with("Unchanged"), "{}", stdout);
}

#[test]
fn test_notify_ignores_excluded_keys_and_other_events() {
    let (_tmp, config_path) = setup_test_env();
    run_ok(&config_path, &["init"]);

    let stdout = run_ok(&config_path, &["notify", "docs", "tmp/scratch.txt"]);
    assert!(stdout.starts_with("Ignored"), "{}", stdout);

    let stdout = run_ok(
        &config_path,
        &["notify", "docs", "reports/alpha.md", "--event", "removed"],
    );
    assert!(stdout.starts_with("Ignored"), "{}", stdout);

    let stdout = run_ok(&config_path, &["status"]);
    assert!(stdout.contains("(depth 0)"), "{}", stdout);
}

#[test]
fn test_missing_object_is_dead_lettered_then_redriven() {
    let (tmp, config_path) = setup_test_env();
    run_ok(&config_path, &["init"]);

    run_ok(&config_path, &["notify", "docs", "reports/late.txt"]);
    let stdout = run_ok(&config_path, &["work", "--once"]);
    assert!(stdout.contains("1 dead-lettered"), "{}", stdout);

    let stdout = run_ok(&config_path, &["dead-letters", "list"]);
    assert!(stdout.contains("docs/reports/late.txt"));
    assert!(stdout.contains("fetch after 1 attempt(s)"), "{}", stdout);

    fs::write(
        tmp.path()
            .join("objects")
            .join("docs")
            .join("reports")
            .join("late.txt"),
        "Arrived late.",
    )
    .unwrap();

    let stdout = run_ok(&config_path, &["dead-letters", "redrive"]);
    assert!(stdout.contains("1 re-enqueued"), "{}", stdout);
    let stdout = run_ok(&config_path, &["dead-letters", "list"]);
    assert!(stdout.contains("No dead letters"));

    let stdout = run_ok(&config_path, &["work", "--once"]);
    assert!(stdout.contains("1 acked"), "{}", stdout);
    let stdout = run_ok(&config_path, &["get", "docs/reports/late.txt"]);
    assert!(stdout.contains("Arrived late."));
}

#[test]
fn test_backfill_dry_run_and_enqueue() {
    let (_tmp, config_path) = setup_test_env();
    run_ok(&config_path, &["init"]);

    let stdout = run_ok(&config_path, &["backfill", "docs", "--dry-run"]);
    assert!(stdout.contains("objects listed:   3"), "{}", stdout);
    assert!(stdout.contains("would enqueue:    2"), "{}", stdout);

    let stdout = run_ok(&config_path, &["status"]);
    assert!(stdout.contains("(depth 0)"), "{}", stdout);

    let stdout = run_ok(&config_path, &["backfill", "docs", "--prefix", "reports/"]);
    assert!(stdout.contains("2 enqueued"), "{}", stdout);

    let stdout = run_ok(&config_path, &["work", "--once", "--workers", "2"]);
    assert!(stdout.contains("2 acked"), "{}", stdout);
    let stdout = run_ok(&config_path, &["status"]);
    assert!(stdout.contains("(2 records)"), "{}", stdout);
}

#[test]
fn test_get_missing_record_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_ok(&config_path, &["init"]);

    let (_, stderr, success) = run_docrelay(&config_path, &["get", "docs/nothing.txt"]);
    assert!(!success);
    assert!(stderr.contains("record not found"), "{}", stderr);
}

#[test]
fn test_unsupported_content_type_fails_process() {
    let (tmp, config_path) = setup_test_env();
    run_ok(&config_path, &["init"]);
    fs::write(
        tmp.path().join("objects").join("docs").join("blob.bin"),
        [0u8, 1, 2, 3],
    )
    .unwrap();

    let (_, stderr, success) = run_docrelay(&config_path, &["process", "docs", "blob.bin"]);
    assert!(!success);
    assert!(stderr.contains("extraction"), "{}", stderr);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, _, success) = run_docrelay(&tmp.path().join("nope.toml"), &["status"]);
    assert!(!success);
}
