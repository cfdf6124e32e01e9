use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn rask_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("rask");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let docs = root.join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(docs.join("guide.md"), "# Guide\n").unwrap();

    let config_content = format!(
        r#"[storage]
resources_dir = "{root}/data/resources"
collections_dir = "{root}/data/collections"

[db]
path = "{root}/data/threads.sqlite"

[agent]
command = "{root}/no-such-agent"

[[resources]]
type = "local"
name = "docs"
path = "{root}/docs"
notes = "Team handbook"
"#,
        root = root.display()
    );

    let config_path = root.join("config.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_rask(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = rask_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .current_dir(config_path.parent().unwrap())
        .output()
        .unwrap_or_else(|e| panic!("Failed to run rask binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_rask(&config, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized successfully."));
    assert!(tmp.path().join("data/threads.sqlite").exists());
    assert!(tmp.path().join("data/collections").is_dir());
}

#[test]
fn test_init_writes_starter_config() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("fresh").join("config.toml");
    // starter config keeps default storage; point it at the temp dir
    let output = Command::new(rask_binary())
        .arg("--config")
        .arg(&config)
        .arg("init")
        .env("HOME", tmp.path())
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(config.exists());
    assert!(tmp
        .path()
        .join(".local/share/repo-ask/threads.sqlite")
        .exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config) = setup_test_env();
    let (_, _, first) = run_rask(&config, &["init"]);
    let (_, stderr, second) = run_rask(&config, &["init"]);
    assert!(first);
    assert!(second, "second init failed: {}", stderr);
}

#[test]
fn test_resources_lists_configured() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, success) = run_rask(&config, &["resources"]);
    assert!(success);
    assert!(stdout.contains("docs"));
    assert!(stdout.contains("local"));
    assert!(stdout.contains("Team handbook"));
}

#[test]
fn test_collection_prints_key_and_path() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_rask(&config, &["collection", "docs"]);
    assert!(success, "collection failed: {}", stderr);
    assert!(stdout.contains("key:  docs"));
    assert!(stdout.contains("docs: Team handbook"));
    assert!(tmp
        .path()
        .join("data/collections/docs/docs/guide.md")
        .exists());
}

#[test]
fn test_ensure_unknown_resource_fails() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_rask(&config, &["ensure", "react"]);
    assert!(!success);
    assert!(stderr.contains("resource not configured: react"));
}

#[test]
fn test_remove_deletes_cached_clone_only() {
    let (tmp, config) = setup_test_env();
    let stale = tmp.path().join("data/resources/old-docs");
    fs::create_dir_all(&stale).unwrap();
    fs::write(stale.join("README.md"), "stale\n").unwrap();

    let (stdout, stderr, success) = run_rask(&config, &["remove", "old-docs", "docs", "other"]);
    assert!(success, "remove failed: {}", stderr);
    assert!(stdout.contains("Removed old-docs"));
    assert!(stdout.contains("docs is a local resource"));
    assert!(stdout.contains("other is not cached"));
    assert!(!stale.exists());
    assert!(tmp.path().join("docs/guide.md").exists());

    let (_, _, success) = run_rask(&config, &["remove", "../escape"]);
    assert!(!success);
}

#[test]
fn test_ask_unknown_resource_fails_without_agent() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_rask(&config, &["ask", "-r", "react", "what?"]);
    assert!(!success);
    assert!(stdout.is_empty());
    assert!(stderr.contains("resource not configured: react"));
}

#[test]
fn test_ask_with_missing_agent_is_recorded_as_failed() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_rask(&config, &["ask", "-r", "docs", "what?"]);
    assert!(!success);
    assert!(stderr.contains("failed to spawn agent"), "{}", stderr);

    let (stdout, _, success) = run_rask(&config, &["threads", "list"]);
    assert!(success);
    assert!(stdout.contains("what?"));
}

#[test]
fn test_threads_empty_and_missing() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, success) = run_rask(&config, &["threads", "list"]);
    assert!(success);
    assert!(stdout.contains("No threads yet."));

    let (_, stderr, success) = run_rask(&config, &["threads", "show", "nope"]);
    assert!(!success);
    assert!(stderr.contains("thread not found: nope"));
}
