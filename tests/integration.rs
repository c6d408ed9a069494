use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn harvester_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("harvester");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Upstreams point at a closed local port: nothing here may reach them.
    let config_content = format!(
        r#"[db]
path = "{}/data/harvester.sqlite"

[registry]
api_url = "http://127.0.0.1:9/api"

[harvest]
cleanup_days_threshold = 30

[repositories.ZENODO]
api_url = "http://127.0.0.1:9/zenodo/records?q="
page_size = 50
data_key = "hits.hits"
self_link_key = "links.self"

[repositories.SITES]
api_url = "http://127.0.0.1:9/sitemap.xml"
"#,
        root.display()
    );

    let config_path = config_dir.join("harvester.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_harvester(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = harvester_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run harvester binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_harvester(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/harvester.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_harvester(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_harvester(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_repositories_lists_configured_sources() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_harvester(&config_path, &["repositories"]);
    assert!(success, "repositories failed: stderr={}", stderr);
    assert!(stdout.contains("ZENODO\tapi\thttp://127.0.0.1:9/zenodo/records?q="));
    assert!(stdout.contains("SITES\tsitemap\thttp://127.0.0.1:9/sitemap.xml"));
}

#[test]
fn test_records_empty_after_init() {
    let (_tmp, config_path) = setup_test_env();

    run_harvester(&config_path, &["init"]);
    let (stdout, stderr, success) = run_harvester(&config_path, &["records"]);
    assert!(success, "records failed: stderr={}", stderr);
    assert!(stdout.trim().is_empty());
}

#[test]
fn test_resolve_unknown_registry_id_fails() {
    let (_tmp, config_path) = setup_test_env();

    run_harvester(&config_path, &["init"]);
    let (_, stderr, success) = run_harvester(&config_path, &["resolve", "reg-404", "--by", "ops"]);
    assert!(!success);
    assert!(stderr.contains("reg-404"));
}

#[test]
fn test_unresolve_without_marker_succeeds() {
    let (_tmp, config_path) = setup_test_env();

    run_harvester(&config_path, &["init"]);
    let (stdout, _, success) = run_harvester(&config_path, &["unresolve", "reg-1"]);
    assert!(success);
    assert!(stdout.contains("was not resolved"));
}

#[test]
fn test_unknown_repository_rejected() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_harvester(&config_path, &["sync", "FIGSHARE"]);
    assert!(!success);
    assert!(stderr.contains("FIGSHARE"));
}

#[test]
fn test_unconfigured_repository_rejected() {
    let (_tmp, config_path) = setup_test_env();

    run_harvester(&config_path, &["init"]);
    let (_, stderr, success) = run_harvester(&config_path, &["sync", "DATAREGISTRY"]);
    assert!(!success);
    assert!(stderr.contains("not configured"));
}

#[test]
fn test_rules_apply_needs_a_source() {
    let (_tmp, config_path) = setup_test_env();

    run_harvester(&config_path, &["init"]);
    let (_, stderr, success) = run_harvester(&config_path, &["rules", "apply", "reg-1"]);
    assert!(!success);
    assert!(stderr.contains("--file"));
}

#[test]
fn test_missing_config_file() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");

    let (_, stderr, success) = run_harvester(&missing, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
