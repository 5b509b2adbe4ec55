use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn cdx_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("cdx");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let research = root.join("archive/research");
    let url_content = root.join("archive/url-content");
    fs::create_dir_all(research.join("2024")).unwrap();
    fs::create_dir_all(&url_content).unwrap();

    fs::write(
        research.join("2024/alpha-report.md"),
        "# alpha indexing strategies\n\n## Source: web search\n\nA survey of \
         indexing strategies. Details at [the alpha site](https://example.com/alpha).\n",
    )
    .unwrap();
    fs::write(
        research.join("2024/beta-notes.md"),
        "# beta collection notes\n\nThese notes mention alpha only in the body, \
         plus some beta material.\n",
    )
    .unwrap();
    fs::write(
        url_content.join("alpha-site.md"),
        "# Source: [Alpha Site](http://example.com/alpha/)\n\n## Captured: 2024-02-10\n\n\
         The alpha site body content about indexing.\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[archive]
research_root = "{root}/archive/research"
url_content_root = "{root}/archive/url-content"

[db]
path = "{root}/data/cdx.sqlite"

[indexer]
debounce_secs = 1

[search]
default_limit = 10
max_limit = 50
"#,
        root = root.display()
    );

    let config_path = root.join("cdx.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_cdx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = cdx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run cdx binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn search_result_id(stdout: &str, nth: usize) -> Option<String> {
    stdout
        .lines()
        .filter(|l| l.trim().starts_with("id:"))
        .nth(nth)
        .and_then(|l| l.split("id:").nth(1))
        .map(|s| s.trim().to_string())
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_cdx(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_cdx(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_cdx(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_index_run() {
    let (_tmp, config_path) = setup_test_env();

    run_cdx(&config_path, &["init"]);
    let (stdout, stderr, success) = run_cdx(&config_path, &["index"]);
    assert!(success, "index failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("scanned:   3"));
    assert!(stdout.contains("added:     3"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_reindex_is_incremental_and_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    run_cdx(&config_path, &["init"]);
    run_cdx(&config_path, &["index"]);

    // No changes: nothing scanned, nothing added.
    let (stdout, _, success) = run_cdx(&config_path, &["index"]);
    assert!(success);
    assert!(stdout.contains("scanned:   0"), "got: {}", stdout);
    assert!(stdout.contains("added:     0"));
}

#[test]
fn test_incremental_picks_up_modified_file() {
    let (tmp, config_path) = setup_test_env();

    run_cdx(&config_path, &["init"]);
    run_cdx(&config_path, &["index"]);

    // mtime must move past the stored watermark
    std::thread::sleep(std::time::Duration::from_millis(1100));
    fs::write(
        tmp.path().join("archive/research/2024/beta-notes.md"),
        "# beta collection notes (revised)\n\nRevised body.\n",
    )
    .unwrap();

    let (stdout, _, success) = run_cdx(&config_path, &["index"]);
    assert!(success);
    assert!(stdout.contains("scanned:   1"), "got: {}", stdout);
    assert!(stdout.contains("updated:   1"));
}

#[test]
fn test_forced_index_rescans_everything() {
    let (_tmp, config_path) = setup_test_env();

    run_cdx(&config_path, &["init"]);
    run_cdx(&config_path, &["index"]);

    let (stdout, _, success) = run_cdx(&config_path, &["index", "--force"]);
    assert!(success);
    assert!(stdout.contains("scanned:   3"), "got: {}", stdout);
    assert!(stdout.contains("updated:   3"));
}

#[test]
fn test_deleted_file_disappears_from_results() {
    let (tmp, config_path) = setup_test_env();

    run_cdx(&config_path, &["init"]);
    run_cdx(&config_path, &["index"]);

    fs::remove_file(tmp.path().join("archive/research/2024/beta-notes.md")).unwrap();
    let (stdout, _, success) = run_cdx(&config_path, &["index"]);
    assert!(success);
    assert!(stdout.contains("deleted:   1"), "got: {}", stdout);

    let (stdout, _, _) = run_cdx(&config_path, &["search", "beta"]);
    assert!(
        !stdout.contains("beta collection notes"),
        "deleted document still in results: {}",
        stdout
    );
}

#[test]
fn test_search_ranks_title_matches_first() {
    let (_tmp, config_path) = setup_test_env();

    run_cdx(&config_path, &["init"]);
    run_cdx(&config_path, &["index"]);

    let (stdout, _, success) = run_cdx(&config_path, &["search", "alpha"]);
    assert!(success, "search failed");
    let title_pos = stdout
        .find("alpha indexing strategies")
        .expect("title match missing");
    let body_pos = stdout
        .find("beta collection notes")
        .expect("body match missing");
    assert!(
        title_pos < body_pos,
        "title match should rank above body match: {}",
        stdout
    );
}

#[test]
fn test_search_fuzzy_prefix() {
    let (_tmp, config_path) = setup_test_env();

    run_cdx(&config_path, &["init"]);
    run_cdx(&config_path, &["index"]);

    let (stdout, _, _) = run_cdx(&config_path, &["search", "index"]);
    assert!(stdout.contains("No results."), "got: {}", stdout);

    let (stdout, _, success) = run_cdx(&config_path, &["search", "index", "--fuzzy"]);
    assert!(success);
    assert!(stdout.contains("alpha indexing strategies"), "got: {}", stdout);
}

#[test]
fn test_search_no_results() {
    let (_tmp, config_path) = setup_test_env();

    run_cdx(&config_path, &["init"]);
    run_cdx(&config_path, &["index"]);

    let (stdout, _, success) = run_cdx(&config_path, &["search", "xyznonexistent"]);
    assert!(success);
    assert!(stdout.contains("No results"));
}

#[test]
fn test_search_with_citations_json() {
    let (_tmp, config_path) = setup_test_env();

    run_cdx(&config_path, &["init"]);
    run_cdx(&config_path, &["index"]);

    let (stdout, _, success) = run_cdx(
        &config_path,
        &["search", "alpha", "--citations", "--json"],
    );
    assert!(success);

    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    let results = parsed["results"].as_array().unwrap();
    assert!(!results.is_empty());
    assert!(results[0]["citations"].is_object());
    assert!(parsed["citation_graph"]["nodes"].as_array().is_some());
    assert_eq!(parsed["metadata"]["fuzzy"], false);

    // The explicit link in the alpha report resolved to the captured page
    // despite scheme and trailing-slash differences.
    let report = results
        .iter()
        .find(|r| r["document"]["title"] == "alpha indexing strategies")
        .expect("alpha report in results");
    let cited = report["citations"]["cited"].as_array().unwrap();
    assert!(cited.iter().any(|c| !c["target_id"].is_null()), "unresolved: {}", stdout);
}

#[test]
fn test_get_document() {
    let (_tmp, config_path) = setup_test_env();

    run_cdx(&config_path, &["init"]);
    run_cdx(&config_path, &["index"]);

    let (search_out, _, _) = run_cdx(&config_path, &["search", "alpha"]);
    let id = search_result_id(&search_out, 0).expect("result id");

    let (stdout, _, success) = run_cdx(&config_path, &["get", &id]);
    assert!(success, "get should succeed");
    assert!(stdout.contains("Document"));
    assert!(stdout.contains(&id));
}

#[test]
fn test_get_missing_document() {
    let (_tmp, config_path) = setup_test_env();

    run_cdx(&config_path, &["init"]);

    let (_, stderr, success) = run_cdx(&config_path, &["get", "nonexistent-id"]);
    assert!(!success, "get with missing id should fail");
    assert!(
        stderr.contains("not found"),
        "Should report not found, got: {}",
        stderr
    );
}

#[test]
fn test_related_documents() {
    let (_tmp, config_path) = setup_test_env();

    run_cdx(&config_path, &["init"]);
    run_cdx(&config_path, &["index"]);

    let (search_out, _, _) = run_cdx(&config_path, &["search", "alpha indexing"]);
    let report_id = search_result_id(&search_out, 0).expect("result id");

    let (stdout, _, success) = run_cdx(&config_path, &["related", &report_id]);
    assert!(success, "related failed: {}", stdout);
    assert!(
        stdout.contains("Alpha Site"),
        "cited page should be related: {}",
        stdout
    );
    assert!(!stdout.contains(&report_id), "origin must be excluded");
}

#[test]
fn test_related_missing_document() {
    let (_tmp, config_path) = setup_test_env();

    run_cdx(&config_path, &["init"]);
    let (_, stderr, success) = run_cdx(&config_path, &["related", "nonexistent-id"]);
    assert!(!success);
    assert!(stderr.contains("not found"), "got: {}", stderr);
}

#[test]
fn test_citation_report() {
    let (_tmp, config_path) = setup_test_env();

    run_cdx(&config_path, &["init"]);
    run_cdx(&config_path, &["index"]);

    let (search_out, _, _) = run_cdx(&config_path, &["search", "alpha indexing"]);
    let report_id = search_result_id(&search_out, 0).expect("result id");

    let (stdout, _, success) = run_cdx(&config_path, &["report", &report_id, "--json"]);
    assert!(success);
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    assert!(parsed["outgoing_count"].as_u64().unwrap() >= 1);
    assert!(parsed["mean_confidence"].as_f64().unwrap() > 0.0);
}

#[test]
fn test_graph_export_formats() {
    let (tmp, config_path) = setup_test_env();

    run_cdx(&config_path, &["init"]);
    run_cdx(&config_path, &["index"]);

    let (stdout, _, success) = run_cdx(&config_path, &["graph"]);
    assert!(success);
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    assert_eq!(parsed["nodes"].as_array().unwrap().len(), 3);

    let (stdout, _, success) = run_cdx(&config_path, &["graph", "--format", "dot"]);
    assert!(success);
    assert!(stdout.contains("digraph citations"));

    let out_path = tmp.path().join("graph.graphml");
    let (_, _, success) = run_cdx(
        &config_path,
        &["graph", "--format", "graphml", "--output", out_path.to_str().unwrap()],
    );
    assert!(success);
    assert!(fs::read_to_string(&out_path).unwrap().contains("<graphml"));

    let (_, stderr, success) = run_cdx(&config_path, &["graph", "--format", "bogus"]);
    assert!(!success);
    assert!(stderr.contains("Unknown graph format"));
}

#[test]
fn test_malformed_schedule_rejected() {
    let (_tmp, config_path) = setup_test_env();

    run_cdx(&config_path, &["init"]);
    let (_, stderr, success) = run_cdx(
        &config_path,
        &["index", "--schedule", "every now and then"],
    );
    assert!(!success, "malformed schedule must be rejected");
    assert!(stderr.contains("scheduling error"), "got: {}", stderr);
}

#[test]
fn test_stats() {
    let (_tmp, config_path) = setup_test_env();

    run_cdx(&config_path, &["init"]);
    run_cdx(&config_path, &["index"]);

    let (stdout, _, success) = run_cdx(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Documents:  3"), "got: {}", stdout);
    assert!(stdout.contains("Citations:"));
}
