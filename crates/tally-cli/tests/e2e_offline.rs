//! E2E tests for the offline queue: queue, sync, conflicts, resolve.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;

fn tally(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("tally"));
    cmd.current_dir(dir);
    cmd.env("TALLY_USER", "u-bob");
    cmd.env("TALLY_TENANT", "acme");
    cmd.env("TALLY_LOG", "error");
    cmd.env("XDG_CONFIG_HOME", dir.join(".xdg"));
    cmd.env_remove("FORMAT");
    cmd
}

fn json_of(dir: &Path, args: &[&str]) -> Value {
    let output = tally(dir)
        .args(args)
        .arg("--json")
        .output()
        .expect("tally should not crash");
    assert!(
        output.status.success(),
        "{args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("valid JSON on stdout")
}

fn setup() -> TempDir {
    let dir = TempDir::new().unwrap();
    tally(dir.path()).arg("init").assert().success();
    dir
}

fn doc_id(value: &Value) -> String {
    value["doc_id"].as_str().unwrap().to_string()
}

#[test]
fn queued_create_is_numbered_on_sync() {
    let dir = setup();
    json_of(dir.path(), &["create", "jobs", "--data", r#"{"title":"Online"}"#]);

    let queued = json_of(
        dir.path(),
        &[
            "queue",
            "create",
            "jobs",
            "--data",
            r#"{"title":"Offline"}"#,
            "--client-ts",
            "2020-01-01T00:00:00Z",
        ],
    );
    assert_eq!(queued["state"], "pending");
    let id = queued["docId"].as_str().unwrap().to_string();

    let report = json_of(dir.path(), &["sync"]);
    assert_eq!(report["synced"], 1);
    assert_eq!(report["outcomes"][0]["outcome"], "synced");

    let shown = json_of(dir.path(), &["show", "jobs", &id]);
    assert_eq!(shown["fields"]["jobNumber"], 2);
    assert_eq!(shown["fields"]["title"], "Offline");

    let pending = json_of(dir.path(), &["pending", "--state", "pending"]);
    assert!(pending.as_array().unwrap().is_empty());
    let synced = json_of(dir.path(), &["pending", "--state", "synced"]);
    assert_eq!(synced.as_array().unwrap().len(), 1);
}

#[test]
fn queued_update_replaces_the_document() {
    let dir = setup();
    let van = json_of(
        dir.path(),
        &["create", "vehicles", "--data", r#"{"plate":"VAN-1","notes":"dent"}"#],
    );
    let id = doc_id(&van);
    let base = van["stamp"]["write_seq"].as_i64().unwrap().to_string();

    // The device edited version `base`; someone else changed it since.
    json_of(
        dir.path(),
        &["update", "vehicles", &id, "--data", r#"{"plate":"VAN-1","notes":"dent, scratch"}"#],
    );
    json_of(
        dir.path(),
        &[
            "queue",
            "update",
            "vehicles",
            &id,
            "--data",
            r#"{"plate":"VAN-9"}"#,
            "--base-version",
            &base,
        ],
    );
    let report = json_of(dir.path(), &["sync"]);
    assert_eq!(report["synced"], 1);
    assert_eq!(report["outcomes"][0]["overwrote_remote"], true);

    let shown = json_of(dir.path(), &["show", "vehicles", &id]);
    assert_eq!(shown["fields"]["plate"], "VAN-9");
    assert!(shown["fields"].get("notes").is_none());
}

#[test]
fn update_to_deleted_document_is_resolved_by_recreating() {
    let dir = setup();
    let job = json_of(dir.path(), &["create", "jobs"]);
    let cost = json_of(
        dir.path(),
        &["create", &format!("jobs/{}/costs", doc_id(&job)), "--data", r#"{"amount":10}"#],
    );
    let costs_path = format!("jobs/{}/costs", doc_id(&job));
    let cost_id = doc_id(&cost);

    json_of(
        dir.path(),
        &["queue", "update", &costs_path, &cost_id, "--data", r#"{"amount":12}"#],
    );
    json_of(dir.path(), &["delete", &costs_path, &cost_id]);

    let report = json_of(dir.path(), &["sync"]);
    assert_eq!(report["conflicts"], 1);
    assert_eq!(report["outcomes"][0]["category"], "update_to_deleted_document");

    let conflicts = json_of(dir.path(), &["conflicts"]);
    let conflicts = conflicts.as_array().unwrap();
    assert_eq!(conflicts.len(), 1);
    let conflict_id = conflicts[0]["conflictId"].as_str().unwrap().to_string();

    let retried = json_of(dir.path(), &["resolve", &conflict_id, "retry"]);
    assert_eq!(retried["resolution"], "still_conflicted");

    let recreated = json_of(dir.path(), &["resolve", &conflict_id, "recreate"]);
    assert_eq!(recreated["resolution"], "recreated");
    assert_eq!(recreated["number"], 2);

    let new_id = recreated["doc_id"].as_str().unwrap();
    let shown = json_of(dir.path(), &["show", &costs_path, new_id]);
    assert_eq!(shown["fields"]["amount"], 12);

    assert!(json_of(dir.path(), &["conflicts"]).as_array().unwrap().is_empty());
    let all = json_of(dir.path(), &["conflicts", "--status", "all"]);
    assert_eq!(all[0]["status"], "recreated");

    tally(dir.path())
        .args(["resolve", &conflict_id, "discard"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E6002"));
}

#[test]
fn discard_closes_the_conflict() {
    let dir = setup();
    let van = json_of(dir.path(), &["create", "vehicles"]);
    let id = doc_id(&van);
    json_of(
        dir.path(),
        &["queue", "update", "vehicles", &id, "--data", r#"{"plate":"X"}"#],
    );
    json_of(dir.path(), &["delete", "vehicles", &id]);
    json_of(dir.path(), &["sync"]);

    let conflicts = json_of(dir.path(), &["conflicts"]);
    let conflict_id = conflicts[0]["conflictId"].as_str().unwrap().to_string();
    let outcome = json_of(dir.path(), &["resolve", &conflict_id, "discard"]);
    assert_eq!(outcome["resolution"], "discarded");

    let discarded = json_of(dir.path(), &["pending", "--state", "discarded"]);
    assert_eq!(discarded.as_array().unwrap().len(), 1);
}

#[test]
fn conflicts_are_scoped_to_the_tenant() {
    let dir = setup();
    let van = json_of(dir.path(), &["create", "vehicles"]);
    let id = doc_id(&van);
    json_of(dir.path(), &["queue", "update", "vehicles", &id, "--data", "{}"]);
    json_of(dir.path(), &["delete", "vehicles", &id]);
    json_of(dir.path(), &["sync"]);

    let other = json_of(dir.path(), &["conflicts", "--tenant", "globex"]);
    assert!(other.as_array().unwrap().is_empty());
    let everywhere = json_of(dir.path(), &["conflicts", "--tenant", "globex", "--all-tenants"]);
    assert_eq!(everywhere.as_array().unwrap().len(), 1);
}

#[test]
fn unknown_conflict_and_bad_resolution_fail() {
    let dir = setup();
    tally(dir.path())
        .args(["resolve", "c-missing", "discard"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E6001"));
    tally(dir.path())
        .args(["resolve", "c-missing", "merge"])
        .assert()
        .failure();
    tally(dir.path())
        .args(["queue", "upsert", "jobs"])
        .assert()
        .failure();
}

#[test]
fn text_output_lists_queue_entries() {
    let dir = setup();
    json_of(dir.path(), &["queue", "create", "vehicles", "--data", "{}"]);
    tally(dir.path())
        .args(["pending", "--format", "text"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\tpending\tcreate\tvehicles\t"));
}
