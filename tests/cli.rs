//! Command-line tests against a temporary project directory.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const CONFIG: &str = r#"
[run]
shard_count = 2
workers_per_shard = 2
retry_budget = 1
seed = 5

[suite]
path = "suite.toml"

[executor]
type = "command"
command = "true"

[[fixtures]]
name = "server"
scope = "session"
setup = "echo http://localhost:4000"
"#;

const SUITE: &str = r#"
[[file]]
path = "tests/home.spec"
tags = ["@smoke"]
fixtures = ["server"]

[[file.test]]
title = "loads"

[[file.test]]
title = "shows banner"
tags = ["@slow"]

[[file.group]]
title = "login"

[[file.group.test]]
title = "accepts password"

[[file.group.test]]
title = "lands on dashboard"
must_follow = "accepts password"

[[file]]
path = "tests/later.spec"

[[file.test]]
title = "not ready"
annotation = "fixme"
"#;

fn project(config: &str, suite: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("shardline.toml"), config).unwrap();
    std::fs::write(dir.path().join("suite.toml"), suite).unwrap();
    dir
}

fn shardline(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("shardline").unwrap();
    cmd.current_dir(dir).env_remove("SHARDLINE_LOG");
    cmd
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn test_validate_accepts_project() {
    let dir = project(CONFIG, SUITE);
    shardline(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Tests: 5"))
        .stdout(predicate::str::contains("Fixtures: 1"));
}

#[test]
fn test_validate_rejects_zero_shards() {
    let dir = project(&CONFIG.replace("shard_count = 2", "shard_count = 0"), SUITE);
    shardline(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("shard_count must be at least 1"));
}

#[test]
fn test_validate_rejects_unknown_fixture() {
    let suite = SUITE.replace(r#"fixtures = ["server"]"#, r#"fixtures = ["database"]"#);
    let dir = project(CONFIG, &suite);
    shardline(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("database"));
}

#[test]
fn test_collect_json_applies_tag_selection() {
    let dir = project(CONFIG, SUITE);
    let output = shardline(dir.path())
        .args(["collect", "--format", "json", "--tags", "@smoke and not @slow"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let cases: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let ids: Vec<&str> = cases
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["id"].as_str().unwrap())
        .collect();
    assert_eq!(
        ids,
        vec![
            "tests/home.spec::loads",
            "tests/home.spec::login::accepts password",
            "tests/home.spec::login::lands on dashboard",
        ]
    );
}

#[test]
fn test_run_writes_report_junit_and_history() {
    let dir = project(CONFIG, SUITE);
    shardline(dir.path())
        .arg("run")
        .assert()
        .code(0)
        .stdout(predicate::str::contains("All tests passed!"));

    let report = read_json(&dir.path().join("test-results/report.json"));
    assert_eq!(report["schemaVersion"], 1);
    assert_eq!(report["counts"]["total"], 5);
    assert_eq!(report["counts"]["passed"], 4);
    assert_eq!(report["counts"]["skipped"], 1);

    let junit = std::fs::read_to_string(dir.path().join("test-results/junit.xml")).unwrap();
    assert!(junit.contains(r#"<testsuite name="tests/home.spec""#));

    let history = read_json(&dir.path().join(".shardline/durations.json"));
    assert!(history.get("tests/home.spec::loads").is_some());
    assert!(history.get("tests/later.spec::not ready").is_none());
}

#[test]
fn test_run_exit_code_reflects_failure() {
    let suite = format!(
        "{}\n[[file]]\npath = \"tests/broken.spec\"\n\n[[file.test]]\ntitle = \"always fails\"\ncommand = \"exit 1\"\n",
        SUITE
    );
    let dir = project(CONFIG, &suite);
    shardline(dir.path())
        .args(["run", "--shards", "3"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Some tests failed."))
        .stdout(predicate::str::contains("tests/broken.spec::always fails"));

    let report = read_json(&dir.path().join("test-results/report.json"));
    assert_eq!(report["counts"]["failed"], 1);
    let broken = report["results"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["id"] == "tests/broken.spec::always fails")
        .unwrap();
    // One attempt plus one retry.
    assert_eq!(broken["attempts"].as_array().unwrap().len(), 2);
}

#[test]
fn test_plan_run_shard_and_merge() {
    let dir = project(CONFIG, SUITE);
    let plan = dir.path().join("out/plan.json");

    shardline(dir.path())
        .args(["plan", "--output"])
        .arg(&plan)
        .assert()
        .success()
        .stdout(predicate::str::contains("Shard 0:"))
        .stdout(predicate::str::contains("Shard 1:"));
    assert_eq!(read_json(&plan)["shardCount"], 2);

    let mut shard_reports = Vec::new();
    for index in ["1", "0"] {
        let output = dir.path().join(format!("out/shard-{}.json", index));
        shardline(dir.path())
            .args(["run-shard", "--plan"])
            .arg(&plan)
            .args(["--index", index, "--output"])
            .arg(&output)
            .assert()
            .success();
        shard_reports.push(output);
    }

    let merged = dir.path().join("out/report.json");
    shardline(dir.path())
        .args(["merge", "--plan"])
        .arg(&plan)
        .args(&shard_reports)
        .arg("--output")
        .arg(&merged)
        .assert()
        .code(0);
    let report = read_json(&merged);
    assert_eq!(report["runId"], read_json(&plan)["runId"]);
    assert_eq!(report["counts"]["total"], 5);
}

#[test]
fn test_merge_refuses_incomplete_run() {
    let dir = project(CONFIG, SUITE);
    let plan = dir.path().join("plan.json");
    shardline(dir.path())
        .args(["plan", "--output"])
        .arg(&plan)
        .assert()
        .success();

    let shard = dir.path().join("shard-0.json");
    shardline(dir.path())
        .args(["run-shard", "--plan"])
        .arg(&plan)
        .args(["--index", "0", "--output"])
        .arg(&shard)
        .assert()
        .success();

    shardline(dir.path())
        .args(["merge", "--plan"])
        .arg(&plan)
        .arg(&shard)
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing reports for shards [1]"));
    assert!(!dir.path().join("test-results/report.json").exists());
}

#[test]
fn test_init_creates_runnable_project() {
    let dir = TempDir::new().unwrap();
    shardline(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created shardline.toml"));
    assert!(dir.path().join("shardline-suite.toml").exists());

    shardline(dir.path()).arg("validate").assert().success();
    shardline(dir.path()).arg("init").assert().failure();
}
