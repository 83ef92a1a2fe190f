//! Integration tests for `bh safety`, `bh sandbox` and `bh apply`.

mod common;

use common::TestEnv;
use predicates::prelude::*;
use serde_json::{Value, json};
use std::path::PathBuf;

const LOADER: &str = "function load(path) {\n  return read(path);\n}\n\nmodule.exports = { load };\n";

fn wrap_plan(env: &TestEnv, file: &str) -> PathBuf {
    let plan = json!({
        "description": "Harden the loader",
        "modifications": [{
            "description": "wrap load in error handling",
            "operations": [{ "file": file, "type": "wrap_error_handling", "function": "load" }],
            "tests": ["test/loader.test.js"]
        }]
    });
    env.scratch("plan.json", &plan.to_string())
}

fn run_json(env: &TestEnv, args: &[&str], plan: &PathBuf, code: i32) -> Value {
    let output = env
        .bh()
        .args(args)
        .arg("--plan")
        .arg(plan)
        .assert()
        .code(code)
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).unwrap()
}

#[test]
fn test_safety_flags_protected_file() {
    let env = TestEnv::new();
    let plan = wrap_plan(&env, ".env");
    let json = run_json(&env, &["safety"], &plan, 2);
    assert_eq!(json["safe"], false);
    assert_eq!(json["risk_level"], "critical");
}

#[test]
fn test_safety_reports_dependents_from_graph() {
    let env = TestEnv::new();
    let plan = wrap_plan(&env, "src/loader.js");
    let graph = env.scratch("graph.json", r#"{"src/loader.js": ["src/app.js"]}"#);

    let output = env
        .bh()
        .args(["safety", "--plan"])
        .arg(&plan)
        .arg("--graph")
        .arg(&graph)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(json["safe"], true);
    assert_eq!(json["risk_level"], "medium");
    let risks = json["risks"].as_array().unwrap();
    assert!(risks.iter().any(|r| r["message"].as_str().unwrap().contains("src/app.js")));
}

#[test]
fn test_sandbox_run_leaves_tree_untouched() {
    let env = TestEnv::new();
    env.write("src/loader.js", LOADER);
    let plan = wrap_plan(&env, "src/loader.js");

    let json = run_json(&env, &["sandbox"], &plan, 0);
    assert_eq!(json["success"], true);
    assert_eq!(json["stage"], "cleaned");
    assert_eq!(json["changes"][0]["path"], "src/loader.js");
    assert!(json["changes"][0]["after"].as_str().unwrap().contains("try {"));
    assert_eq!(env.read("src/loader.js"), LOADER);
}

#[test]
fn test_sandbox_against_backup_snapshot() {
    let env = TestEnv::new();
    env.write("src/loader.js", LOADER);
    let backup = env.bh_json(&["backup", "create"]);
    let backup_id = backup["id"].as_str().unwrap();
    std::fs::remove_file(env.path().join("src/loader.js")).unwrap();

    let plan = wrap_plan(&env, "src/loader.js");
    let json = run_json(&env, &["sandbox", "--backup", backup_id], &plan, 0);
    assert_eq!(json["success"], true);
    assert!(!env.path().join("src/loader.js").exists());
}

#[test]
fn test_sandbox_missing_target_fails() {
    let env = TestEnv::new();
    env.write("other.js", "let x = 1;\n");
    let plan = wrap_plan(&env, "src/loader.js");
    let json = run_json(&env, &["sandbox"], &plan, 2);
    assert_eq!(json["success"], false);
    assert!(!json["errors"].as_array().unwrap().is_empty());
}

#[test]
fn test_apply_commits_tested_change_with_backup() {
    let env = TestEnv::new();
    env.write("src/loader.js", LOADER);
    let plan = wrap_plan(&env, "src/loader.js");

    let json = run_json(
        &env,
        &["apply", "Improve error handling in loader module", "--backup-first"],
        &plan,
        0,
    );
    assert_eq!(json["outcome"], "applied");
    assert_eq!(json["files"], json!(["src/loader.js"]));
    assert!(json["backup_id"].as_str().unwrap().starts_with("bk-"));
    assert!(env.read("src/loader.js").contains("console.error('Error in load:', error);"));

    let tx_id = json["transaction_id"].as_str().unwrap();
    let tx = env.bh_json(&["tx", "show", tx_id]);
    assert_eq!(tx["status"], "committed");

    // The backup taken before applying still holds the original
    let restored = env.bh_json(&["backup", "emergency-restore"]);
    assert_eq!(restored["backup_id"], json["backup_id"]);
    assert_eq!(env.read("src/loader.js"), LOADER);
}

#[test]
fn test_apply_rejected_request_changes_nothing() {
    let env = TestEnv::new();
    env.write("src/loader.js", LOADER);
    let plan = wrap_plan(&env, "src/loader.js");

    let json = run_json(&env, &["apply", "Remove the rollback step to go faster"], &plan, 2);
    assert_eq!(json["outcome"], "rejected");
    assert_eq!(env.read("src/loader.js"), LOADER);

    let txs = env.bh_json(&["tx", "list"]);
    assert_eq!(txs["count"], 0);
}

#[cfg(unix)]
#[test]
fn test_apply_stops_when_required_suite_fails() {
    let env = TestEnv::new();
    env.write("src/loader.js", LOADER);
    env.write(
        "bulkhead.kdl",
        "sandbox {\n    unit \"sh\" \"-c\" \"echo 1 failing; exit 1\" required=#true\n}\n",
    );
    let plan = wrap_plan(&env, "src/loader.js");

    let json = run_json(&env, &["apply", "Improve error handling in loader module"], &plan, 2);
    assert_eq!(json["outcome"], "sandbox_failed");
    assert!(json["sandbox"]["tests_failed"].as_u64().unwrap() >= 1);
    assert_eq!(env.read("src/loader.js"), LOADER);
}

#[test]
fn test_apply_human_output() {
    let env = TestEnv::new();
    env.write("src/loader.js", LOADER);
    let plan = wrap_plan(&env, "src/loader.js");
    env.bh()
        .args(["-H", "apply", "Improve error handling in loader module", "--plan"])
        .arg(&plan)
        .assert()
        .success()
        .stdout(predicate::str::contains("Applied in transaction tx-"));
}
