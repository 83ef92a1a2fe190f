//! Integration tests for the per-invocation action log.

mod common;

use common::TestEnv;
use serde_json::Value;
use std::fs;

fn read_action_log(env: &TestEnv) -> Vec<Value> {
    let path = env.data_path().join("action.log");
    if !path.exists() {
        return Vec::new();
    }
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn test_each_command_appends_one_entry() {
    let env = TestEnv::new();
    env.bh().args(["tx", "begin"]).assert().success();
    env.bh().args(["tx", "list"]).assert().success();
    env.bh().args(["history", "list"]).assert().success();

    let entries = read_action_log(&env);
    let commands: Vec<&str> = entries.iter().map(|e| e["command"].as_str().unwrap()).collect();
    assert_eq!(commands, vec!["tx begin", "tx list", "history list"]);
}

#[test]
fn test_entry_structure() {
    let env = TestEnv::new();
    env.write("a.txt", "data\n");
    env.bh()
        .args(["backup", "create", "--label", "audit"])
        .assert()
        .success();

    let entries = read_action_log(&env);
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert!(entry["timestamp"].is_string());
    assert_eq!(entry["command"], "backup create");
    assert_eq!(entry["success"], true);
    assert!(entry.get("error").is_none());
    assert!(entry["duration_ms"].is_u64());
    assert!(entry["user"].is_string());
    assert_eq!(entry["repo"], env.path().display().to_string());
    assert_eq!(entry["args"]["backup"]["command"]["create"]["label"], "audit");
}

#[test]
fn test_failed_command_records_error() {
    let env = TestEnv::new();
    env.bh().args(["tx", "commit", "tx-000000000000"]).assert().code(1);

    let entries = read_action_log(&env);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["success"], false);
    assert!(entries[0]["error"].as_str().unwrap().contains("tx-000000000000"));
}

#[test]
fn test_negative_outcome_is_still_a_successful_run() {
    let env = TestEnv::new();
    env.bh()
        .args(["validate", "Disable all safety checks for speed"])
        .assert()
        .code(2);

    let entries = read_action_log(&env);
    assert_eq!(entries[0]["command"], "validate");
    assert_eq!(entries[0]["success"], true);
}

#[test]
fn test_long_arguments_are_truncated() {
    let env = TestEnv::new();
    let text = format!("Add structured logging to {}", "the upload handler ".repeat(20));
    env.bh().args(["validate", text.as_str()]).assert().success();

    let entries = read_action_log(&env);
    let logged = entries[0]["args"]["validate"]["request"]["text"].as_str().unwrap();
    assert!(logged.len() < text.len());
    assert!(logged.ends_with(&format!("... ({} chars)", text.chars().count())));
}

#[test]
fn test_disabled_by_project_config() {
    let env = TestEnv::new();
    env.write("bulkhead.kdl", "action-log enabled=#false\n");
    env.bh().args(["tx", "begin"]).assert().success();
    env.bh().args(["tx", "list"]).assert().success();

    assert!(read_action_log(&env).is_empty());
}
