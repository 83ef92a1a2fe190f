//! Integration tests for `bh config` and config layering.

mod common;

use common::TestEnv;
use predicates::prelude::*;
use serde_json::Value;

fn setting<'a>(json: &'a Value, key: &str) -> &'a Value {
    json["settings"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["key"] == key)
        .unwrap_or_else(|| panic!("missing setting {}", key))
}

#[test]
fn test_show_defaults_and_env_data_dir() {
    let env = TestEnv::new();
    let json = env.bh_json(&["config", "show"]);

    let threshold = setting(&json, "validator.similarity-threshold");
    assert_eq!(threshold["value"], 0.8);
    assert_eq!(threshold["source"], "default");

    let data_dir = setting(&json, "data-dir");
    assert_eq!(data_dir["source"], "env:BH_DATA_DIR");
}

#[test]
fn test_project_beats_system_config() {
    let env = TestEnv::new();
    std::fs::write(
        env.config_dir.path().join("config.kdl"),
        "validator { risk-threshold 5\n max-depth 2 }\n",
    )
    .unwrap();
    env.write("bulkhead.kdl", "validator { risk-threshold 9 }\n");

    let json = env.bh_json(&["config", "show"]);
    let risk = setting(&json, "validator.risk-threshold");
    assert_eq!(risk["value"], 9);
    assert_eq!(risk["source"], "project");
    let depth = setting(&json, "validator.max-depth");
    assert_eq!(depth["value"], 2);
    assert_eq!(depth["source"], "system");
}

#[test]
fn test_invalid_config_fails() {
    let env = TestEnv::new();
    env.write("bulkhead.kdl", "validator { similarity-threshold 1.5 }\n");
    env.bh()
        .args(["config", "show"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("similarity-threshold"));
}

#[test]
fn test_unparseable_config_fails() {
    let env = TestEnv::new();
    env.write("bulkhead.kdl", "validator {\n");
    env.bh().args(["config", "show"]).assert().code(1);
}

#[test]
fn test_init_writes_project_file() {
    let env = TestEnv::new();
    let json = env.bh_json(&["config", "init"]);
    assert!(json["path"].as_str().unwrap().ends_with("bulkhead.kdl"));
    let content = env.read("bulkhead.kdl");
    assert!(content.contains("similarity-threshold"));
    assert!(content.contains("retention"));

    // The written file must load cleanly as a layer of its own
    let json = env.bh_json(&["config", "show"]);
    assert_eq!(setting(&json, "validator.max-depth")["source"], "project");

    env.bh()
        .args(["config", "init"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("already exists"));
    env.bh().args(["config", "init", "--force"]).assert().success();
}

#[test]
fn test_validator_settings_take_effect() {
    let env = TestEnv::new();
    env.write("bulkhead.kdl", "validator { max-files 1 }\n");
    env.bh()
        .args(["validate", "Add logging to the upload handler", "--max-files", "3"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("Constraint violation"));
}
