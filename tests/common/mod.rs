//! Common test utilities for Bulkhead integration tests.
//!
//! Provides `TestEnv` for isolated test environments that don't touch the
//! user's data or config directories.

#![allow(dead_code)]

use assert_cmd::Command;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
pub use tempfile::TempDir;

/// A test environment with an isolated working tree, data dir and config dir.
///
/// The `bh()` method returns a `Command` that sets `BH_DATA_DIR` and
/// `BH_CONFIG_DIR` per invocation, so tests can run in parallel.
pub struct TestEnv {
    pub repo_dir: TempDir,
    pub data_dir: TempDir,
    pub config_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            repo_dir: TempDir::new().unwrap(),
            data_dir: TempDir::new().unwrap(),
            config_dir: TempDir::new().unwrap(),
        }
    }

    /// A `bh` command rooted at the repo with isolated storage.
    pub fn bh(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_bh"));
        cmd.current_dir(self.repo_dir.path());
        cmd.env("BH_REPO", self.repo_dir.path());
        cmd.env("BH_DATA_DIR", self.data_dir.path());
        cmd.env("BH_CONFIG_DIR", self.config_dir.path());
        cmd.env_remove("BH_LOG");
        cmd
    }

    /// Run `bh` with `args`, expect success, and parse stdout as JSON.
    pub fn bh_json(&self, args: &[&str]) -> Value {
        let output = self.bh().args(args).assert().success().get_output().stdout.clone();
        serde_json::from_slice(&output).unwrap()
    }

    pub fn path(&self) -> &Path {
        self.repo_dir.path()
    }

    pub fn data_path(&self) -> &Path {
        self.data_dir.path()
    }

    /// Write a file relative to the repo, creating parents.
    pub fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path().join(rel)).unwrap()
    }

    /// Write a file outside the repo (plans, requests, bundles).
    pub fn scratch(&self, name: &str, content: &str) -> PathBuf {
        let path = self.data_dir.path().join("scratch").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
