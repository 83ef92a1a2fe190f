//! Bulkhead - damage containment for agents that modify their own source tree.
//!
//! This library provides the core of the `bh` CLI tool: a safe self-modification
//! pipeline made of four cooperating components.
//!
//! - [`validator`] - decides whether an improvement request may proceed at all
//! - [`sandbox`] - proves a modification plan against a disposable copy of the tree
//! - [`transaction`] - applies changes to the real tree with backup-before-mutate
//!   and reverse-order rollback
//! - [`backup`] - independent, checksum-verified full-tree snapshots for
//!   emergency recovery
//!
//! [`pipeline`] wires them together in the order validate, plan, sandbox, apply.

pub mod action_log;
pub mod backup;
pub mod cli;
pub mod commands;
pub mod config;
pub mod models;
pub mod pipeline;
pub mod process;
pub mod sandbox;
pub mod storage;
pub mod transaction;
pub mod validator;

/// Test utilities for isolated test environments.
#[cfg(test)]
pub(crate) mod test_utils {
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    use crate::storage::DataDir;

    /// Test environment with an isolated working tree and data directory.
    pub struct TestEnv {
        /// Simulated repository directory
        pub repo_dir: TempDir,
        /// Isolated data storage directory
        pub data_dir: TempDir,
    }

    impl TestEnv {
        /// Create a new test environment with isolated directories.
        pub fn new() -> Self {
            Self {
                repo_dir: TempDir::new().unwrap(),
                data_dir: TempDir::new().unwrap(),
            }
        }

        /// Get the path to the simulated repository.
        pub fn path(&self) -> &Path {
            self.repo_dir.path()
        }

        /// Data directory layout rooted at the isolated data dir.
        pub fn data(&self) -> DataDir {
            DataDir::at(self.data_dir.path())
        }

        /// Write a file relative to the repository root, creating parents.
        pub fn write(&self, rel: &str, content: &str) -> PathBuf {
            let path = self.path().join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, content).unwrap();
            path
        }

        /// Read a file relative to the repository root.
        pub fn read(&self, rel: &str) -> String {
            fs::read_to_string(self.path().join(rel)).unwrap()
        }
    }

    impl Default for TestEnv {
        fn default() -> Self {
            Self::new()
        }
    }
}

/// Library-level error type for Bulkhead operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Transaction is not active")]
    TransactionNotActive,

    #[error("Index corrupted at {path}: {reason}")]
    IndexCorrupted { path: String, reason: String },

    #[error("No backups available")]
    NoBackups,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for Bulkhead operations.
pub type Result<T> = std::result::Result<T, Error>;
