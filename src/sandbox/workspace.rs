//! The disposable sandbox directory.

use crate::process::{CancelToken, ProcessOutput, command_from_argv, run_bounded};
use crate::storage::{copy_file, walk_files};
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info};

/// Manifest file name and the command that installs its dependencies.
pub const DEPENDENCY_MANIFESTS: &[(&str, &[&str])] = &[
    ("package.json", &["npm", "install", "--no-audit", "--no-fund"]),
    ("Cargo.toml", &["cargo", "fetch"]),
    ("requirements.txt", &["pip", "install", "-r", "requirements.txt"]),
    ("go.mod", &["go", "mod", "download"]),
];

/// A temporary copy of a tree. The directory is removed on drop.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    file_count: usize,
}

impl Workspace {
    /// Copy every non-excluded file under `source` into a fresh temp dir.
    pub fn populate(source: &Path, excludes: &[String]) -> Result<Self> {
        if !source.is_dir() {
            return Err(Error::NotFound(format!(
                "source tree {}",
                source.display()
            )));
        }
        let dir = tempfile::Builder::new().prefix("bh-sandbox-").tempdir()?;
        let files = walk_files(source, excludes)?;
        for rel in &files {
            copy_file(&source.join(rel), &dir.path().join(rel))?;
        }
        debug!(
            sandbox = %dir.path().display(),
            files = files.len(),
            "sandbox populated"
        );
        Ok(Self {
            dir,
            file_count: files.len(),
        })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn file_count(&self) -> usize {
        self.file_count
    }

    pub fn path_of(&self, rel: &Path) -> PathBuf {
        self.dir.path().join(rel)
    }

    /// Install dependencies for the first manifest found at the root.
    ///
    /// Returns `None` when the tree has no known manifest.
    pub fn install_dependencies(
        &self,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Option<(String, ProcessOutput)>> {
        let Some((manifest, argv)) = DEPENDENCY_MANIFESTS
            .iter()
            .find(|(manifest, _)| self.root().join(manifest).is_file())
        else {
            return Ok(None);
        };
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        let mut cmd = command_from_argv(&argv)?;
        cmd.current_dir(self.root());
        info!(manifest, command = %argv.join(" "), "installing sandbox dependencies");
        let output = run_bounded("dependency install", cmd, timeout, cancel)?;
        Ok(Some((manifest.to_string(), output)))
    }

    /// Remove the directory now, reporting failures.
    pub fn close(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        debug!(sandbox = %path.display(), "sandbox removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_populate_copies_and_excludes() {
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("src")).unwrap();
        fs::create_dir_all(src.path().join("node_modules/dep")).unwrap();
        fs::write(src.path().join("src/app.js"), "x").unwrap();
        fs::write(src.path().join("node_modules/dep/index.js"), "y").unwrap();

        let ws = Workspace::populate(src.path(), &["node_modules".to_string()]).unwrap();
        assert_eq!(ws.file_count(), 1);
        assert_eq!(fs::read_to_string(ws.root().join("src/app.js")).unwrap(), "x");
        assert!(!ws.root().join("node_modules").exists());

        let root = ws.root().to_path_buf();
        ws.close().unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_drop_removes_directory() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a.txt"), "a").unwrap();
        let root = {
            let ws = Workspace::populate(src.path(), &[]).unwrap();
            ws.root().to_path_buf()
        };
        assert!(!root.exists());
    }

    #[test]
    fn test_no_manifest_means_no_install() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a.txt"), "a").unwrap();
        let ws = Workspace::populate(src.path(), &[]).unwrap();
        let installed = ws
            .install_dependencies(Duration::from_secs(5), &CancelToken::new())
            .unwrap();
        assert!(installed.is_none());
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let src = TempDir::new().unwrap();
        assert!(Workspace::populate(&src.path().join("nope"), &[]).is_err());
    }
}
