//! Storage layer for Bulkhead state.
//!
//! All persisted state lives under a single data directory, by default
//! `~/.local/share/bulkhead/<repo-hash>/`, so that backups of the working tree
//! never capture their own bookkeeping:
//!
//! - `improvement-history.jsonl` - append-only improvement history
//! - `transactions/<id>/transaction.json` - transaction metadata
//! - `transactions/<id>/backups/<op-id>.bak` - per-operation pre-images
//! - `backups/index.json` - backup index
//! - `backups/<id>.tar.gz` + `backups/<id>.manifest.json` - one archive per backup
//! - `action.log` - JSONL audit log of `bh` invocations
//!
//! Index files are rewritten through a temp-file-then-rename step, and are only
//! written after the physical action they describe has succeeded.

use crate::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};

/// Directory names that never take part in tree copies or snapshots.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
    ".pytest_cache",
    ".bulkhead",
];

/// Layout of the Bulkhead data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Use an explicit directory as the data root.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default data directory for a repository.
    ///
    /// Uses a hash of the canonical repository path to create a unique
    /// directory under the platform data dir.
    pub fn for_repo(repo_path: &Path) -> Result<Self> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| Error::Other("Could not determine data directory".to_string()))?;
        Ok(Self::at(
            data_dir.join("bulkhead").join(repo_hash(repo_path)?),
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn transactions_dir(&self) -> PathBuf {
        self.root.join("transactions")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn history_path(&self) -> PathBuf {
        self.root.join("improvement-history.jsonl")
    }

    pub fn action_log_path(&self) -> PathBuf {
        self.root.join("action.log")
    }

    /// Session state shared by consecutive `bh` invocations.
    pub fn session_path(&self) -> PathBuf {
        self.root.join("session.json")
    }

    /// Create the directory skeleton if it does not exist yet.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(self.transactions_dir())?;
        fs::create_dir_all(self.backups_dir())?;
        Ok(())
    }
}

/// Short, stable hash of a canonicalized repository path.
pub fn repo_hash(repo_path: &Path) -> Result<String> {
    let repo_canonical = repo_path
        .canonicalize()
        .map_err(|e| Error::Other(format!("Could not canonicalize repo path: {}", e)))?;

    let hash_hex = sha256_bytes(repo_canonical.to_string_lossy().as_bytes());
    Ok(hash_hex[..12].to_string())
}

/// Walk up from `start` looking for a directory containing `.git`.
pub fn find_git_root(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir.join(".git").exists() {
            return Some(dir.to_path_buf());
        }
        current = dir.parent();
    }
    None
}

/// Generate a unique ID.
///
/// Format: `<prefix>-<12 hex chars>`
/// - Transaction prefix: "tx"
/// - Operation prefix: "op"
/// - Backup prefix: "bk"
pub fn generate_id(prefix: &str, seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(
        chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(0)
            .to_le_bytes(),
    );
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    let hash_hex = format!("{:x}", hasher.finalize());
    format!("{}-{}", prefix, &hash_hex[..12])
}

/// Validate that an ID matches the `<prefix>-<12 hex>` format.
///
/// IDs end up in file names, so this also guards against path injection.
pub fn validate_id(id: &str, prefix: &str) -> Result<()> {
    let Some(suffix) = id.strip_prefix(&format!("{}-", prefix)) else {
        return Err(Error::InvalidId(format!(
            "ID must start with '{}-', got: {}",
            prefix, id
        )));
    };

    if suffix.len() != 12 || !suffix.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidId(format!(
            "ID suffix must be 12 hex characters, got: {}",
            suffix
        )));
    }

    Ok(())
}

/// Hex sha256 of a byte slice.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Hex sha256 of a file's contents, streamed.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Normalize a caller-supplied path into a safe path relative to a tree root.
///
/// Absolute paths and `..` components are rejected so that no operation can
/// escape the tree it was planned against.
pub fn normalize_rel_path(raw: &str) -> Result<PathBuf> {
    let candidate = Path::new(raw.trim());
    let mut out = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::InvalidInput(format!(
                    "path must be relative to the working tree: {}",
                    raw
                )));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(Error::InvalidInput("path must not be empty".to_string()));
    }
    Ok(out)
}

/// Render a relative path with forward slashes, as stored in manifests.
pub fn rel_to_string(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Check whether a relative path falls under any exclude entry.
///
/// An exclude matches when it equals any single path component, or when it
/// is a multi-component prefix of the path.
pub fn is_excluded(rel: &Path, excludes: &[String]) -> bool {
    let rel_str = rel_to_string(rel);
    excludes.iter().any(|ex| {
        let ex = ex.trim_matches('/');
        if ex.is_empty() {
            return false;
        }
        if ex.contains('/') {
            rel_str == ex || rel_str.starts_with(&format!("{}/", ex))
        } else {
            rel.components()
                .any(|c| matches!(c, Component::Normal(part) if part == ex))
        }
    })
}

/// List all regular files under `root`, relative and sorted, skipping excludes.
///
/// Symlinks are not followed.
pub fn walk_files(root: &Path, excludes: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![PathBuf::new()];

    while let Some(rel_dir) = stack.pop() {
        for entry in fs::read_dir(root.join(&rel_dir))? {
            let entry = entry?;
            let rel = rel_dir.join(entry.file_name());
            if is_excluded(&rel, excludes) {
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(rel);
            } else if file_type.is_file() {
                files.push(rel);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Copy a file, creating the destination's parent directories.
pub fn copy_file(src: &Path, dest: &Path) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(fs::copy(src, dest)?)
}

/// Read a JSON index file.
///
/// A missing file yields `T::default()`. An unreadable or unparseable file is
/// reported as [`Error::IndexCorrupted`] and never silently reset.
pub fn read_json_index<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(Error::Io(e)),
    };
    serde_json::from_str(&content).map_err(|e| Error::IndexCorrupted {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Write a JSON file through a temp file and rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        serde_json::to_writer_pretty(&mut file, value)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read all records from a JSONL file. A missing file yields an empty list.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::Io(e)),
    };

    let mut records = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| Error::IndexCorrupted {
            path: path.display().to_string(),
            reason: format!("line {}: {}", line_no + 1, e),
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Append one record to a JSONL file.
pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string(record)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", json)?;
    Ok(())
}

/// Replace the contents of a JSONL file.
pub fn write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file = File::create(&tmp)?;
        for record in records {
            writeln!(file, "{}", serde_json::to_string(record)?)?;
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
