//! Full-tree backups and the reports produced when restoring or verifying them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Where a backup came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    /// Created locally by `create_full_backup`
    #[default]
    Complete,
    /// Brought in through `import_backup`
    Imported,
}

/// Manifest stored inside each archive and next to it as a sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Relative paths, forward-slash separated, sorted
    pub files: Vec<String>,
    /// Relative path to hex sha256
    pub checksums: BTreeMap<String, String>,
    /// Sum of file sizes in bytes
    pub size: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Index entry for one backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub file_count: usize,
    /// Uncompressed size of the captured files
    pub size: u64,
    /// Size of the archive on disk
    pub archive_size: u64,
    #[serde(default)]
    pub status: BackupStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// The backup index file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupIndex {
    /// Oldest first
    #[serde(default)]
    pub backups: Vec<BackupRecord>,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub total_archive_size: u64,
}

impl BackupIndex {
    pub fn find(&self, id: &str) -> Option<&BackupRecord> {
        self.backups.iter().find(|b| b.id == id)
    }

    /// Most recently created backup.
    pub fn newest(&self) -> Option<&BackupRecord> {
        self.backups.iter().max_by_key(|b| b.created_at)
    }

    pub fn recompute_totals(&mut self) {
        self.total_size = self.backups.iter().map(|b| b.size).sum();
        self.total_archive_size = self.backups.iter().map(|b| b.archive_size).sum();
    }
}

/// Filter for `list_backups`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Substring match against the label
    pub label: Option<String>,
}

impl BackupFilter {
    pub fn matches(&self, record: &BackupRecord) -> bool {
        if self.since.is_some_and(|since| record.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| record.created_at > until) {
            return false;
        }
        if let Some(ref wanted) = self.label {
            return record
                .label
                .as_deref()
                .is_some_and(|label| label.contains(wanted.as_str()));
        }
        true
    }
}

/// Per-session state threaded through the pipeline.
///
/// Tracks the backup created most recently in this session, which
/// `emergency_restore` prefers over the newest indexed backup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub active_backup: Option<String>,
}

/// How a live file compares to its backed-up version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    Unchanged,
    Modified,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeSummary {
    pub path: String,
    pub state: ChangeState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedFile {
    pub path: String,
    pub error: String,
}

/// Result of `restore_backup`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub backup_id: String,
    pub success: bool,
    pub dry_run: bool,
    pub restored_files: Vec<String>,
    pub failed_files: Vec<FailedFile>,
    /// Restored files that did not exist in the live tree
    pub recreated_files: Vec<String>,
    /// Live files copied aside with a `.pre-restore` suffix before overwrite
    pub pre_restore_copies: Vec<String>,
    pub warnings: Vec<String>,
    /// What a dry run would change
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<FileChangeSummary>,
}

/// A distinct reason a backup failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerifyError {
    NotIndexed,
    ArchiveMissing { path: String },
    ArchiveUnreadable { reason: String },
    ManifestMissing,
    FileMissing { path: String },
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::NotIndexed => write!(f, "backup is not in the index"),
            VerifyError::ArchiveMissing { path } => write!(f, "archive missing: {}", path),
            VerifyError::ArchiveUnreadable { reason } => {
                write!(f, "archive unreadable: {}", reason)
            }
            VerifyError::ManifestMissing => write!(f, "manifest missing from archive"),
            VerifyError::FileMissing { path } => write!(f, "file missing from archive: {}", path),
            VerifyError::ChecksumMismatch { path, .. } => {
                write!(f, "checksum mismatch: {}", path)
            }
        }
    }
}

/// Result of `verify_backup`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub backup_id: String,
    pub valid: bool,
    pub errors: Vec<VerifyError>,
    pub checked_files: usize,
}
