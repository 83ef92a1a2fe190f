//! Backup Manager.
//!
//! Full-tree snapshots that live outside any transaction. Each backup is an
//! archive plus a sidecar manifest, and all backups are listed in a single
//! index:
//!
//! ```text
//! backups/index.json
//! backups/<bk-id>.tar.gz
//! backups/<bk-id>.manifest.json
//! ```
//!
//! The index is only written after the archive it describes is in place (or,
//! for deletions, gone).

pub mod archive;

use crate::models::{
    BackupFilter, BackupIndex, BackupManifest, BackupRecord, BackupStatus, ChangeState,
    FailedFile, FileChangeSummary, RestoreReport, SessionState, VerifyError, VerifyReport,
};
use crate::storage::{
    DEFAULT_EXCLUDES, DataDir, copy_file, generate_id, normalize_rel_path, read_json_index,
    sha256_file, validate_id, walk_files, write_json_atomic,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const BACKUP_PREFIX: &str = "bk";
const PRE_RESTORE_SUFFIX: &str = ".pre-restore";

/// What to capture in `create_full_backup`.
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Explicit file list; `None` captures the whole tree
    pub files: Option<Vec<String>>,
    pub label: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    /// Extract and compare, but leave the live tree alone
    pub dry_run: bool,
}

/// Aggregate numbers from the backup index.
#[derive(Debug, Clone, Serialize)]
pub struct BackupStats {
    pub count: usize,
    pub total_size: u64,
    pub total_archive_size: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

pub struct BackupManager {
    repo: PathBuf,
    data: DataDir,
    excludes: Vec<String>,
    retention: usize,
}

impl BackupManager {
    pub fn new(repo: impl Into<PathBuf>, data: DataDir) -> Self {
        Self {
            repo: repo.into(),
            data,
            excludes: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            retention: 10,
        }
    }

    pub fn with_excludes(mut self, excludes: Vec<String>) -> Self {
        self.excludes = excludes;
        self
    }

    /// Number of backups kept after each creation. Zero keeps everything.
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    fn index_path(&self) -> PathBuf {
        self.data.backups_dir().join("index.json")
    }

    pub fn archive_path(&self, id: &str) -> PathBuf {
        self.data.backups_dir().join(format!("{}.tar.gz", id))
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.data.backups_dir().join(format!("{}.manifest.json", id))
    }

    fn load_index(&self) -> Result<BackupIndex> {
        read_json_index(&self.index_path())
    }

    fn save_index(&self, index: &BackupIndex) -> Result<()> {
        write_json_atomic(&self.index_path(), index)
    }

    fn resolve_files(&self, files: Option<&[String]>) -> Result<Vec<PathBuf>> {
        let Some(files) = files else {
            return walk_files(&self.repo, &self.excludes);
        };
        let mut resolved = Vec::with_capacity(files.len());
        for file in files {
            let rel = normalize_rel_path(file)?;
            if !self.repo.join(&rel).is_file() {
                return Err(Error::NotFound(format!("file {}", file)));
            }
            if !resolved.contains(&rel) {
                resolved.push(rel);
            }
        }
        resolved.sort();
        Ok(resolved)
    }

    /// Snapshot the tree (or the listed files) into a new backup.
    ///
    /// The new backup becomes the session's active backup. Older backups
    /// beyond the retention count are evicted afterwards.
    pub fn create_full_backup(
        &self,
        options: &BackupOptions,
        session: &mut SessionState,
    ) -> Result<BackupRecord> {
        // fail on a corrupt index before doing any work
        let mut index = self.load_index()?;
        let files = self.resolve_files(options.files.as_deref())?;

        let id = generate_id(BACKUP_PREFIX, options.label.as_deref().unwrap_or("backup"));
        let created_at = Utc::now();
        let mut metadata = options.metadata.clone();
        if let Some(label) = &options.label {
            metadata.insert("label".to_string(), label.clone());
        }

        fs::create_dir_all(self.data.backups_dir())?;
        let archive_path = self.archive_path(&id);
        let (manifest, archive_size) =
            archive::write_archive(&archive_path, &self.repo, &files, &id, created_at, metadata)
                .inspect_err(|e| warn!(backup = %id, error = %e, "backup archive failed"))?;
        if let Err(e) = write_json_atomic(&self.manifest_path(&id), &manifest) {
            let _ = fs::remove_file(&archive_path);
            return Err(e);
        }

        let record = BackupRecord {
            id: id.clone(),
            created_at,
            label: options.label.clone(),
            file_count: manifest.files.len(),
            size: manifest.size,
            archive_size,
            status: BackupStatus::Complete,
            metadata: manifest.metadata.clone(),
        };
        index.backups.push(record.clone());
        index.recompute_totals();
        self.save_index(&index)?;
        session.active_backup = Some(id.clone());

        info!(
            backup = %id,
            files = record.file_count,
            size = record.size,
            archive_size,
            "backup created"
        );

        // the new backup is already durable; a failed eviction is retried next time
        if let Err(e) = self.enforce_retention(&mut index, session) {
            warn!(backup = %id, error = %e, "retention cleanup failed, older backups kept");
        }
        Ok(record)
    }

    /// Evict the oldest backups beyond the retention count.
    ///
    /// Stops at the first backup whose files cannot be removed; it stays
    /// indexed, and whatever was evicted before it is still recorded.
    fn enforce_retention(
        &self,
        index: &mut BackupIndex,
        session: &mut SessionState,
    ) -> Result<Vec<String>> {
        let mut evicted = Vec::new();
        if self.retention == 0 {
            return Ok(evicted);
        }
        index.backups.sort_by_key(|b| b.created_at);
        let mut failure = None;
        while index.backups.len() > self.retention {
            let oldest = index.backups.remove(0);
            if let Err(e) = self.remove_files(&oldest.id) {
                index.backups.insert(0, oldest);
                failure = Some(e);
                break;
            }
            if session.active_backup.as_deref() == Some(oldest.id.as_str()) {
                session.active_backup = None;
            }
            info!(backup = %oldest.id, "backup evicted by retention");
            evicted.push(oldest.id);
        }
        if !evicted.is_empty() {
            index.recompute_totals();
            self.save_index(index)?;
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(evicted),
        }
    }

    fn remove_files(&self, id: &str) -> Result<()> {
        for path in [self.archive_path(id), self.manifest_path(id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    pub fn get_backup(&self, id: &str) -> Result<BackupRecord> {
        validate_id(id, BACKUP_PREFIX)?;
        self.load_index()?
            .find(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Backup {}", id)))
    }

    /// Backups matching `filter`, newest first.
    pub fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<BackupRecord>> {
        let mut backups: Vec<BackupRecord> = self
            .load_index()?
            .backups
            .into_iter()
            .filter(|b| filter.matches(b))
            .collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    pub fn stats(&self) -> Result<BackupStats> {
        let index = self.load_index()?;
        Ok(BackupStats {
            count: index.backups.len(),
            total_size: index.total_size,
            total_archive_size: index.total_archive_size,
            oldest: index.backups.iter().map(|b| b.created_at).min(),
            newest: index.backups.iter().map(|b| b.created_at).max(),
        })
    }

    /// Remove a backup's archive and manifest, then drop it from the index.
    pub fn delete_backup(&self, id: &str, session: &mut SessionState) -> Result<BackupRecord> {
        let record = self.get_backup(id)?;
        self.remove_files(id)?;

        let mut index = self.load_index()?;
        index.backups.retain(|b| b.id != id);
        index.recompute_totals();
        self.save_index(&index)?;
        if session.active_backup.as_deref() == Some(id) {
            session.active_backup = None;
        }
        info!(backup = %id, "backup deleted");
        Ok(record)
    }

    /// Extract a backup's files under `dest`.
    pub fn extract_to(&self, id: &str, dest: &Path) -> Result<Vec<String>> {
        self.get_backup(id)?;
        let archive_path = self.archive_path(id);
        if !archive_path.is_file() {
            return Err(Error::NotFound(format!("archive {}", archive_path.display())));
        }
        archive::extract_files(&archive_path, dest)
    }

    /// Restore the live tree from a backup.
    ///
    /// Checksum mismatches are warnings, not failures: they indicate drift
    /// between the manifest and the extracted file. Live files that differ
    /// from the backup are copied aside with a `.pre-restore` suffix before
    /// being overwritten.
    pub fn restore_backup(&self, id: &str, options: RestoreOptions) -> Result<RestoreReport> {
        self.get_backup(id)?;
        let archive_path = self.archive_path(id);
        if !archive_path.is_file() {
            return Err(Error::NotFound(format!("archive {}", archive_path.display())));
        }
        let manifest = archive::read_manifest(&archive_path)?;
        let staging = tempfile::Builder::new().prefix("bh-restore-").tempdir()?;
        archive::extract_files(&archive_path, staging.path())?;

        let mut report = RestoreReport {
            backup_id: id.to_string(),
            dry_run: options.dry_run,
            ..Default::default()
        };

        for file in &manifest.files {
            match self.restore_one(&manifest, file, staging.path(), options, &mut report) {
                Ok(()) => {}
                Err(e) => {
                    warn!(backup = %id, file = %file, error = %e, "file restore failed");
                    report.failed_files.push(FailedFile {
                        path: file.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report.success = report.failed_files.is_empty();
        info!(
            backup = %id,
            dry_run = options.dry_run,
            restored = report.restored_files.len(),
            recreated = report.recreated_files.len(),
            failed = report.failed_files.len(),
            warnings = report.warnings.len(),
            "backup restore finished"
        );
        Ok(report)
    }

    fn restore_one(
        &self,
        manifest: &BackupManifest,
        file: &str,
        staging: &Path,
        options: RestoreOptions,
        report: &mut RestoreReport,
    ) -> Result<()> {
        let rel = normalize_rel_path(file)?;
        let staged = staging.join(&rel);
        if !staged.is_file() {
            return Err(Error::Archive(format!("{} is missing from the archive", file)));
        }

        let expected = manifest.checksums.get(file);
        let staged_sum = sha256_file(&staged)?;
        if expected.is_some_and(|sum| *sum != staged_sum) {
            report
                .warnings
                .push(format!("Checksum mismatch in archive for {}", file));
        }

        let live = self.repo.join(&rel);
        let state = if !live.is_file() {
            ChangeState::Missing
        } else if sha256_file(&live)? == staged_sum {
            ChangeState::Unchanged
        } else {
            ChangeState::Modified
        };

        if options.dry_run {
            report.changes.push(FileChangeSummary {
                path: file.to_string(),
                state,
            });
            return Ok(());
        }

        match state {
            ChangeState::Unchanged => {}
            ChangeState::Modified => {
                let aside = PathBuf::from(format!("{}{}", live.display(), PRE_RESTORE_SUFFIX));
                copy_file(&live, &aside)?;
                report.pre_restore_copies.push(format!("{}{}", file, PRE_RESTORE_SUFFIX));
                copy_file(&staged, &live)?;
            }
            ChangeState::Missing => {
                copy_file(&staged, &live)?;
                info!(file, "restored file that had been removed");
                report.recreated_files.push(file.to_string());
            }
        }

        if let Some(expected) = expected {
            let actual = sha256_file(&live)?;
            if &actual != expected {
                report.warnings.push(format!(
                    "Checksum mismatch after restore for {}: expected {}, got {}",
                    file, expected, actual
                ));
            }
        }
        debug!(file, ?state, "file restored");
        report.restored_files.push(file.to_string());
        Ok(())
    }

    /// Check a backup without restoring it. Each failed precondition is a
    /// separate named error.
    pub fn verify_backup(&self, id: &str) -> Result<VerifyReport> {
        validate_id(id, BACKUP_PREFIX)?;
        let mut report = VerifyReport {
            backup_id: id.to_string(),
            valid: false,
            errors: Vec::new(),
            checked_files: 0,
        };

        if self.load_index()?.find(id).is_none() {
            report.errors.push(VerifyError::NotIndexed);
        }

        let archive_path = self.archive_path(id);
        if !archive_path.is_file() {
            report.errors.push(VerifyError::ArchiveMissing {
                path: archive_path.display().to_string(),
            });
            return Ok(report);
        }

        let scan = match archive::scan_archive(&archive_path) {
            Ok(scan) => scan,
            Err(e) => {
                report.errors.push(VerifyError::ArchiveUnreadable {
                    reason: e.to_string(),
                });
                return Ok(report);
            }
        };
        let Some(manifest) = scan.manifest else {
            report.errors.push(VerifyError::ManifestMissing);
            return Ok(report);
        };

        report.errors.extend(compare_checksums(&manifest, &scan.checksums));
        report.checked_files = manifest.files.len();
        report.valid = report.errors.is_empty();
        debug!(backup = %id, valid = report.valid, errors = report.errors.len(), "backup verified");
        Ok(report)
    }

    /// Restore the session's active backup, or the newest one.
    ///
    /// This is the last-resort path when a transaction cannot be rolled back.
    pub fn emergency_restore(&self, session: &SessionState) -> Result<RestoreReport> {
        let index = self.load_index()?;
        let active = session
            .active_backup
            .as_deref()
            .and_then(|id| index.find(id));
        let target = active.or_else(|| index.newest()).ok_or(Error::NoBackups)?;
        warn!(backup = %target.id, "emergency restore");
        self.restore_backup(&target.id, RestoreOptions::default())
    }

    /// Write a backup as a portable zstd bundle.
    pub fn export_backup(&self, id: &str, dest: &Path) -> Result<BackupRecord> {
        let record = self.get_backup(id)?;
        let archive_path = self.archive_path(id);
        if !archive_path.is_file() {
            return Err(Error::NotFound(format!("archive {}", archive_path.display())));
        }
        archive::write_bundle(dest, &record, &archive_path)?;
        info!(backup = %id, dest = %dest.display(), "backup exported");
        Ok(record)
    }

    /// Bring a bundle written by `export_backup` into this index.
    ///
    /// The archive is verified before anything is written, and an id that is
    /// already indexed is refused.
    pub fn import_backup(&self, src: &Path) -> Result<BackupRecord> {
        let mut index = self.load_index()?;
        let staging = tempfile::Builder::new().prefix("bh-import-").tempdir()?;
        let (mut record, staged): (BackupRecord, PathBuf) = archive::read_bundle(src, staging.path())?;

        validate_id(&record.id, BACKUP_PREFIX)?;
        if index.find(&record.id).is_some() || self.archive_path(&record.id).exists() {
            return Err(Error::InvalidInput(format!(
                "Backup {} already exists",
                record.id
            )));
        }

        let scan = archive::scan_archive(&staged)?;
        let manifest = scan
            .manifest
            .ok_or_else(|| Error::Archive("imported archive has no manifest".to_string()))?;
        if manifest.id != record.id {
            return Err(Error::Archive(format!(
                "bundle record {} does not match archive manifest {}",
                record.id, manifest.id
            )));
        }
        let problems = compare_checksums(&manifest, &scan.checksums);
        if let Some(first) = problems.first() {
            return Err(Error::Archive(format!(
                "imported archive failed verification: {}",
                first
            )));
        }

        fs::create_dir_all(self.data.backups_dir())?;
        let dest = self.archive_path(&record.id);
        let partial = dest.with_extension("partial");
        copy_file(&staged, &partial)?;
        fs::rename(&partial, &dest)?;
        write_json_atomic(&self.manifest_path(&record.id), &manifest)?;

        record.status = BackupStatus::Imported;
        record.archive_size = fs::metadata(&dest)?.len();
        index.backups.push(record.clone());
        index.recompute_totals();
        self.save_index(&index)?;
        info!(backup = %record.id, src = %src.display(), "backup imported");
        Ok(record)
    }
}

fn compare_checksums(
    manifest: &BackupManifest,
    actual: &BTreeMap<String, String>,
) -> Vec<VerifyError> {
    let mut errors = Vec::new();
    for file in &manifest.files {
        let Some(expected) = manifest.checksums.get(file) else {
            continue;
        };
        match actual.get(file) {
            None => errors.push(VerifyError::FileMissing { path: file.clone() }),
            Some(sum) if sum != expected => errors.push(VerifyError::ChecksumMismatch {
                path: file.clone(),
                expected: expected.clone(),
                actual: sum.clone(),
            }),
            Some(_) => {}
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestEnv;

    fn manager(env: &TestEnv) -> BackupManager {
        BackupManager::new(env.path(), env.data())
    }

    fn create(bm: &BackupManager, session: &mut SessionState) -> BackupRecord {
        bm.create_full_backup(&BackupOptions::default(), session).unwrap()
    }

    #[test]
    fn test_create_indexes_archive_and_manifest() {
        let env = TestEnv::new();
        env.write("a.txt", "alpha");
        env.write("src/b.rs", "fn b() {}");
        env.write("node_modules/x/index.js", "skip");
        let bm = manager(&env);
        let mut session = SessionState::default();

        let record = create(&bm, &mut session);
        assert_eq!(record.file_count, 2);
        assert_eq!(session.active_backup.as_deref(), Some(record.id.as_str()));
        assert!(bm.archive_path(&record.id).is_file());
        assert!(bm.manifest_path(&record.id).is_file());

        let stats = bm.stats().unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.total_size, 14);
    }

    #[test]
    fn test_restore_recreates_removed_file() {
        let env = TestEnv::new();
        env.write("a", "aaa");
        env.write("b", "bbb");
        let bm = manager(&env);
        let record = create(&bm, &mut SessionState::default());

        fs::remove_file(env.path().join("b")).unwrap();
        let report = bm.restore_backup(&record.id, RestoreOptions::default()).unwrap();

        assert!(report.success);
        assert_eq!(report.restored_files, vec!["a", "b"]);
        assert_eq!(report.recreated_files, vec!["b"]);
        assert!(report.warnings.is_empty());
        assert_eq!(env.read("b"), "bbb");
    }

    #[test]
    fn test_restore_keeps_pre_restore_copy() {
        let env = TestEnv::new();
        env.write("config.json", "{\"v\":1}");
        let bm = manager(&env);
        let record = create(&bm, &mut SessionState::default());

        env.write("config.json", "{\"v\":2}");
        let report = bm.restore_backup(&record.id, RestoreOptions::default()).unwrap();
        assert_eq!(report.pre_restore_copies, vec!["config.json.pre-restore"]);
        assert_eq!(env.read("config.json"), "{\"v\":1}");
        assert_eq!(env.read("config.json.pre-restore"), "{\"v\":2}");
    }

    #[test]
    fn test_dry_run_reports_changes_only() {
        let env = TestEnv::new();
        env.write("same", "1");
        env.write("changed", "1");
        env.write("gone", "1");
        let bm = manager(&env);
        let record = create(&bm, &mut SessionState::default());

        env.write("changed", "2");
        fs::remove_file(env.path().join("gone")).unwrap();
        let report = bm
            .restore_backup(&record.id, RestoreOptions { dry_run: true })
            .unwrap();

        assert!(report.dry_run);
        assert!(report.restored_files.is_empty());
        let states: BTreeMap<String, ChangeState> =
            report.changes.into_iter().map(|c| (c.path, c.state)).collect();
        assert_eq!(states["same"], ChangeState::Unchanged);
        assert_eq!(states["changed"], ChangeState::Modified);
        assert_eq!(states["gone"], ChangeState::Missing);
        assert_eq!(env.read("changed"), "2");
        assert!(!env.path().join("gone").exists());
    }

    #[test]
    fn test_verify_is_idempotent_and_names_errors() {
        let env = TestEnv::new();
        env.write("a", "a");
        let bm = manager(&env);
        let record = create(&bm, &mut SessionState::default());

        let first = bm.verify_backup(&record.id).unwrap();
        let second = bm.verify_backup(&record.id).unwrap();
        assert!(first.valid);
        assert_eq!(first, second);

        fs::write(bm.archive_path(&record.id), b"garbage").unwrap();
        let report = bm.verify_backup(&record.id).unwrap();
        assert!(matches!(report.errors[0], VerifyError::ArchiveUnreadable { .. }));

        fs::remove_file(bm.archive_path(&record.id)).unwrap();
        let report = bm.verify_backup(&record.id).unwrap();
        assert!(matches!(report.errors[0], VerifyError::ArchiveMissing { .. }));

        let report = bm.verify_backup("bk-000000000000").unwrap();
        assert_eq!(report.errors[0], VerifyError::NotIndexed);
    }

    #[test]
    fn test_retention_evicts_oldest() {
        let env = TestEnv::new();
        env.write("a", "a");
        let bm = manager(&env).with_retention(2);
        let mut session = SessionState::default();

        let first = create(&bm, &mut session);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = create(&bm, &mut session);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let third = create(&bm, &mut session);

        let ids: Vec<String> = bm
            .list_backups(&BackupFilter::default())
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, vec![third.id.clone(), second.id]);
        assert!(!bm.archive_path(&first.id).exists());
        assert_eq!(session.active_backup, Some(third.id));
    }

    #[test]
    fn test_failed_eviction_keeps_new_backup() {
        let env = TestEnv::new();
        env.write("a", "a");
        let bm = manager(&env).with_retention(1);
        let mut session = SessionState::default();

        let first = create(&bm, &mut session);
        // a non-empty directory where the archive was cannot be removed as a file
        let blocked = bm.archive_path(&first.id);
        fs::remove_file(&blocked).unwrap();
        fs::create_dir_all(blocked.join("pinned")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let second = bm
            .create_full_backup(&BackupOptions::default(), &mut session)
            .unwrap();
        assert_eq!(session.active_backup.as_deref(), Some(second.id.as_str()));
        assert!(bm.archive_path(&second.id).is_file());

        let ids: Vec<String> = bm
            .list_backups(&BackupFilter::default())
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[test]
    fn test_emergency_restore_prefers_session_backup() {
        let env = TestEnv::new();
        let bm = manager(&env);
        assert!(matches!(
            bm.emergency_restore(&SessionState::default()),
            Err(Error::NoBackups)
        ));

        env.write("a", "v1");
        let mut session = SessionState::default();
        let first = create(&bm, &mut session);
        std::thread::sleep(std::time::Duration::from_millis(5));
        env.write("a", "v2");
        create(&bm, &mut SessionState::default());

        env.write("a", "broken");
        let report = bm.emergency_restore(&session).unwrap();
        assert_eq!(report.backup_id, first.id);
        assert_eq!(env.read("a"), "v1");

        let report = bm.emergency_restore(&SessionState::default()).unwrap();
        assert_ne!(report.backup_id, first.id);
        assert_eq!(env.read("a"), "v2");
    }

    #[test]
    fn test_delete_updates_index_and_session() {
        let env = TestEnv::new();
        env.write("a", "a");
        let bm = manager(&env);
        let mut session = SessionState::default();
        let record = create(&bm, &mut session);

        bm.delete_backup(&record.id, &mut session).unwrap();
        assert!(session.active_backup.is_none());
        assert!(!bm.archive_path(&record.id).exists());
        assert_eq!(bm.stats().unwrap().count, 0);
        assert!(bm.get_backup(&record.id).is_err());
    }

    #[test]
    fn test_export_import_between_data_dirs() {
        let env = TestEnv::new();
        env.write("a", "a");
        let bm = manager(&env);
        let record = create(&bm, &mut SessionState::default());
        let bundle = env.path().join("export.bhb");
        bm.export_backup(&record.id, &bundle).unwrap();

        let other = TestEnv::new();
        let target = manager(&other);
        let imported = target.import_backup(&bundle).unwrap();
        assert_eq!(imported.id, record.id);
        assert_eq!(imported.status, BackupStatus::Imported);
        assert!(target.verify_backup(&record.id).unwrap().valid);

        assert!(target.import_backup(&bundle).is_err());
    }

    #[test]
    fn test_corrupt_index_is_not_reset() {
        let env = TestEnv::new();
        env.write("a", "a");
        let bm = manager(&env);
        fs::create_dir_all(env.data().backups_dir()).unwrap();
        fs::write(bm.index_path(), "{broken").unwrap();

        let err = bm
            .create_full_backup(&BackupOptions::default(), &mut SessionState::default())
            .unwrap_err();
        assert!(matches!(err, Error::IndexCorrupted { .. }));
        assert_eq!(fs::read_to_string(bm.index_path()).unwrap(), "{broken");
    }

    #[test]
    fn test_explicit_file_list() {
        let env = TestEnv::new();
        env.write("a", "a");
        env.write("b", "b");
        let bm = manager(&env);
        let options = BackupOptions {
            files: Some(vec!["./b".to_string()]),
            label: Some("pre-change".to_string()),
            ..Default::default()
        };
        let record = bm.create_full_backup(&options, &mut SessionState::default()).unwrap();
        assert_eq!(record.file_count, 1);
        assert_eq!(record.metadata["label"], "pre-change");

        let missing = BackupOptions {
            files: Some(vec!["nope".to_string()]),
            ..Default::default()
        };
        assert!(bm.create_full_backup(&missing, &mut SessionState::default()).is_err());
    }
}
