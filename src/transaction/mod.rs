//! Transaction Manager.
//!
//! Each transaction lives in its own directory:
//!
//! ```text
//! transactions/<tx-id>/transaction.json
//! transactions/<tx-id>/backups/<op-id>.bak
//! ```
//!
//! A pre-image is copied into `backups/` and checksum-verified before the
//! operation that will destroy it is written to `transaction.json`, so every
//! recorded `update`/`delete`/`manifest_update` can be undone. Rollback walks
//! the operation log in reverse.
//!
//! There is no multi-file atomic commit. A crash mid-transaction leaves an
//! `active` transaction whose log is enough to roll back.

use crate::models::{
    Operation, OperationRequest, OperationType, RollbackFailure, RollbackOptions, RollbackReport,
    Transaction, TransactionMeta, TransactionStatus,
};
use crate::storage::{
    DataDir, copy_file, generate_id, normalize_rel_path, sha256_file, validate_id,
    write_json_atomic,
};
use crate::{Error, Result};
use chrono::{Duration, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const TX_PREFIX: &str = "tx";
const OP_PREFIX: &str = "op";
const META_FILE: &str = "transaction.json";

pub struct TransactionManager {
    repo: PathBuf,
    data: DataDir,
}

impl TransactionManager {
    /// Manage transactions over the tree at `repo`, storing state under `data`.
    pub fn new(repo: impl Into<PathBuf>, data: DataDir) -> Self {
        Self {
            repo: repo.into(),
            data,
        }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    fn tx_dir(&self, id: &str) -> PathBuf {
        self.data.transactions_dir().join(id)
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.tx_dir(id).join(META_FILE)
    }

    fn backup_dir(&self, id: &str) -> PathBuf {
        self.tx_dir(id).join("backups")
    }

    fn load(&self, id: &str) -> Result<Transaction> {
        validate_id(id, TX_PREFIX)?;
        let path = self.meta_path(id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("Transaction {}", id)));
            }
            Err(e) => return Err(Error::Io(e)),
        };
        serde_json::from_str(&content).map_err(|e| Error::IndexCorrupted {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn save(&self, tx: &Transaction) -> Result<()> {
        write_json_atomic(&self.meta_path(&tx.id), tx)
    }

    fn load_active(&self, id: &str) -> Result<Transaction> {
        let tx = self.load(id)?;
        if !tx.is_active() {
            return Err(Error::TransactionNotActive);
        }
        Ok(tx)
    }

    /// Start a transaction and persist its empty operation log.
    pub fn begin_transaction(&self, meta: TransactionMeta) -> Result<String> {
        let id = generate_id(TX_PREFIX, &meta.description);
        fs::create_dir_all(self.backup_dir(&id))?;
        let tx = Transaction::new(id.clone(), meta);
        self.save(&tx)?;
        info!(tx = %id, description = %tx.meta.description, "transaction started");
        Ok(id)
    }

    /// Record an operation without performing it.
    ///
    /// For `update`, `delete` and `manifest_update` on an existing file the
    /// pre-image is stored and verified first; only then is the operation
    /// appended to the log.
    pub fn record_operation(&self, id: &str, request: &OperationRequest) -> Result<Operation> {
        let mut tx = self.load_active(id)?;
        let rel = normalize_rel_path(&request.path)?;
        let abs = self.repo.join(&rel);
        let op_id = generate_id(OP_PREFIX, &request.path);
        let exists = abs.is_file();

        let mut op = Operation {
            id: op_id.clone(),
            op_type: request.op_type,
            target: request
                .target
                .clone()
                .unwrap_or_else(|| request.path.clone()),
            path: request.path.clone(),
            backup_ref: None,
            backup_checksum: None,
            old_content: None,
            new_content: request.new_content.clone(),
            recorded_at: Utc::now(),
        };

        match request.op_type {
            OperationType::Create => {
                if abs.exists() {
                    return Err(Error::InvalidInput(format!(
                        "{} already exists; record an update instead",
                        request.path
                    )));
                }
            }
            OperationType::Update | OperationType::Delete => {
                if !exists {
                    return Err(Error::NotFound(format!(
                        "{} (cannot {} a missing file)",
                        request.path, request.op_type
                    )));
                }
                let (backup_ref, checksum) = self.store_pre_image(id, &op_id, &abs)?;
                op.backup_ref = Some(backup_ref);
                op.backup_checksum = Some(checksum);
            }
            OperationType::ManifestUpdate => {
                if exists {
                    let (backup_ref, checksum) = self.store_pre_image(id, &op_id, &abs)?;
                    op.old_content = Some(fs::read_to_string(&abs)?);
                    op.backup_ref = Some(backup_ref);
                    op.backup_checksum = Some(checksum);
                }
            }
        }

        tx.operations.push(op.clone());
        self.save(&tx)?;
        info!(
            tx = %id,
            op = %op.id,
            kind = %op.op_type,
            path = %op.path,
            backed_up = op.backup_ref.is_some(),
            "operation recorded"
        );
        Ok(op)
    }

    /// Copy `abs` into the transaction's backup dir and verify the copy.
    fn store_pre_image(&self, tx_id: &str, op_id: &str, abs: &Path) -> Result<(String, String)> {
        let backup_ref = format!("{}.bak", op_id);
        let dest = self.backup_dir(tx_id).join(&backup_ref);
        let expected = sha256_file(abs)?;
        copy_file(abs, &dest)?;
        let actual = sha256_file(&dest)?;
        if actual != expected {
            let _ = fs::remove_file(&dest);
            return Err(Error::Other(format!(
                "pre-image of {} changed while it was being backed up",
                abs.display()
            )));
        }
        debug!(tx = tx_id, op = op_id, checksum = %actual, "pre-image stored");
        Ok((backup_ref, actual))
    }

    /// Record an operation, then perform it on the real tree.
    pub fn apply_operation(&self, id: &str, request: &OperationRequest) -> Result<Operation> {
        let needs_content = request.op_type != OperationType::Delete;
        if needs_content && request.new_content.is_none() {
            return Err(Error::InvalidInput(format!(
                "{} of {} needs new content",
                request.op_type, request.path
            )));
        }

        let op = self.record_operation(id, request)?;
        let abs = self.repo.join(normalize_rel_path(&op.path)?);
        match (op.op_type, op.new_content.as_deref()) {
            (OperationType::Delete, _) => fs::remove_file(&abs)?,
            (_, Some(content)) => {
                if let Some(parent) = abs.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&abs, content)?;
            }
            (_, None) => {}
        }
        debug!(tx = id, op = %op.id, path = %op.path, "operation applied");
        Ok(op)
    }

    pub fn commit_transaction(&self, id: &str) -> Result<Transaction> {
        let mut tx = self.load_active(id)?;
        tx.status = TransactionStatus::Committed;
        tx.end_time = Some(Utc::now());
        tx.last_rollback = None;
        self.save(&tx)?;
        info!(tx = %id, operations = tx.operations.len(), "transaction committed");
        Ok(tx)
    }

    /// Undo every recorded operation, newest first.
    ///
    /// The transaction only becomes `rolled_back` when every operation was
    /// undone. Otherwise it stays `active` with the report saved, and rollback
    /// can be run again.
    pub fn rollback_transaction(
        &self,
        id: &str,
        options: RollbackOptions,
    ) -> Result<RollbackReport> {
        let mut tx = self.load_active(id)?;
        let mut report = RollbackReport::default();
        let mut aborted = false;

        for op in tx.operations.iter().rev() {
            match self.undo(&tx.id, op) {
                Ok(()) => {
                    debug!(tx = %id, op = %op.id, path = %op.path, "operation undone");
                    report.successful.push(op.id.clone());
                }
                Err(e) => {
                    warn!(tx = %id, op = %op.id, path = %op.path, error = %e, "undo failed");
                    report.failed.push(RollbackFailure {
                        operation_id: op.id.clone(),
                        path: op.path.clone(),
                        error: e.to_string(),
                    });
                    if !options.continue_on_error {
                        aborted = true;
                        break;
                    }
                }
            }
        }
        report.completed = !aborted;

        if report.is_clean() {
            tx.status = TransactionStatus::RolledBack;
            tx.end_time = Some(Utc::now());
            tx.last_rollback = None;
            info!(tx = %id, undone = report.successful.len(), "transaction rolled back");
        } else {
            tx.last_rollback = Some(report.clone());
            warn!(
                tx = %id,
                undone = report.successful.len(),
                failed = report.failed.len(),
                "rollback incomplete; transaction left active"
            );
        }
        self.save(&tx)?;
        Ok(report)
    }

    /// Reverse one operation. Every branch is safe to repeat.
    fn undo(&self, tx_id: &str, op: &Operation) -> Result<()> {
        let abs = self.repo.join(normalize_rel_path(&op.path)?);
        match op.op_type {
            OperationType::Create => remove_if_present(&abs),
            OperationType::Update | OperationType::Delete => {
                let backup_ref = op.backup_ref.as_deref().ok_or_else(|| {
                    Error::NotFound(format!("backup for operation {}", op.id))
                })?;
                self.restore_pre_image(tx_id, op, backup_ref, &abs)
            }
            OperationType::ManifestUpdate => match &op.old_content {
                Some(text) => {
                    if let Some(parent) = abs.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&abs, text)?;
                    Ok(())
                }
                None => remove_if_present(&abs),
            },
        }
    }

    fn restore_pre_image(
        &self,
        tx_id: &str,
        op: &Operation,
        backup_ref: &str,
        abs: &Path,
    ) -> Result<()> {
        let backup = self.backup_dir(tx_id).join(backup_ref);
        if !backup.is_file() {
            return Err(Error::NotFound(format!("backup file {}", backup.display())));
        }
        if let Some(expected) = &op.backup_checksum {
            let actual = sha256_file(&backup)?;
            if &actual != expected {
                return Err(Error::Other(format!(
                    "backup {} is corrupted (checksum mismatch)",
                    backup_ref
                )));
            }
        }
        copy_file(&backup, abs)?;
        Ok(())
    }

    pub fn show(&self, id: &str) -> Result<Transaction> {
        self.load(id)
    }

    /// Transactions, most recent first.
    pub fn list_transactions(&self, limit: Option<usize>) -> Result<Vec<Transaction>> {
        let dir = self.data.transactions_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut transactions = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_id(&name, TX_PREFIX).is_err() || !entry.path().join(META_FILE).is_file() {
                continue;
            }
            transactions.push(self.load(&name)?);
        }

        transactions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        if let Some(limit) = limit {
            transactions.truncate(limit);
        }
        Ok(transactions)
    }

    pub fn get_last_transaction(&self) -> Result<Option<Transaction>> {
        Ok(self.list_transactions(Some(1))?.into_iter().next())
    }

    /// Delete finished transactions older than the retention window.
    ///
    /// Active transactions are kept regardless of age; their logs are still
    /// needed to roll back.
    pub fn cleanup_old_transactions(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let mut removed = 0;
        for tx in self.list_transactions(None)? {
            if tx.is_active() {
                continue;
            }
            let finished = tx.end_time.unwrap_or(tx.start_time);
            if finished < cutoff {
                fs::remove_dir_all(self.tx_dir(&tx.id))?;
                debug!(tx = %tx.id, "transaction state removed");
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, retention_days, "old transactions cleaned up");
        }
        Ok(removed)
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestEnv;

    fn manager(env: &TestEnv) -> TransactionManager {
        TransactionManager::new(env.path(), env.data())
    }

    fn meta(description: &str) -> TransactionMeta {
        TransactionMeta {
            description: description.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_begin_persists_empty_log() {
        let env = TestEnv::new();
        let tm = manager(&env);
        let id = tm.begin_transaction(meta("empty")).unwrap();

        let tx = tm.show(&id).unwrap();
        assert!(tx.is_active());
        assert!(tx.operations.is_empty());
        assert!(env.data().transactions_dir().join(&id).join("backups").is_dir());
    }

    #[test]
    fn test_pre_image_is_stored_before_mutation() {
        let env = TestEnv::new();
        env.write("config.json", "{\"v\": 1}");
        let tm = manager(&env);
        let id = tm.begin_transaction(meta("update")).unwrap();

        let op = tm
            .record_operation(&id, &OperationRequest::new(OperationType::Update, "config.json"))
            .unwrap();
        let backup = env
            .data()
            .transactions_dir()
            .join(&id)
            .join("backups")
            .join(op.backup_ref.as_deref().unwrap());
        assert_eq!(fs::read_to_string(backup).unwrap(), "{\"v\": 1}");
        assert_eq!(env.read("config.json"), "{\"v\": 1}");
    }

    #[test]
    fn test_rollback_runs_in_reverse_order() {
        let env = TestEnv::new();
        env.write("a.txt", "v1");
        env.write("keep.txt", "untouched");
        let tm = manager(&env);
        let id = tm.begin_transaction(meta("layers")).unwrap();

        let ops = [
            tm.apply_operation(&id, &OperationRequest::new(OperationType::Update, "a.txt").with_content("v2"))
                .unwrap(),
            tm.apply_operation(&id, &OperationRequest::new(OperationType::Update, "a.txt").with_content("v3"))
                .unwrap(),
            tm.apply_operation(&id, &OperationRequest::new(OperationType::Delete, "a.txt"))
                .unwrap(),
            tm.apply_operation(&id, &OperationRequest::new(OperationType::Create, "new/b.txt").with_content("b"))
                .unwrap(),
        ];
        assert!(!env.path().join("a.txt").exists());

        let report = tm.rollback_transaction(&id, RollbackOptions::default()).unwrap();
        assert!(report.is_clean());
        let expected: Vec<String> = ops.iter().rev().map(|op| op.id.clone()).collect();
        assert_eq!(report.successful, expected);

        assert_eq!(env.read("a.txt"), "v1");
        assert_eq!(env.read("keep.txt"), "untouched");
        assert!(!env.path().join("new/b.txt").exists());
        assert_eq!(tm.show(&id).unwrap().status, TransactionStatus::RolledBack);
    }

    #[test]
    fn test_uncommitted_create_is_removed_on_rollback() {
        let env = TestEnv::new();
        let tm = manager(&env);
        let id = tm.begin_transaction(meta("create")).unwrap();
        let op = tm
            .apply_operation(&id, &OperationRequest::new(OperationType::Create, "X").with_content("x"))
            .unwrap();

        let report = tm.rollback_transaction(&id, RollbackOptions::default()).unwrap();
        assert!(!env.path().join("X").exists());
        assert_eq!(report.successful, vec![op.id]);
    }

    #[test]
    fn test_finished_transaction_rejects_changes() {
        let env = TestEnv::new();
        let tm = manager(&env);
        let id = tm.begin_transaction(meta("done")).unwrap();
        tm.commit_transaction(&id).unwrap();

        let err = tm
            .record_operation(&id, &OperationRequest::new(OperationType::Create, "y"))
            .unwrap_err();
        assert_eq!(err.to_string(), "Transaction is not active");
        assert!(matches!(tm.commit_transaction(&id), Err(Error::TransactionNotActive)));
        assert!(matches!(
            tm.rollback_transaction(&id, RollbackOptions::default()),
            Err(Error::TransactionNotActive)
        ));
    }

    #[test]
    fn test_manifest_update_restores_text_verbatim() {
        let env = TestEnv::new();
        env.write("package.json", "{\n  \"name\": \"app\"\n}\n");
        let tm = manager(&env);
        let id = tm.begin_transaction(meta("deps")).unwrap();
        tm.apply_operation(
            &id,
            &OperationRequest::new(OperationType::ManifestUpdate, "package.json").with_content("{}"),
        )
        .unwrap();
        assert_eq!(env.read("package.json"), "{}");

        tm.rollback_transaction(&id, RollbackOptions::default()).unwrap();
        assert_eq!(env.read("package.json"), "{\n  \"name\": \"app\"\n}\n");
    }

    #[test]
    fn test_partial_rollback_keeps_transaction_active() {
        let env = TestEnv::new();
        env.write("a.txt", "a1");
        env.write("b.txt", "b1");
        let tm = manager(&env);
        let id = tm.begin_transaction(meta("partial")).unwrap();
        let op_a = tm
            .apply_operation(&id, &OperationRequest::new(OperationType::Update, "a.txt").with_content("a2"))
            .unwrap();
        let op_b = tm
            .apply_operation(&id, &OperationRequest::new(OperationType::Update, "b.txt").with_content("b2"))
            .unwrap();

        let backups = env.data().transactions_dir().join(&id).join("backups");
        fs::write(backups.join(op_b.backup_ref.as_deref().unwrap()), "tampered").unwrap();

        let report = tm
            .rollback_transaction(&id, RollbackOptions { continue_on_error: false })
            .unwrap();
        assert!(!report.completed);
        assert!(report.successful.is_empty());
        assert_eq!(report.failed[0].operation_id, op_b.id);

        let report = tm
            .rollback_transaction(&id, RollbackOptions { continue_on_error: true })
            .unwrap();
        assert!(report.completed);
        assert_eq!(report.successful, vec![op_a.id]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(env.read("a.txt"), "a1");
        assert_eq!(env.read("b.txt"), "b2");

        let tx = tm.show(&id).unwrap();
        assert!(tx.is_active());
        assert_eq!(tx.last_rollback, Some(report));
    }

    #[test]
    fn test_record_rejects_bad_targets() {
        let env = TestEnv::new();
        env.write("exists.txt", "x");
        let tm = manager(&env);
        let id = tm.begin_transaction(meta("bad")).unwrap();

        assert!(tm.record_operation(&id, &OperationRequest::new(OperationType::Create, "exists.txt")).is_err());
        assert!(tm.record_operation(&id, &OperationRequest::new(OperationType::Delete, "missing.txt")).is_err());
        assert!(tm.record_operation(&id, &OperationRequest::new(OperationType::Update, "../escape")).is_err());
        assert!(tm.apply_operation(&id, &OperationRequest::new(OperationType::Update, "exists.txt")).is_err());
        assert!(tm.show(&id).unwrap().operations.is_empty());
    }

    #[test]
    fn test_list_last_and_cleanup() {
        let env = TestEnv::new();
        let tm = manager(&env);
        let first = tm.begin_transaction(meta("first")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = tm.begin_transaction(meta("second")).unwrap();
        tm.commit_transaction(&first).unwrap();

        let listed: Vec<String> = tm.list_transactions(None).unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(listed, vec![second.clone(), first.clone()]);
        assert_eq!(tm.get_last_transaction().unwrap().unwrap().id, second);

        assert_eq!(tm.cleanup_old_transactions(30).unwrap(), 0);
        assert_eq!(tm.cleanup_old_transactions(0).unwrap(), 1);
        assert!(tm.show(&first).is_err());
        assert!(tm.show(&second).is_ok());
    }

    #[test]
    fn test_corrupt_log_is_reported() {
        let env = TestEnv::new();
        let tm = manager(&env);
        let id = tm.begin_transaction(meta("corrupt")).unwrap();
        fs::write(env.data().transactions_dir().join(&id).join(META_FILE), "{not json").unwrap();
        assert!(matches!(tm.show(&id), Err(Error::IndexCorrupted { .. })));
    }
}
