//! Command implementations for the `bh` CLI.
//!
//! Each command builds the components it needs from a [`Context`], runs one
//! operation and returns a value implementing [`CommandResult`]. Designed
//! negative outcomes (a rejected request, a failed sandbox run, a partial
//! rollback) are results with `success() == false`, not errors.

use crate::backup::{BackupManager, BackupOptions, BackupStats, RestoreOptions};
use crate::config::{ResolvedConfig, project_config_path};
use crate::models::{
    BackupFilter, BackupRecord, Constraints, HistoryEntry, HistoryOutcome, ImprovementRequest,
    Operation, OperationRequest, OperationType, RestoreReport, RollbackOptions, RollbackReport,
    SandboxResult, Scope, SessionState, Transaction, TransactionMeta, ValidationOutcome,
    VerifyReport,
};
use crate::pipeline::{
    DependencyGraph, FilePlanner, NoDependencies, Pipeline, PipelineOptions, PipelineOutcome,
    StaticDependencyGraph, load_plan,
};
use crate::process::CancelToken;
use crate::sandbox::{SandboxSource, SandboxTester};
use crate::storage::{DataDir, read_json_index, write_json_atomic};
use crate::transaction::TransactionManager;
use crate::validator::ImprovementValidator;
use crate::validator::safety::{SafetyReport, check_plan_constraints};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

/// Command results that can be serialized to JSON or formatted for humans.
pub trait CommandResult {
    /// Serialize to JSON string.
    fn to_json(&self) -> String;

    /// Format for human-readable output.
    fn to_human(&self) -> String;

    /// Whether the command reached its goal. `false` exits with status 2.
    fn success(&self) -> bool {
        true
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!(r#"{{"error": "{}"}}"#, e))
}

/// Everything a command needs to build the components.
pub struct Context {
    pub repo: PathBuf,
    pub config: ResolvedConfig,
    pub cancel: CancelToken,
}

impl Context {
    pub fn new(repo: impl Into<PathBuf>, config: ResolvedConfig, cancel: CancelToken) -> Self {
        Self {
            repo: repo.into(),
            config,
            cancel,
        }
    }

    pub fn data(&self) -> DataDir {
        self.config.data()
    }

    pub fn validator(&self) -> ImprovementValidator {
        ImprovementValidator::new(self.config.validator_config(), self.data().history_path())
    }

    pub fn sandbox(&self) -> SandboxTester {
        SandboxTester::new(self.config.sandbox_config()).with_cancel(self.cancel.clone())
    }

    pub fn transactions(&self) -> TransactionManager {
        TransactionManager::new(&self.repo, self.data())
    }

    pub fn backups(&self) -> BackupManager {
        BackupManager::new(&self.repo, self.data())
            .with_excludes(self.config.all_excludes())
            .with_retention(self.config.backup_retention.value)
    }

    fn load_session(&self) -> Result<SessionState> {
        read_json_index(&self.data().session_path())
    }

    fn save_session(&self, session: &SessionState) -> Result<()> {
        write_json_atomic(&self.data().session_path(), session)
    }
}

/// Raw request inputs as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct RequestInput {
    pub text: Option<String>,
    pub file: Option<PathBuf>,
    pub scope: Option<String>,
    pub max_files: Option<usize>,
    pub require_tests: bool,
    pub preserve_interfaces: bool,
}

/// Build a request from inline text or a JSON file; flags override the file.
pub fn build_request(input: &RequestInput) -> Result<ImprovementRequest> {
    let mut request = match (&input.file, &input.text) {
        (Some(path), _) => {
            let content = fs::read_to_string(path)?;
            serde_json::from_str::<ImprovementRequest>(&content).map_err(|e| {
                Error::InvalidInput(format!("invalid request {}: {}", path.display(), e))
            })?
        }
        (None, Some(text)) => ImprovementRequest::new(text.clone(), Scope::default()),
        (None, None) => {
            return Err(Error::InvalidInput(
                "a request text or --request-file is required".to_string(),
            ));
        }
    };

    if let Some(ref scope) = input.scope {
        request.scope = Scope::parse(scope)
            .ok_or_else(|| Error::InvalidInput(format!("unknown scope '{}'", scope)))?;
    }
    let constraints = &mut request.constraints;
    if input.max_files.is_some() {
        constraints.max_files = input.max_files;
    }
    if input.require_tests {
        constraints.require_tests = Some(true);
    }
    if input.preserve_interfaces {
        constraints.preserve_interfaces = Some(true);
    }
    Ok(request)
}

fn load_graph(path: Option<&Path>) -> Result<Box<dyn DependencyGraph>> {
    Ok(match path {
        Some(path) => Box::new(StaticDependencyGraph::from_file(path)?),
        None => Box::new(NoDependencies),
    })
}

fn push_list(out: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "{}:", title);
    for item in items {
        let _ = writeln!(out, "  - {}", item);
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

// === validate / safety / sandbox / apply ===

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct ValidateOutput(pub ValidationOutcome);

impl CommandResult for ValidateOutput {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let outcome = &self.0;
        let mut out = String::new();
        match outcome.reason {
            None => out.push_str("Request accepted\n"),
            Some(reason) => {
                let _ = writeln!(out, "Request rejected: {}", reason);
            }
        }
        let risk = &outcome.risk_assessment;
        let _ = writeln!(out, "Risk score: {} (threshold {})", risk.score, risk.threshold);
        for factor in &risk.factors {
            let _ = writeln!(out, "  + {} ({})", factor.name, factor.points);
        }
        push_list(&mut out, "Warnings", &outcome.warnings);
        out.trim_end().to_string()
    }

    fn success(&self) -> bool {
        self.0.valid
    }
}

/// Validate a request and record it in the improvement history.
pub fn validate(ctx: &Context, request: &ImprovementRequest) -> Result<ValidateOutput> {
    Ok(ValidateOutput(ctx.validator().validate_request(request)?))
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct SafetyOutput(pub SafetyReport);

impl CommandResult for SafetyOutput {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let report = &self.0;
        let mut out = String::new();
        let verdict = if report.safe { "safe" } else { "UNSAFE" };
        let _ = writeln!(out, "Plan is {} (risk: {})", verdict, report.risk_level);
        for (risk, mitigation) in report.risks.iter().zip(&report.mitigations) {
            let _ = writeln!(out, "  [{}] {}", risk.severity, risk.message);
            let _ = writeln!(out, "      -> {}", mitigation);
        }
        push_list(&mut out, "Breaking changes", &report.breaking_changes);
        out.trim_end().to_string()
    }

    fn success(&self) -> bool {
        self.0.safe
    }
}

/// Review a plan file without running anything.
pub fn safety(
    ctx: &Context,
    plan_path: &Path,
    graph_path: Option<&Path>,
    constraints: &Constraints,
) -> Result<SafetyOutput> {
    let plan = load_plan(plan_path)?;
    let graph = load_graph(graph_path)?;
    let mut report = ctx.validator().validate_safety(&plan, graph.as_ref());
    check_plan_constraints(&mut report, &plan, constraints);
    Ok(SafetyOutput(report))
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct SandboxOutput(pub SandboxResult);

fn sandbox_summary(out: &mut String, result: &SandboxResult) {
    let _ = writeln!(
        out,
        "Tests: {} passed, {} failed",
        result.tests_passed, result.tests_failed
    );
    let _ = writeln!(out, "Performance impact: {}", result.performance_impact);
    let _ = writeln!(out, "Stage reached: {}", result.stage);
    push_list(out, "Breaking changes", &result.breaking_changes);
    push_list(out, "Errors", &result.errors);
    push_list(out, "Warnings", &result.warnings);
}

impl CommandResult for SandboxOutput {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let result = &self.0;
        let mut out = String::new();
        let verdict = if result.success { "passed" } else { "FAILED" };
        let _ = writeln!(out, "Sandbox run {} ({} file(s) changed)", verdict, result.changes.len());
        sandbox_summary(&mut out, result);
        out.trim_end().to_string()
    }

    fn success(&self) -> bool {
        self.0.success
    }
}

/// Run a plan in a disposable copy of the tree, or of a backup snapshot.
pub fn sandbox(ctx: &Context, plan_path: &Path, backup: Option<&str>) -> Result<SandboxOutput> {
    let plan = load_plan(plan_path)?;
    let tester = ctx.sandbox();
    let result = match backup {
        Some(backup_id) => {
            let snapshot = tempfile::Builder::new().prefix("bh-snapshot-").tempdir()?;
            ctx.backups().extract_to(backup_id, snapshot.path())?;
            let source = SandboxSource::Snapshot {
                backup_id: backup_id.to_string(),
                root: snapshot.path().to_path_buf(),
            };
            tester.test_improvements(&plan, &source)
        }
        None => tester.test_improvements(&plan, &SandboxSource::WorkingTree(ctx.repo.clone())),
    };
    Ok(SandboxOutput(result))
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct ApplyOutput(pub PipelineOutcome);

impl CommandResult for ApplyOutput {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let mut out = String::new();
        match &self.0 {
            PipelineOutcome::Rejected { validation } => {
                let reason = validation.reason.map(|r| r.to_string()).unwrap_or_default();
                let _ = writeln!(out, "Rejected: {}", reason);
                push_list(&mut out, "Warnings", &validation.warnings);
            }
            PipelineOutcome::Unsafe { safety, .. } => {
                let _ = writeln!(out, "Plan failed safety review (risk: {})", safety.risk_level);
                for risk in &safety.risks {
                    let _ = writeln!(out, "  [{}] {}", risk.severity, risk.message);
                }
            }
            PipelineOutcome::SandboxFailed { sandbox, .. } => {
                out.push_str("Sandbox run failed; the working tree was not touched\n");
                sandbox_summary(&mut out, sandbox);
            }
            PipelineOutcome::Applied {
                transaction_id,
                files,
                backup_id,
                sandbox,
            } => {
                let _ = writeln!(out, "Applied in transaction {}", transaction_id);
                if let Some(backup_id) = backup_id {
                    let _ = writeln!(out, "Backup: {}", backup_id);
                }
                push_list(&mut out, "Files", files);
                let _ = writeln!(out, "Performance impact: {}", sandbox.performance_impact);
            }
            PipelineOutcome::RolledBack {
                transaction_id,
                error,
                rollback,
            } => {
                let _ = writeln!(out, "Apply failed: {}", error);
                let _ = writeln!(
                    out,
                    "Transaction {} rolled back ({} operation(s) undone)",
                    transaction_id,
                    rollback.successful.len()
                );
            }
            PipelineOutcome::Unrecoverable {
                transaction_id,
                error,
                rollback,
                backup_id,
            } => {
                let _ = writeln!(out, "Apply failed: {}", error);
                let _ = writeln!(
                    out,
                    "Rollback of {} incomplete: {} operation(s) failed",
                    transaction_id,
                    rollback.failed.len()
                );
                for failure in &rollback.failed {
                    let _ = writeln!(out, "  - {}: {}", failure.path, failure.error);
                }
                match backup_id {
                    Some(id) => {
                        let _ = writeln!(out, "Run `bh backup restore {}` to recover", id);
                    }
                    None => out.push_str("Run `bh backup emergency-restore` to recover\n"),
                }
            }
        }
        out.trim_end().to_string()
    }

    fn success(&self) -> bool {
        self.0.is_applied()
    }
}

/// Run the whole pipeline for one request and plan.
pub fn apply(
    ctx: &Context,
    request: &ImprovementRequest,
    plan_path: &Path,
    graph_path: Option<&Path>,
    backup_first: bool,
) -> Result<ApplyOutput> {
    let mut session = ctx.load_session()?;
    let pipeline = Pipeline::new(
        &ctx.repo,
        ctx.validator(),
        ctx.sandbox(),
        ctx.transactions(),
        ctx.backups(),
    )
    .with_graph(load_graph(graph_path)?);
    let outcome = pipeline.run(
        request,
        &FilePlanner::new(plan_path),
        PipelineOptions { backup_first },
        &mut session,
    )?;
    ctx.save_session(&session)?;
    Ok(ApplyOutput(outcome))
}

// === tx ===

#[derive(Debug, Serialize)]
pub struct TxBegun {
    pub id: String,
}

impl CommandResult for TxBegun {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        format!("Started transaction {}", self.id)
    }
}

pub fn tx_begin(ctx: &Context, description: Option<String>) -> Result<TxBegun> {
    let meta = TransactionMeta {
        description: description.unwrap_or_default(),
        ..Default::default()
    };
    Ok(TxBegun {
        id: ctx.transactions().begin_transaction(meta)?,
    })
}

#[derive(Debug, Serialize)]
pub struct TxOperationRecorded {
    pub transaction_id: String,
    pub applied: bool,
    pub operation: Operation,
}

impl CommandResult for TxOperationRecorded {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let verb = if self.applied { "Applied" } else { "Recorded" };
        let mut out = format!(
            "{} {} {} as {} in {}",
            verb, self.operation.op_type, self.operation.path, self.operation.id, self.transaction_id
        );
        if let Some(ref backup) = self.operation.backup_ref {
            let _ = write!(out, "\nPre-image: {}", backup);
        }
        out
    }
}

/// Record an operation, and perform it unless `record_only`.
pub fn tx_apply(
    ctx: &Context,
    id: &str,
    op_type: &str,
    path: &str,
    content: Option<String>,
    content_file: Option<&Path>,
    record_only: bool,
) -> Result<TxOperationRecorded> {
    let op_type = OperationType::parse(op_type)
        .ok_or_else(|| Error::InvalidInput(format!("unknown operation type '{}'", op_type)))?;
    let content = match content_file {
        Some(file) => Some(fs::read_to_string(file)?),
        None => content,
    };
    let mut request = OperationRequest::new(op_type, path);
    if let Some(content) = content {
        request = request.with_content(content);
    }

    let manager = ctx.transactions();
    let operation = if record_only {
        manager.record_operation(id, &request)?
    } else {
        manager.apply_operation(id, &request)?
    };
    Ok(TxOperationRecorded {
        transaction_id: id.to_string(),
        applied: !record_only,
        operation,
    })
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct TxShow(pub Transaction);

impl CommandResult for TxShow {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let tx = &self.0;
        let mut out = String::new();
        let _ = writeln!(out, "{} [{}]", tx.id, tx.status);
        if !tx.meta.description.is_empty() {
            let _ = writeln!(out, "  {}", tx.meta.description);
        }
        let _ = writeln!(out, "  Started: {}", tx.start_time.format("%Y-%m-%d %H:%M:%S UTC"));
        if let Some(end) = tx.end_time {
            let _ = writeln!(out, "  Ended: {}", end.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        let _ = writeln!(out, "  Operations: {}", tx.operations.len());
        for op in &tx.operations {
            let _ = writeln!(out, "    {} {} {}", op.id, op.op_type, op.path);
        }
        if let Some(ref report) = tx.last_rollback {
            let _ = writeln!(
                out,
                "  Last rollback: {} undone, {} failed",
                report.successful.len(),
                report.failed.len()
            );
        }
        out.trim_end().to_string()
    }
}

pub fn tx_commit(ctx: &Context, id: &str) -> Result<TxShow> {
    Ok(TxShow(ctx.transactions().commit_transaction(id)?))
}

pub fn tx_show(ctx: &Context, id: &str) -> Result<TxShow> {
    Ok(TxShow(ctx.transactions().show(id)?))
}

#[derive(Debug, Serialize)]
pub struct TxRolledBack {
    pub transaction_id: String,
    #[serde(flatten)]
    pub report: RollbackReport,
}

impl CommandResult for TxRolledBack {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let mut out = String::new();
        if self.report.is_clean() {
            let _ = writeln!(
                out,
                "Rolled back {} ({} operation(s) undone)",
                self.transaction_id,
                self.report.successful.len()
            );
        } else {
            let _ = writeln!(
                out,
                "Rollback of {} incomplete; transaction stays active",
                self.transaction_id
            );
            for failure in &self.report.failed {
                let _ = writeln!(out, "  - {} {}: {}", failure.operation_id, failure.path, failure.error);
            }
        }
        out.trim_end().to_string()
    }

    fn success(&self) -> bool {
        self.report.is_clean()
    }
}

pub fn tx_rollback(ctx: &Context, id: &str, continue_on_error: bool) -> Result<TxRolledBack> {
    let report = ctx
        .transactions()
        .rollback_transaction(id, RollbackOptions { continue_on_error })?;
    Ok(TxRolledBack {
        transaction_id: id.to_string(),
        report,
    })
}

#[derive(Debug, Serialize)]
pub struct TxList {
    pub count: usize,
    pub transactions: Vec<Transaction>,
}

impl CommandResult for TxList {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        if self.transactions.is_empty() {
            return "No transactions.".to_string();
        }
        let mut out = String::new();
        for tx in &self.transactions {
            let _ = writeln!(
                out,
                "{} [{}] {} op(s) {}",
                tx.id,
                tx.status,
                tx.operations.len(),
                tx.meta.description
            );
        }
        out.trim_end().to_string()
    }
}

pub fn tx_list(ctx: &Context, limit: Option<usize>) -> Result<TxList> {
    let transactions = ctx.transactions().list_transactions(limit)?;
    Ok(TxList {
        count: transactions.len(),
        transactions,
    })
}

#[derive(Debug, Serialize)]
pub struct TxLast {
    pub transaction: Option<Transaction>,
}

impl CommandResult for TxLast {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        match self.transaction {
            Some(ref tx) => TxShow(tx.clone()).to_human(),
            None => "No transactions.".to_string(),
        }
    }
}

pub fn tx_last(ctx: &Context) -> Result<TxLast> {
    Ok(TxLast {
        transaction: ctx.transactions().get_last_transaction()?,
    })
}

#[derive(Debug, Serialize)]
pub struct TxCleanup {
    pub removed: usize,
    pub retention_days: u32,
}

impl CommandResult for TxCleanup {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "Removed {} transaction(s) older than {} day(s)",
            self.removed, self.retention_days
        )
    }
}

pub fn tx_cleanup(ctx: &Context, days: Option<u32>) -> Result<TxCleanup> {
    let retention_days = days.unwrap_or(ctx.config.transaction_retention_days.value);
    Ok(TxCleanup {
        removed: ctx.transactions().cleanup_old_transactions(retention_days)?,
        retention_days,
    })
}

// === backup ===

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct BackupShow(pub BackupRecord);

impl CommandResult for BackupShow {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let b = &self.0;
        let mut out = format!(
            "{} ({} file(s), {}, archive {})",
            b.id,
            b.file_count,
            format_size(b.size),
            format_size(b.archive_size)
        );
        if let Some(ref label) = b.label {
            let _ = write!(out, "\n  Label: {}", label);
        }
        let _ = write!(out, "\n  Created: {}", b.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
        out
    }
}

/// Parse `key=value` pairs into backup metadata.
pub fn parse_metadata(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| {
                    Error::InvalidInput(format!("metadata must be key=value, got '{}'", pair))
                })
        })
        .collect()
}

pub fn backup_create(
    ctx: &Context,
    label: Option<String>,
    files: Option<Vec<String>>,
    metadata: &[String],
) -> Result<BackupShow> {
    let options = BackupOptions {
        files,
        label,
        metadata: parse_metadata(metadata)?,
    };
    let mut session = ctx.load_session()?;
    let record = ctx.backups().create_full_backup(&options, &mut session)?;
    ctx.save_session(&session)?;
    Ok(BackupShow(record))
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct RestoreOutput(pub RestoreReport);

impl CommandResult for RestoreOutput {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let r = &self.0;
        let mut out = String::new();
        if r.dry_run {
            let _ = writeln!(out, "Dry run of restore from {}", r.backup_id);
            for change in &r.changes {
                let state = serde_json::to_value(change.state)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default();
                let _ = writeln!(out, "  {:<9} {}", state, change.path);
            }
        } else {
            let verdict = if r.success { "Restored" } else { "Partially restored" };
            let _ = writeln!(
                out,
                "{} {} file(s) from {}",
                verdict,
                r.restored_files.len(),
                r.backup_id
            );
            push_list(&mut out, "Recreated", &r.recreated_files);
            push_list(&mut out, "Copied aside", &r.pre_restore_copies);
            for failed in &r.failed_files {
                let _ = writeln!(out, "  FAILED {}: {}", failed.path, failed.error);
            }
        }
        push_list(&mut out, "Warnings", &r.warnings);
        out.trim_end().to_string()
    }

    fn success(&self) -> bool {
        self.0.success
    }
}

pub fn backup_restore(ctx: &Context, id: &str, dry_run: bool) -> Result<RestoreOutput> {
    Ok(RestoreOutput(
        ctx.backups().restore_backup(id, RestoreOptions { dry_run })?,
    ))
}

/// Restore the session's backup, or the newest one.
pub fn backup_emergency_restore(ctx: &Context) -> Result<RestoreOutput> {
    let session = ctx.load_session()?;
    Ok(RestoreOutput(ctx.backups().emergency_restore(&session)?))
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct VerifyOutput(pub VerifyReport);

impl CommandResult for VerifyOutput {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let r = &self.0;
        if r.valid {
            return format!("{} is valid ({} file(s) checked)", r.backup_id, r.checked_files);
        }
        let mut out = format!("{} is INVALID", r.backup_id);
        for error in &r.errors {
            let _ = write!(out, "\n  - {}", error);
        }
        out
    }

    fn success(&self) -> bool {
        self.0.valid
    }
}

pub fn backup_verify(ctx: &Context, id: &str) -> Result<VerifyOutput> {
    Ok(VerifyOutput(ctx.backups().verify_backup(id)?))
}

#[derive(Debug, Serialize)]
pub struct BackupList {
    pub count: usize,
    pub backups: Vec<BackupRecord>,
    pub stats: BackupStats,
}

impl CommandResult for BackupList {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        if self.backups.is_empty() {
            return "No backups.".to_string();
        }
        let mut out = String::new();
        for b in &self.backups {
            let _ = writeln!(
                out,
                "{}  {}  {:>4} file(s)  {:>9}  {}",
                b.id,
                b.created_at.format("%Y-%m-%d %H:%M"),
                b.file_count,
                format_size(b.archive_size),
                b.label.as_deref().unwrap_or("")
            );
        }
        let _ = write!(
            out,
            "{} backup(s), {} on disk",
            self.stats.count,
            format_size(self.stats.total_archive_size)
        );
        out
    }
}

pub fn backup_list(
    ctx: &Context,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    label: Option<String>,
) -> Result<BackupList> {
    let manager = ctx.backups();
    let backups = manager.list_backups(&BackupFilter {
        since,
        until,
        label,
    })?;
    Ok(BackupList {
        count: backups.len(),
        backups,
        stats: manager.stats()?,
    })
}

#[derive(Debug, Serialize)]
pub struct BackupDeleted {
    pub deleted: BackupRecord,
}

impl CommandResult for BackupDeleted {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        format!("Deleted backup {}", self.deleted.id)
    }
}

pub fn backup_delete(ctx: &Context, id: &str) -> Result<BackupDeleted> {
    let mut session = ctx.load_session()?;
    let deleted = ctx.backups().delete_backup(id, &mut session)?;
    ctx.save_session(&session)?;
    Ok(BackupDeleted { deleted })
}

#[derive(Debug, Serialize)]
pub struct BackupExported {
    pub id: String,
    pub path: PathBuf,
}

impl CommandResult for BackupExported {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        format!("Exported {} to {}", self.id, self.path.display())
    }
}

pub fn backup_export(ctx: &Context, id: &str, dest: &Path) -> Result<BackupExported> {
    let record = ctx.backups().export_backup(id, dest)?;
    Ok(BackupExported {
        id: record.id,
        path: dest.to_path_buf(),
    })
}

pub fn backup_import(ctx: &Context, src: &Path) -> Result<BackupShow> {
    Ok(BackupShow(ctx.backups().import_backup(src)?))
}

// === history ===

#[derive(Debug, Serialize)]
pub struct HistoryList {
    pub count: usize,
    pub entries: Vec<HistoryEntry>,
}

impl CommandResult for HistoryList {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        if self.entries.is_empty() {
            return "No improvement history.".to_string();
        }
        let mut out = String::new();
        for entry in &self.entries {
            let verdict = match entry.outcome {
                HistoryOutcome::Accepted => "accepted".to_string(),
                HistoryOutcome::Rejected { ref reason } => format!("rejected ({})", reason),
            };
            let _ = writeln!(
                out,
                "#{} {} {}: {}",
                entry.id,
                entry.timestamp.format("%Y-%m-%d %H:%M"),
                verdict,
                entry.request
            );
        }
        out.trim_end().to_string()
    }
}

/// Most recent entries first.
pub fn history_list(ctx: &Context, limit: Option<usize>) -> Result<HistoryList> {
    let mut entries = ctx.validator().history().load()?;
    entries.reverse();
    if let Some(limit) = limit {
        entries.truncate(limit);
    }
    Ok(HistoryList {
        count: entries.len(),
        entries,
    })
}

#[derive(Debug, Serialize)]
pub struct HistoryCleared {
    pub removed: usize,
}

impl CommandResult for HistoryCleared {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        format!("Cleared {} history entr{}", self.removed, if self.removed == 1 { "y" } else { "ies" })
    }
}

pub fn history_clear(ctx: &Context) -> Result<HistoryCleared> {
    Ok(HistoryCleared {
        removed: ctx.validator().history().clear()?,
    })
}

// === config ===

#[derive(Debug, Serialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub source: String,
}

#[derive(Debug, Serialize)]
pub struct ConfigShow {
    pub repo: PathBuf,
    pub settings: Vec<ConfigEntry>,
}

impl CommandResult for ConfigShow {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let width = self.settings.iter().map(|e| e.key.len()).max().unwrap_or(0);
        let mut out = format!("Configuration for {}\n", self.repo.display());
        for entry in &self.settings {
            let value = match entry.value {
                serde_json::Value::String(ref s) => s.clone(),
                serde_json::Value::Null => "(unset)".to_string(),
                ref other => other.to_string(),
            };
            let _ = writeln!(out, "  {:<width$}  {}  [{}]", entry.key, value, entry.source);
        }
        out.trim_end().to_string()
    }
}

pub fn config_show(ctx: &Context) -> Result<ConfigShow> {
    let settings = ctx
        .config
        .entries()
        .into_iter()
        .map(|(key, value, source)| ConfigEntry {
            key: key.to_string(),
            value,
            source,
        })
        .collect();
    Ok(ConfigShow {
        repo: ctx.repo.clone(),
        settings,
    })
}

#[derive(Debug, Serialize)]
pub struct ConfigInit {
    pub path: PathBuf,
}

impl CommandResult for ConfigInit {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        format!("Wrote {}", self.path.display())
    }
}

/// Write the effective settings as the project config.
pub fn config_init(ctx: &Context, force: bool) -> Result<ConfigInit> {
    let path = project_config_path(&ctx.repo);
    if path.exists() && !force {
        return Err(Error::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    fs::write(&path, ctx.config.to_layer().to_kdl().to_string())?;
    Ok(ConfigInit { path })
}
