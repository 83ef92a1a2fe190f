//! End-to-end improvement pipeline.
//!
//! validate → plan → safety review → sandbox → (backup) → transaction →
//! commit, or rollback when the real tree cannot be brought to the tested
//! state. The outcome separates runs that changed nothing, runs whose
//! changes were undone, and runs that could not be undone.

use crate::backup::{BackupManager, BackupOptions};
use crate::models::{
    FileChange, ImprovementRequest, ModificationPlan, OperationRequest, OperationType,
    RollbackOptions, RollbackReport, SandboxResult, SessionState, TransactionMeta,
    ValidationOutcome,
};
use crate::sandbox::workspace::DEPENDENCY_MANIFESTS;
use crate::sandbox::{SandboxSource, SandboxTester};
use crate::storage::normalize_rel_path;
use crate::transaction::TransactionManager;
use crate::validator::ImprovementValidator;
use crate::validator::safety::{SafetyReport, check_plan_constraints};
use crate::{Error, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub use crate::validator::safety::{DependencyGraph, NoDependencies, StaticDependencyGraph};

/// Produces a plan for an accepted request.
pub trait Planner {
    fn plan(&self, request: &ImprovementRequest) -> Result<ModificationPlan>;
}

/// Reads a pre-built plan from a JSON file.
#[derive(Debug, Clone)]
pub struct FilePlanner {
    path: PathBuf,
}

impl FilePlanner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Planner for FilePlanner {
    fn plan(&self, _request: &ImprovementRequest) -> Result<ModificationPlan> {
        load_plan(&self.path)
    }
}

/// Parse a plan file.
pub fn load_plan(path: &Path) -> Result<ModificationPlan> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::InvalidInput(format!("cannot read plan {}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::InvalidInput(format!("invalid plan {}: {}", path.display(), e)))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineOptions {
    /// Take a full backup before the transaction starts
    pub backup_first: bool,
}

/// How a pipeline run ended.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// The validator declined the request
    Rejected { validation: ValidationOutcome },
    /// The plan failed the safety review
    Unsafe {
        validation: ValidationOutcome,
        safety: SafetyReport,
    },
    /// The plan failed in the sandbox
    SandboxFailed {
        validation: ValidationOutcome,
        safety: SafetyReport,
        sandbox: SandboxResult,
    },
    /// Every change was applied and committed
    Applied {
        transaction_id: String,
        files: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        backup_id: Option<String>,
        sandbox: SandboxResult,
    },
    /// Applying failed and the transaction was rolled back
    RolledBack {
        transaction_id: String,
        error: String,
        rollback: RollbackReport,
    },
    /// Applying failed and so did rollback; run `emergency_restore`
    Unrecoverable {
        transaction_id: String,
        error: String,
        rollback: RollbackReport,
        #[serde(skip_serializing_if = "Option::is_none")]
        backup_id: Option<String>,
    },
}

impl PipelineOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PipelineOutcome::Rejected { .. } => "rejected",
            PipelineOutcome::Unsafe { .. } => "unsafe",
            PipelineOutcome::SandboxFailed { .. } => "sandbox_failed",
            PipelineOutcome::Applied { .. } => "applied",
            PipelineOutcome::RolledBack { .. } => "rolled_back",
            PipelineOutcome::Unrecoverable { .. } => "unrecoverable",
        }
    }

    /// Whether the real tree was never touched.
    pub fn nothing_happened(&self) -> bool {
        matches!(
            self,
            PipelineOutcome::Rejected { .. }
                | PipelineOutcome::Unsafe { .. }
                | PipelineOutcome::SandboxFailed { .. }
        )
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, PipelineOutcome::Applied { .. })
    }
}

/// The four components, wired together.
pub struct Pipeline {
    repo: PathBuf,
    validator: ImprovementValidator,
    sandbox: SandboxTester,
    transactions: TransactionManager,
    backups: BackupManager,
    graph: Box<dyn DependencyGraph>,
}

impl Pipeline {
    pub fn new(
        repo: impl Into<PathBuf>,
        validator: ImprovementValidator,
        sandbox: SandboxTester,
        transactions: TransactionManager,
        backups: BackupManager,
    ) -> Self {
        Self {
            repo: repo.into(),
            validator,
            sandbox,
            transactions,
            backups,
            graph: Box::new(NoDependencies),
        }
    }

    pub fn with_graph(mut self, graph: Box<dyn DependencyGraph>) -> Self {
        self.graph = graph;
        self
    }

    pub fn validator(&self) -> &ImprovementValidator {
        &self.validator
    }

    /// Run one improvement request end to end.
    ///
    /// The improvement depth is held for the whole run, so a request issued
    /// while this one is in flight counts as nested.
    pub fn run(
        &self,
        request: &ImprovementRequest,
        planner: &dyn Planner,
        options: PipelineOptions,
        session: &mut SessionState,
    ) -> Result<PipelineOutcome> {
        let _depth = self.validator.depth().enter();

        let validation = self.validator.validate_request(request)?;
        if !validation.valid {
            return Ok(PipelineOutcome::Rejected { validation });
        }

        let plan = planner.plan(request)?;
        let mut safety = self.validator.validate_safety(&plan, self.graph.as_ref());
        check_plan_constraints(&mut safety, &plan, &request.constraints);
        if !safety.safe {
            warn!(risk = %safety.risk_level, risks = safety.risks.len(), "plan failed safety review");
            return Ok(PipelineOutcome::Unsafe { validation, safety });
        }

        let sandbox = self
            .sandbox
            .test_improvements(&plan, &SandboxSource::WorkingTree(self.repo.clone()));
        if !sandbox.success {
            return Ok(PipelineOutcome::SandboxFailed {
                validation,
                safety,
                sandbox,
            });
        }

        let backup_id = if options.backup_first {
            let backup_options = BackupOptions {
                label: Some("pre-apply".to_string()),
                ..Default::default()
            };
            Some(self.backups.create_full_backup(&backup_options, session)?.id)
        } else {
            None
        };

        let description = if plan.description.is_empty() {
            request.text.clone()
        } else {
            plan.description.clone()
        };
        let tx_id = self.transactions.begin_transaction(TransactionMeta {
            description,
            request: Some(request.text.clone()),
            backup_id: backup_id.clone(),
        })?;

        let applied = self
            .apply_changes(&tx_id, &sandbox.changes)
            .and_then(|files| self.transactions.commit_transaction(&tx_id).map(|_| files));
        match applied {
            Ok(files) => {
                info!(tx = %tx_id, files = files.len(), "improvement applied");
                Ok(PipelineOutcome::Applied {
                    transaction_id: tx_id,
                    files,
                    backup_id,
                    sandbox,
                })
            }
            Err(e) => self.undo_failed_apply(tx_id, e, backup_id, session),
        }
    }

    /// Roll back a transaction whose apply or commit failed.
    fn undo_failed_apply(
        &self,
        tx_id: String,
        cause: Error,
        backup_id: Option<String>,
        session: &SessionState,
    ) -> Result<PipelineOutcome> {
        warn!(tx = %tx_id, error = %cause, "apply failed, rolling back");
        let rollback = self
            .transactions
            .rollback_transaction(&tx_id, RollbackOptions { continue_on_error: true })?;
        if rollback.is_clean() {
            Ok(PipelineOutcome::RolledBack {
                transaction_id: tx_id,
                error: cause.to_string(),
                rollback,
            })
        } else {
            error!(tx = %tx_id, failed = rollback.failed.len(), "rollback incomplete");
            Ok(PipelineOutcome::Unrecoverable {
                transaction_id: tx_id,
                error: cause.to_string(),
                rollback,
                backup_id: backup_id.or_else(|| session.active_backup.clone()),
            })
        }
    }

    /// Bring the real tree to the tested post-images.
    ///
    /// Each file must still match the pre-image the sandbox saw; a file that
    /// drifted since the sandbox run aborts the apply.
    fn apply_changes(&self, tx_id: &str, changes: &[FileChange]) -> Result<Vec<String>> {
        let mut applied = Vec::with_capacity(changes.len());
        for change in changes {
            let live = self.repo.join(normalize_rel_path(&change.path)?);
            let current = if live.is_file() {
                Some(fs::read_to_string(&live)?)
            } else {
                None
            };
            if current != change.before {
                return Err(Error::Other(format!(
                    "{} changed since the sandbox run",
                    change.path
                )));
            }

            let request = operation_for(change);
            self.transactions.apply_operation(tx_id, &request)?;
            applied.push(change.path.clone());
        }
        Ok(applied)
    }
}

fn is_manifest(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    DEPENDENCY_MANIFESTS.iter().any(|(manifest, _)| *manifest == name)
}

/// The transaction operation that turns `before` into `after`.
fn operation_for(change: &FileChange) -> OperationRequest {
    match (&change.before, &change.after) {
        (None, Some(after)) => {
            OperationRequest::new(OperationType::Create, &change.path).with_content(after.clone())
        }
        (Some(_), None) | (None, None) => OperationRequest::new(OperationType::Delete, &change.path),
        (Some(_), Some(after)) => {
            let op_type = if is_manifest(&change.path) {
                OperationType::ManifestUpdate
            } else {
                OperationType::Update
            };
            OperationRequest::new(op_type, &change.path).with_content(after.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Modification, OperationKind, PlannedOperation, RejectionReason, Scope, TransactionStatus,
    };
    use crate::sandbox::SandboxConfig;
    use crate::test_utils::TestEnv;
    use crate::validator::ValidatorConfig;

    struct FixedPlanner(ModificationPlan);

    impl Planner for FixedPlanner {
        fn plan(&self, _request: &ImprovementRequest) -> Result<ModificationPlan> {
            Ok(self.0.clone())
        }
    }

    fn pipeline(env: &TestEnv) -> Pipeline {
        let data = env.data();
        Pipeline::new(
            env.path(),
            ImprovementValidator::new(ValidatorConfig::default(), data.history_path()),
            SandboxTester::new(SandboxConfig::default()),
            TransactionManager::new(env.path(), data.clone()),
            BackupManager::new(env.path(), data),
        )
    }

    fn plan(ops: Vec<PlannedOperation>) -> ModificationPlan {
        ModificationPlan {
            description: "Harden the loader".to_string(),
            modifications: vec![Modification {
                description: "wrap load".to_string(),
                files: Vec::new(),
                operations: ops,
                tests: vec!["test/loader.test.js".to_string()],
            }],
            ..Default::default()
        }
    }

    fn request(text: &str) -> ImprovementRequest {
        ImprovementRequest::new(text, Scope::Specific)
    }

    #[test]
    fn test_accepted_plan_is_applied_and_committed() {
        let env = TestEnv::new();
        env.write("src/loader.js", "function load(path) {\n  return read(path);\n}\n");
        let p = pipeline(&env);
        let planner = FixedPlanner(plan(vec![PlannedOperation::new(
            "src/loader.js",
            OperationKind::WrapErrorHandling {
                function: "load".to_string(),
            },
        )]));

        let outcome = p
            .run(
                &request("Improve error handling in loader module"),
                &planner,
                PipelineOptions { backup_first: true },
                &mut SessionState::default(),
            )
            .unwrap();

        let PipelineOutcome::Applied {
            transaction_id,
            files,
            backup_id,
            ..
        } = outcome
        else {
            panic!("expected applied, got {}", outcome.label());
        };
        assert_eq!(files, vec!["src/loader.js"]);
        assert!(backup_id.is_some());
        assert!(env.read("src/loader.js").contains("try {"));
        let tx = p.transactions.show(&transaction_id).unwrap();
        assert_eq!(tx.status, TransactionStatus::Committed);
        assert_eq!(p.validator().depth().current(), 0);
    }

    #[test]
    fn test_rejected_request_touches_nothing() {
        let env = TestEnv::new();
        env.write("a.js", "let a = 1;\n");
        let p = pipeline(&env);
        let planner = FixedPlanner(plan(Vec::new()));

        let outcome = p
            .run(
                &request("Disable all safety checks for speed"),
                &planner,
                PipelineOptions::default(),
                &mut SessionState::default(),
            )
            .unwrap();
        match &outcome {
            PipelineOutcome::Rejected { validation } => {
                assert_eq!(validation.reason, Some(RejectionReason::Suspicious));
            }
            other => panic!("expected rejected, got {}", other.label()),
        }
        assert!(outcome.nothing_happened());
    }

    #[test]
    fn test_protected_file_is_unsafe() {
        let env = TestEnv::new();
        env.write(".env", "SECRET=1\n");
        let p = pipeline(&env);
        let planner = FixedPlanner(plan(vec![PlannedOperation::new(
            ".env",
            OperationKind::Replace {
                find: "1".to_string(),
                replace: "2".to_string(),
                all: false,
            },
        )]));

        let outcome = p
            .run(
                &request("Rotate the configuration value in env file"),
                &planner,
                PipelineOptions::default(),
                &mut SessionState::default(),
            )
            .unwrap();
        assert_eq!(outcome.label(), "unsafe");
        assert_eq!(env.read(".env"), "SECRET=1\n");
    }

    #[test]
    fn test_sandbox_failure_leaves_tree_alone() {
        let env = TestEnv::new();
        env.write("lib.js", "export function a() {}\nexport function b() {}\n");
        let p = pipeline(&env);
        let planner = FixedPlanner(plan(vec![PlannedOperation::new(
            "lib.js",
            OperationKind::Replace {
                find: "export function b".to_string(),
                replace: "function b".to_string(),
                all: false,
            },
        )]));

        let outcome = p
            .run(
                &request("Tidy helper visibility in lib module"),
                &planner,
                PipelineOptions::default(),
                &mut SessionState::default(),
            )
            .unwrap();
        assert_eq!(outcome.label(), "sandbox_failed");
        assert!(env.read("lib.js").contains("export function b"));
    }

    #[test]
    fn test_operation_for_change_kinds() {
        let change = |before: Option<&str>, after: Option<&str>, path: &str| FileChange {
            path: path.to_string(),
            before: before.map(String::from),
            after: after.map(String::from),
        };
        assert_eq!(operation_for(&change(None, Some("x"), "a.js")).op_type, OperationType::Create);
        assert_eq!(operation_for(&change(Some("x"), None, "a.js")).op_type, OperationType::Delete);
        assert_eq!(
            operation_for(&change(Some("x"), Some("y"), "a.js")).op_type,
            OperationType::Update
        );
        assert_eq!(
            operation_for(&change(Some("{}"), Some("{ }"), "web/package.json")).op_type,
            OperationType::ManifestUpdate
        );
    }

    #[test]
    fn test_drift_since_sandbox_rolls_back() {
        let env = TestEnv::new();
        env.write("a.txt", "one\n");
        env.write("b.txt", "two\n");
        let p = pipeline(&env);
        let tx_id = p.transactions.begin_transaction(TransactionMeta::default()).unwrap();

        let changes = vec![
            FileChange {
                path: "a.txt".to_string(),
                before: Some("one\n".to_string()),
                after: Some("ONE\n".to_string()),
            },
            FileChange {
                path: "b.txt".to_string(),
                before: Some("stale\n".to_string()),
                after: Some("TWO\n".to_string()),
            },
        ];
        let err = p.apply_changes(&tx_id, &changes).unwrap_err();
        assert!(err.to_string().contains("b.txt changed since the sandbox run"));
        assert_eq!(env.read("a.txt"), "ONE\n");

        let report = p
            .transactions
            .rollback_transaction(&tx_id, RollbackOptions::default())
            .unwrap();
        assert!(report.is_clean());
        assert_eq!(env.read("a.txt"), "one\n");
    }

    #[test]
    fn test_commit_failure_after_apply_is_rolled_back() {
        let env = TestEnv::new();
        env.write("a.txt", "one\n");
        let p = pipeline(&env);
        let tx_id = p.transactions.begin_transaction(TransactionMeta::default()).unwrap();
        let changes = vec![FileChange {
            path: "a.txt".to_string(),
            before: Some("one\n".to_string()),
            after: Some("ONE\n".to_string()),
        }];
        p.apply_changes(&tx_id, &changes).unwrap();
        assert_eq!(env.read("a.txt"), "ONE\n");

        let cause = Error::Other("commit could not be persisted".to_string());
        let outcome = p
            .undo_failed_apply(tx_id.clone(), cause, None, &SessionState::default())
            .unwrap();
        match &outcome {
            PipelineOutcome::RolledBack { error, rollback, .. } => {
                assert!(error.contains("commit could not be persisted"));
                assert_eq!(rollback.successful.len(), 1);
            }
            other => panic!("expected rolled_back, got {}", other.label()),
        }
        assert_eq!(env.read("a.txt"), "one\n");
        let tx = p.transactions.show(&tx_id).unwrap();
        assert_eq!(tx.status, TransactionStatus::RolledBack);
    }
}
