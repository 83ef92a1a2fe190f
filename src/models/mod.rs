//! Data models shared by the pipeline components.
//!
//! - [`request`] - improvement requests, fingerprints, risk and validation outcomes
//! - [`plan`] - modification plans produced by an external planner
//! - [`transaction`] - transactions and their recorded operations
//! - [`backup`] - backup records, manifests, restore/verify reports
//! - [`sandbox`] - sandbox stages and results

pub mod backup;
pub mod plan;
pub mod request;
pub mod sandbox;
pub mod transaction;

pub use backup::{
    BackupFilter, BackupIndex, BackupManifest, BackupRecord, BackupStatus, ChangeState,
    FailedFile, FileChangeSummary, RestoreReport, SessionState, VerifyError, VerifyReport,
};
pub use plan::{
    Impact, InsertPosition, Modification, ModificationPlan, OperationKind, PlanRiskLevel,
    PlannedOperation,
};
pub use request::{
    Constraints, HistoryEntry, HistoryOutcome, ImprovementRequest, RecursionCause,
    RejectionReason, RequestFingerprint, RiskAssessment, RiskFactor, Scope, ValidationOutcome,
};
pub use sandbox::{FileChange, SandboxResult, SandboxStage};
pub use transaction::{
    Operation, OperationRequest, OperationType, RollbackFailure, RollbackOptions, RollbackReport,
    Transaction, TransactionMeta, TransactionStatus,
};
