//! Transactions over the real working tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a transaction. Transitions are one-way out of `Active`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    #[default]
    Active,
    Committed,
    RolledBack,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Active => "active",
            TransactionStatus::Committed => "committed",
            TransactionStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of file-level mutation recorded in a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// A new file; undone by removing it
    Create,
    /// An overwrite; undone from the captured backup
    Update,
    /// A removal; undone from the captured backup
    Delete,
    /// A dependency manifest rewrite; undone from the stored pre-image text
    ManifestUpdate,
}

impl OperationType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "create" => Some(OperationType::Create),
            "update" => Some(OperationType::Update),
            "delete" => Some(OperationType::Delete),
            "manifest_update" => Some(OperationType::ManifestUpdate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::ManifestUpdate => "manifest_update",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Caller-supplied context for a new transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMeta {
    #[serde(default)]
    pub description: String,

    /// Improvement request text that led to this transaction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,

    /// Full backup taken before the transaction started, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
}

/// An operation to record, before it has an id or a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    #[serde(rename = "type")]
    pub op_type: OperationType,

    /// Path relative to the working tree
    pub path: String,

    /// Logical target (component or module name); defaults to the path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Content to write for create/update/manifest_update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
}

impl OperationRequest {
    pub fn new(op_type: OperationType, path: impl Into<String>) -> Self {
        Self {
            op_type,
            path: path.into(),
            target: None,
            new_content: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.new_content = Some(content.into());
        self
    }
}

/// A recorded operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,

    #[serde(rename = "type")]
    pub op_type: OperationType,

    pub target: String,

    pub path: String,

    /// File name of the pre-image under the transaction's backup directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_ref: Option<String>,

    /// sha256 of the pre-image, checked when the backup is taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_checksum: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,

    pub recorded_at: DateTime<Utc>,
}

/// Options for `rollback_transaction`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOptions {
    /// Keep undoing remaining operations after one fails
    #[serde(default)]
    pub continue_on_error: bool,
}

/// One operation that could not be undone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackFailure {
    pub operation_id: String,
    pub path: String,
    pub error: String,
}

/// Outcome of a rollback attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Operation ids undone, in the order they were undone
    pub successful: Vec<String>,
    pub failed: Vec<RollbackFailure>,
    /// Whether every operation was visited
    pub completed: bool,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.completed && self.failed.is_empty()
    }
}

/// A transaction and its operation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,

    pub status: TransactionStatus,

    #[serde(default)]
    pub meta: TransactionMeta,

    pub start_time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Operations in apply order
    #[serde(default)]
    pub operations: Vec<Operation>,

    /// Report of the most recent rollback attempt that did not finish cleanly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rollback: Option<RollbackReport>,
}

impl Transaction {
    pub fn new(id: String, meta: TransactionMeta) -> Self {
        Self {
            id,
            status: TransactionStatus::Active,
            meta,
            start_time: Utc::now(),
            end_time: None,
            operations: Vec::new(),
            last_rollback: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TransactionStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_type_parse() {
        assert_eq!(
            OperationType::parse("manifest-update"),
            Some(OperationType::ManifestUpdate)
        );
        assert_eq!(OperationType::parse("CREATE"), Some(OperationType::Create));
        assert_eq!(OperationType::parse("rename"), None);
    }

    #[test]
    fn test_operation_serializes_type_field() {
        let op = Operation {
            id: "op-0123456789ab".to_string(),
            op_type: OperationType::ManifestUpdate,
            target: "package.json".to_string(),
            path: "package.json".to_string(),
            backup_ref: None,
            backup_checksum: None,
            old_content: Some("{}".to_string()),
            new_content: None,
            recorded_at: Utc::now(),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "manifest_update");
        assert!(json.get("backup_ref").is_none());
    }

    #[test]
    fn test_new_transaction_is_active() {
        let tx = Transaction::new("tx-0123456789ab".to_string(), TransactionMeta::default());
        assert!(tx.is_active());
        assert!(tx.operations.is_empty());
        assert!(tx.end_time.is_none());
    }
}
