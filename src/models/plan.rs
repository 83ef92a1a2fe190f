//! Modification plans.
//!
//! A plan is produced by an external planner and consumed read-only by the
//! sandbox and the pipeline. Operation kinds form a closed set: anything the
//! deserializer does not recognise becomes [`OperationKind::Unsupported`] and
//! is skipped with a warning instead of failing the plan.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Planner's estimate of how far a plan reaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    #[default]
    Low,
    Medium,
    High,
}

/// Planner's own risk label for a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanRiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl PlanRiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanRiskLevel::Low => "low",
            PlanRiskLevel::Medium => "medium",
            PlanRiskLevel::High => "high",
            PlanRiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for PlanRiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where an [`OperationKind::Insert`] places its text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertPosition {
    Start,
    #[default]
    End,
    BeforeAnchor,
    AfterAnchor,
}

fn default_attempts() -> u32 {
    3
}

/// What a planned operation does to its file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationKind {
    /// Create a new file with the given content
    CreateFile { content: String },
    /// Remove the file
    DeleteFile,
    /// Replace literal text
    Replace {
        find: String,
        replace: String,
        #[serde(default)]
        all: bool,
    },
    /// Insert text at the start, end, or around an anchor
    Insert {
        text: String,
        #[serde(default)]
        anchor: Option<String>,
        #[serde(default)]
        position: InsertPosition,
    },
    /// Wrap a function body in error handling
    WrapErrorHandling { function: String },
    /// Wrap a function body in a bounded retry loop
    AddRetry {
        function: String,
        #[serde(default = "default_attempts")]
        attempts: u32,
    },
    /// Rewrite error constructors to carry file/line context
    EnrichErrorMessages,
    /// Any operation type this build does not know how to apply
    #[serde(other)]
    Unsupported,
}

impl OperationKind {
    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::CreateFile { .. } => "create_file",
            OperationKind::DeleteFile => "delete_file",
            OperationKind::Replace { .. } => "replace",
            OperationKind::Insert { .. } => "insert",
            OperationKind::WrapErrorHandling { .. } => "wrap_error_handling",
            OperationKind::AddRetry { .. } => "add_retry",
            OperationKind::EnrichErrorMessages => "enrich_error_messages",
            OperationKind::Unsupported => "unsupported",
        }
    }
}

/// Words in an operation description that mark it as touching a public interface.
const INTERFACE_MARKERS: &[&str] = &["api", "interface", "signature", "export", "public"];

/// A single file-level step of a modification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedOperation {
    /// File path relative to the working tree
    pub file: String,

    #[serde(default)]
    pub description: String,

    #[serde(flatten)]
    pub kind: OperationKind,
}

impl PlannedOperation {
    pub fn new(file: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            file: file.into(),
            description: String::new(),
            kind,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Whether this operation changes a public API surface.
    ///
    /// Deleting a file always counts; otherwise the description is checked
    /// for interface vocabulary.
    pub fn is_interface_change(&self) -> bool {
        if matches!(self.kind, OperationKind::DeleteFile) {
            return true;
        }
        let lower = self.description.to_lowercase();
        lower
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| INTERFACE_MARKERS.contains(&word))
    }
}

/// A group of operations serving one purpose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    #[serde(default)]
    pub description: String,

    /// Files the planner says this modification touches
    #[serde(default)]
    pub files: Vec<String>,

    pub operations: Vec<PlannedOperation>,

    /// Tests covering this modification
    #[serde(default)]
    pub tests: Vec<String>,
}

/// Ordered list of modifications produced by a planner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationPlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub description: String,

    pub modifications: Vec<Modification>,

    #[serde(default)]
    pub estimated_impact: Impact,

    #[serde(default)]
    pub risk_level: PlanRiskLevel,
}

impl ModificationPlan {
    /// Every file named by the plan, deduplicated in first-seen order.
    pub fn affected_files(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for modification in &self.modifications {
            let named = modification.files.iter();
            let operated = modification.operations.iter().map(|op| &op.file);
            for file in named.chain(operated) {
                let file = file.trim().trim_start_matches("./").to_string();
                if !file.is_empty() && !seen.contains(&file) {
                    seen.push(file);
                }
            }
        }
        seen
    }

    /// All operations in apply order.
    pub fn operations(&self) -> impl Iterator<Item = &PlannedOperation> {
        self.modifications.iter().flat_map(|m| m.operations.iter())
    }

    pub fn operation_count(&self) -> usize {
        self.operations().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_deserializes_operation_kinds() {
        let json = r#"{
            "modifications": [{
                "description": "Harden loader",
                "files": ["src/loader.js"],
                "operations": [
                    {"type": "wrap_error_handling", "file": "src/loader.js", "function": "load"},
                    {"type": "add_retry", "file": "src/loader.js", "function": "fetch"},
                    {"type": "replace", "file": "README.md", "find": "a", "replace": "b"}
                ]
            }]
        }"#;
        let plan: ModificationPlan = serde_json::from_str(json).unwrap();
        let ops: Vec<_> = plan.operations().collect();
        assert_eq!(ops.len(), 3);
        assert_eq!(
            ops[0].kind,
            OperationKind::WrapErrorHandling {
                function: "load".to_string()
            }
        );
        assert_eq!(
            ops[1].kind,
            OperationKind::AddRetry {
                function: "fetch".to_string(),
                attempts: 3
            }
        );
    }

    #[test]
    fn test_unknown_operation_type_is_unsupported() {
        let json = r#"{"type": "rewrite_with_ai", "file": "a.js", "description": "magic"}"#;
        let op: PlannedOperation = serde_json::from_str(json).unwrap();
        assert_eq!(op.kind, OperationKind::Unsupported);
        assert_eq!(op.description, "magic");
    }

    #[test]
    fn test_affected_files_deduplicated() {
        let plan = ModificationPlan {
            modifications: vec![Modification {
                description: String::new(),
                files: vec!["./a.js".to_string(), "b.js".to_string()],
                operations: vec![
                    PlannedOperation::new("a.js", OperationKind::EnrichErrorMessages),
                    PlannedOperation::new("c.js", OperationKind::DeleteFile),
                ],
                tests: vec![],
            }],
            ..Default::default()
        };
        assert_eq!(plan.affected_files(), vec!["a.js", "b.js", "c.js"]);
    }

    #[test]
    fn test_interface_change_classification() {
        let op = PlannedOperation::new(
            "api.js",
            OperationKind::Replace {
                find: "a".into(),
                replace: "b".into(),
                all: false,
            },
        )
        .with_description("Change the public signature of connect");
        assert!(op.is_interface_change());

        let op = PlannedOperation::new("x.js", OperationKind::EnrichErrorMessages)
            .with_description("Add file context to errors");
        assert!(!op.is_interface_change());

        assert!(PlannedOperation::new("x.js", OperationKind::DeleteFile).is_interface_change());
    }
}
