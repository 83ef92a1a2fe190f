//! Sandbox run results.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stages of a sandbox run, in order. Every run ends with cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStage {
    #[default]
    Created,
    Populated,
    ModificationsApplied,
    Validated,
    TestsRun,
    BreakingChangeChecked,
    PerformanceMeasured,
    Cleaned,
}

impl SandboxStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStage::Created => "created",
            SandboxStage::Populated => "populated",
            SandboxStage::ModificationsApplied => "modifications_applied",
            SandboxStage::Validated => "validated",
            SandboxStage::TestsRun => "tests_run",
            SandboxStage::BreakingChangeChecked => "breaking_change_checked",
            SandboxStage::PerformanceMeasured => "performance_measured",
            SandboxStage::Cleaned => "cleaned",
        }
    }
}

impl fmt::Display for SandboxStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A file's content before and after the plan ran in the sandbox.
///
/// `None` means the file did not exist on that side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

impl FileChange {
    pub fn is_noop(&self) -> bool {
        self.before == self.after
    }
}

/// Structured result of `test_improvements`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxResult {
    pub success: bool,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub no_breaking_changes: bool,
    /// Signed percentage such as `+3.2%`, or `N/A`
    pub performance_impact: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Furthest stage reached; `Cleaned` once the sandbox directory is gone
    pub stage: SandboxStage,
    /// `file: name` for each export that disappeared
    pub breaking_changes: Vec<String>,
    /// Post-images of every file the plan touched
    pub changes: Vec<FileChange>,
}

impl SandboxResult {
    pub fn new() -> Self {
        Self {
            no_breaking_changes: true,
            performance_impact: "N/A".to_string(),
            ..Default::default()
        }
    }

    /// Whether the sandbox directory was removed.
    pub fn cleaned(&self) -> bool {
        self.stage == SandboxStage::Cleaned
    }
}
