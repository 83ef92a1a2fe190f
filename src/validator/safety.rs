//! Safety review of an already-built modification plan.

use crate::models::{Constraints, ModificationPlan, PlanRiskLevel};
use crate::storage::{normalize_rel_path, rel_to_string};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// External view of which components depend on a target.
pub trait DependencyGraph {
    /// Names of everything that depends on `target`.
    fn dependents(&self, target: &str) -> Vec<String>;
}

/// A graph with no edges.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDependencies;

impl DependencyGraph for NoDependencies {
    fn dependents(&self, _target: &str) -> Vec<String> {
        Vec::new()
    }
}

/// A graph loaded from a JSON object mapping a target to its dependents.
///
/// ```json
/// { "src/auth.js": ["src/login.js", "src/session.js"] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticDependencyGraph {
    edges: BTreeMap<String, Vec<String>>,
}

impl StaticDependencyGraph {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            Error::InvalidInput(format!("dependency graph {}: {}", path.display(), e))
        })
    }

    pub fn insert(&mut self, target: impl Into<String>, dependents: Vec<String>) {
        self.edges.insert(target.into(), dependents);
    }
}

impl DependencyGraph for StaticDependencyGraph {
    fn dependents(&self, target: &str) -> Vec<String> {
        self.edges.get(target).cloned().unwrap_or_default()
    }
}

/// One finding of the safety review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyRisk {
    pub severity: PlanRiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub message: String,
}

/// Result of `validate_safety`. `mitigations[i]` answers `risks[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyReport {
    pub safe: bool,
    pub risk_level: PlanRiskLevel,
    pub risks: Vec<SafetyRisk>,
    pub mitigations: Vec<String>,
    pub interface_preserved: bool,
    pub breaking_changes: Vec<String>,
}

impl SafetyReport {
    fn new() -> Self {
        Self {
            safe: true,
            risk_level: PlanRiskLevel::Low,
            risks: Vec::new(),
            mitigations: Vec::new(),
            interface_preserved: true,
            breaking_changes: Vec::new(),
        }
    }

    fn flag(
        &mut self,
        severity: PlanRiskLevel,
        file: Option<&str>,
        message: String,
        mitigation: String,
    ) {
        self.risks.push(SafetyRisk {
            severity,
            file: file.map(String::from),
            message,
        });
        self.mitigations.push(mitigation);
        self.finish();
    }

    fn finish(&mut self) {
        self.risk_level = self
            .risks
            .iter()
            .map(|r| r.severity)
            .max()
            .unwrap_or(PlanRiskLevel::Low);
        self.safe = !self
            .risks
            .iter()
            .any(|r| r.severity == PlanRiskLevel::Critical)
            && self.breaking_changes.is_empty();
    }

    pub fn has_critical(&self) -> bool {
        self.risk_level == PlanRiskLevel::Critical
    }
}

fn is_protected(path: &str, protected: &[String]) -> bool {
    protected.iter().any(|p| {
        let p = p.trim_matches('/');
        !p.is_empty() && (path == p || path.starts_with(&format!("{}/", p)))
    })
}

/// Review a plan against the protected list, test coverage, interface
/// changes, and the dependency graph.
pub fn validate_safety(
    plan: &ModificationPlan,
    protected: &[String],
    graph: &dyn DependencyGraph,
) -> SafetyReport {
    let mut report = SafetyReport::new();

    for modification in &plan.modifications {
        for op in &modification.operations {
            let path = match normalize_rel_path(&op.file) {
                Ok(rel) => rel_to_string(&rel),
                Err(e) => {
                    report.flag(
                        PlanRiskLevel::Critical,
                        Some(&op.file),
                        e.to_string(),
                        "Use a path relative to the working tree".to_string(),
                    );
                    continue;
                }
            };

            if is_protected(&path, protected) {
                report.flag(
                    PlanRiskLevel::Critical,
                    Some(&path),
                    format!("Operation touches protected file {}", path),
                    format!("Remove {} from the plan", path),
                );
            }

            if op.is_interface_change() {
                let what = if op.description.is_empty() {
                    op.kind.label().to_string()
                } else {
                    op.description.clone()
                };
                report.breaking_changes.push(format!("{}: {}", path, what));
                report.interface_preserved = false;
                report.flag(
                    PlanRiskLevel::High,
                    Some(&path),
                    format!("Interface change in {}", path),
                    format!("Keep the existing interface of {} and add the new one alongside it", path),
                );
            }
        }

        if modification.tests.is_empty() {
            let name = if modification.description.is_empty() {
                "modification".to_string()
            } else {
                format!("'{}'", modification.description)
            };
            report.flag(
                PlanRiskLevel::Medium,
                None,
                format!("{} has no associated tests", name),
                format!("Add tests covering {}", name),
            );
        }
    }

    for file in plan.affected_files() {
        let dependents = graph.dependents(&file);
        if !dependents.is_empty() {
            report.flag(
                PlanRiskLevel::Medium,
                Some(&file),
                format!("{} has {} dependent(s): {}", file, dependents.len(), dependents.join(", ")),
                format!("Run the tests of {} after applying", dependents.join(", ")),
            );
        }
    }

    report.finish();
    debug!(
        safe = report.safe,
        risk_level = %report.risk_level,
        risks = report.risks.len(),
        "safety review complete"
    );
    report
}

/// Hold a plan to the caller's request constraints.
pub fn check_plan_constraints(
    report: &mut SafetyReport,
    plan: &ModificationPlan,
    constraints: &Constraints,
) {
    if let Some(max_files) = constraints.max_files {
        let touched = plan.affected_files().len();
        if touched > max_files {
            report.flag(
                PlanRiskLevel::Critical,
                None,
                format!("Plan touches {} files, constraint allows {}", touched, max_files),
                "Split the plan into smaller plans".to_string(),
            );
        }
    }

    if constraints.require_tests == Some(true) {
        for modification in plan.modifications.iter().filter(|m| m.tests.is_empty()) {
            report.flag(
                PlanRiskLevel::Critical,
                None,
                format!(
                    "Tests are required but '{}' has none",
                    modification.description
                ),
                "Attach tests to every modification".to_string(),
            );
        }
    }
}
