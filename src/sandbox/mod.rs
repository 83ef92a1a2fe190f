//! Sandbox Tester.
//!
//! Proves a [`ModificationPlan`] against a disposable copy of the tree before
//! anything real is touched. A run walks the stages of [`SandboxStage`] in
//! order and stops at the first fatal one; whatever happens, the sandbox
//! directory is removed and the caller gets a [`SandboxResult`], never an
//! error.

pub mod apply;
pub mod checks;
pub mod exports;
pub mod reporters;
pub mod workspace;

use crate::models::{FileChange, ModificationPlan, SandboxResult, SandboxStage};
use crate::process::{CancelToken, ProcessStatus, command_from_argv, run_bounded};
use crate::storage::{DEFAULT_EXCLUDES, normalize_rel_path};
use apply::{ApplyOutcome, apply_operation};
use checks::{builtin_syntax_check, external_syntax_check, unresolved_imports};
use exports::{ExportScanner, RegexExportScanner, removed_exports};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use workspace::Workspace;

/// npm's placeholder `test` script.
const NPM_PLACEHOLDER: &str = "no test specified";

/// A test command run inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestSuite {
    pub name: String,
    pub command: Vec<String>,
    /// A missing required suite fails the run; a missing optional one warns
    pub required: bool,
}

impl TestSuite {
    pub fn new(name: impl Into<String>, command: Vec<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            command,
            required,
        }
    }
}

/// Sandbox settings, usually built by `ResolvedConfig::sandbox_config`.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub excludes: Vec<String>,
    /// Deadline for each suite, syntax check and benchmark
    pub timeout: Duration,
    pub install_timeout: Duration,
    /// Suites to run; empty means detect from the tree
    pub suites: Vec<TestSuite>,
    pub bench: Option<Vec<String>>,
    /// External checker argv, with `{file}` substituted per file
    pub syntax_check: Option<Vec<String>>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            excludes: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            timeout: Duration::from_secs(300),
            install_timeout: Duration::from_secs(600),
            suites: Vec::new(),
            bench: None,
            syntax_check: None,
        }
    }
}

/// Tree the sandbox is populated from.
#[derive(Debug, Clone)]
pub enum SandboxSource {
    /// The live working tree
    WorkingTree(PathBuf),
    /// A backup already extracted to `root`
    Snapshot { backup_id: String, root: PathBuf },
}

impl SandboxSource {
    pub fn root(&self) -> &Path {
        match self {
            SandboxSource::WorkingTree(root) => root,
            SandboxSource::Snapshot { root, .. } => root,
        }
    }

    fn describe(&self) -> String {
        match self {
            SandboxSource::WorkingTree(root) => root.display().to_string(),
            SandboxSource::Snapshot { backup_id, .. } => format!("backup {}", backup_id),
        }
    }
}

pub struct SandboxTester {
    config: SandboxConfig,
    cancel: CancelToken,
    scanner: Box<dyn ExportScanner>,
}

impl SandboxTester {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            cancel: CancelToken::new(),
            scanner: Box::new(RegexExportScanner),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Swap the breaking-change heuristic.
    pub fn with_scanner(mut self, scanner: Box<dyn ExportScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `plan` in a fresh sandbox populated from `source`.
    pub fn test_improvements(
        &self,
        plan: &ModificationPlan,
        source: &SandboxSource,
    ) -> SandboxResult {
        let mut result = SandboxResult::new();
        let mut reached = result.stage;
        info!(
            source = %source.describe(),
            operations = plan.operation_count(),
            "sandbox run starting"
        );

        match Workspace::populate(source.root(), &self.config.excludes) {
            Ok(workspace) => {
                advance(&mut result, SandboxStage::Populated);
                self.run_stages(plan, &workspace, &mut result);
                reached = result.stage;
                match workspace.close() {
                    Ok(()) => advance(&mut result, SandboxStage::Cleaned),
                    Err(e) => result
                        .warnings
                        .push(format!("Sandbox cleanup failed: {}", e)),
                }
            }
            Err(e) => {
                // nothing was left on disk
                result.errors.push(format!("Sandbox creation failed: {}", e));
                advance(&mut result, SandboxStage::Cleaned);
            }
        }

        result.success = result.errors.is_empty()
            && result.tests_failed == 0
            && result.no_breaking_changes;
        info!(
            stage = %result.stage,
            reached = %reached,
            success = result.success,
            errors = result.errors.len(),
            "sandbox run finished"
        );
        result
    }

    fn run_stages(
        &self,
        plan: &ModificationPlan,
        workspace: &Workspace,
        result: &mut SandboxResult,
    ) {
        let root = workspace.root();

        match workspace.install_dependencies(self.config.install_timeout, &self.cancel) {
            Ok(None) => {}
            Ok(Some((manifest, output))) => match output.status {
                ProcessStatus::Exited(Some(0)) => {}
                ProcessStatus::NotFound => result.warnings.push(format!(
                    "Dependencies for {} not installed: installer not found",
                    manifest
                )),
                _ => {
                    result.errors.push(format!(
                        "Dependency install for {} failed: {}",
                        manifest,
                        output.describe("installer")
                    ));
                    return;
                }
            },
            Err(e) => {
                result.errors.push(format!("Dependency install failed: {}", e));
                return;
            }
        }

        let bench = self.bench_command(root);
        let baseline = bench
            .as_ref()
            .and_then(|argv| self.run_benchmark(argv, root, &mut result.warnings));

        let mut pre_images: BTreeMap<String, Option<String>> = BTreeMap::new();
        for file in plan.affected_files() {
            let rel = match normalize_rel_path(&file) {
                Ok(rel) => rel,
                Err(e) => {
                    result.errors.push(e.to_string());
                    return;
                }
            };
            match read_optional(&workspace.path_of(&rel)) {
                Ok(content) => {
                    pre_images.insert(file, content);
                }
                Err(e) => {
                    result.errors.push(format!("Cannot read {}: {}", file, e));
                    return;
                }
            }
        }

        for op in plan.operations() {
            if self.cancel.is_cancelled() {
                result.errors.push("Sandbox run cancelled".to_string());
                return;
            }
            match apply_operation(root, op) {
                Ok(ApplyOutcome::Applied) => {
                    debug!(file = %op.file, kind = op.kind.label(), "operation applied in sandbox");
                }
                Ok(ApplyOutcome::Skipped(reason)) => {
                    warn!(file = %op.file, kind = op.kind.label(), %reason, "operation skipped");
                    result.warnings.push(reason);
                }
                Err(e) => {
                    result.errors.push(format!(
                        "Failed to apply {} to {}: {}",
                        op.kind.label(),
                        op.file,
                        e
                    ));
                    return;
                }
            }
        }
        advance(result, SandboxStage::ModificationsApplied);

        for (path, before) in pre_images {
            let after = normalize_rel_path(&path)
                .ok()
                .and_then(|rel| read_optional(&workspace.path_of(&rel)).ok().flatten());
            let change = FileChange {
                path,
                before,
                after,
            };
            if !change.is_noop() {
                result.changes.push(change);
            }
        }

        self.validate_changes(workspace, result);
        if !result.errors.is_empty() {
            return;
        }
        advance(result, SandboxStage::Validated);

        let suites = if self.config.suites.is_empty() {
            detect_suites(root)
        } else {
            self.config.suites.clone()
        };
        if suites.is_empty() {
            result
                .warnings
                .push("No test suites found; tests skipped".to_string());
        }
        for suite in &suites {
            self.run_suite(suite, root, result);
        }
        advance(result, SandboxStage::TestsRun);

        for change in &result.changes {
            if let Some(before) = &change.before {
                let removed =
                    removed_exports(self.scanner.as_ref(), &change.path, before, change.after.as_deref());
                result.breaking_changes.extend(removed);
            }
        }
        result.no_breaking_changes = result.breaking_changes.is_empty();
        if !result.no_breaking_changes {
            warn!(removed = ?result.breaking_changes, "exports removed");
        }
        advance(result, SandboxStage::BreakingChangeChecked);

        if let (Some(argv), Some(before)) = (bench.as_ref(), baseline) {
            if let Some(after) = self.run_benchmark(argv, root, &mut result.warnings) {
                result.performance_impact = performance_delta(before, after);
            }
        }
        advance(result, SandboxStage::PerformanceMeasured);
    }

    /// Syntax and import checks on every post-image. Failures go to `errors`.
    fn validate_changes(&self, workspace: &Workspace, result: &mut SandboxResult) {
        let mut errors = Vec::new();
        for change in &result.changes {
            let Some(after) = &change.after else { continue };
            let Ok(rel) = normalize_rel_path(&change.path) else { continue };

            let external = self.config.syntax_check.as_ref().and_then(|template| {
                external_syntax_check(
                    template,
                    &workspace.path_of(&rel),
                    workspace.root(),
                    self.config.timeout,
                    &self.cancel,
                )
            });
            let syntax = external.unwrap_or_else(|| builtin_syntax_check(&change.path, after));
            if let Err(e) = syntax {
                errors.push(format!("Syntax error in {}: {}", change.path, e));
                continue;
            }

            for missing in unresolved_imports(workspace.root(), &change.path, after) {
                errors.push(format!("Unresolved import in {}: {}", change.path, missing));
            }
        }
        result.errors.extend(errors);
    }

    fn run_suite(&self, suite: &TestSuite, root: &Path, result: &mut SandboxResult) {
        let missing = |result: &mut SandboxResult, why: String| {
            if suite.required {
                result.errors.push(format!("Required test suite '{}' {}", suite.name, why));
            } else {
                result.warnings.push(format!("Optional test suite '{}' {}", suite.name, why));
            }
        };

        if let Some(script) = missing_npm_script(root, &suite.command) {
            missing(result, format!("has no npm script '{}'", script));
            return;
        }

        let mut cmd = match command_from_argv(&suite.command) {
            Ok(cmd) => cmd,
            Err(e) => {
                result.errors.push(format!("Test suite '{}': {}", suite.name, e));
                return;
            }
        };
        cmd.current_dir(root).env("CI", "true");

        let label = format!("test suite '{}'", suite.name);
        let output = match run_bounded(&label, cmd, self.config.timeout, &self.cancel) {
            Ok(output) => output,
            Err(e) => {
                result.errors.push(format!("{}: {}", label, e));
                return;
            }
        };

        match output.status {
            ProcessStatus::NotFound => missing(result, "command not found".to_string()),
            ProcessStatus::TimedOut | ProcessStatus::Cancelled => {
                result.errors.push(output.describe(&label));
            }
            ProcessStatus::Exited(_) => {
                let combined = output.combined();
                let mut counts = match reporters::parse(&combined) {
                    Some((reporter, counts)) => {
                        debug!(suite = %suite.name, ?reporter, ?counts, "parsed test output");
                        counts
                    }
                    None => {
                        debug!(suite = %suite.name, "unrecognised test output");
                        reporters::TestCounts::default()
                    }
                };
                if !output.success() && counts.failed == 0 {
                    counts.failed = 1;
                    result.errors.push(output.describe(&label));
                }
                info!(
                    suite = %suite.name,
                    passed = counts.passed,
                    failed = counts.failed,
                    elapsed_ms = output.elapsed.as_millis() as u64,
                    "test suite finished"
                );
                result.tests_passed += counts.passed;
                result.tests_failed += counts.failed;
            }
        }
    }

    fn bench_command(&self, root: &Path) -> Option<Vec<String>> {
        if let Some(argv) = &self.config.bench {
            return Some(argv.clone());
        }
        npm_scripts(root)
            .filter(|scripts| scripts.contains_key("bench"))
            .map(|_| vec!["npm".to_string(), "run".to_string(), "bench".to_string()])
    }

    /// Elapsed time of one benchmark run, or `None` with a warning.
    fn run_benchmark(
        &self,
        argv: &[String],
        root: &Path,
        warnings: &mut Vec<String>,
    ) -> Option<Duration> {
        let mut cmd = command_from_argv(argv).ok()?;
        cmd.current_dir(root);
        match run_bounded("benchmark", cmd, self.config.timeout, &self.cancel) {
            Ok(output) if output.success() => Some(output.elapsed),
            Ok(output) => {
                warnings.push(format!("Benchmark unavailable: {}", output.describe("benchmark")));
                None
            }
            Err(e) => {
                warnings.push(format!("Benchmark unavailable: {}", e));
                None
            }
        }
    }
}

fn advance(result: &mut SandboxResult, stage: SandboxStage) {
    result.stage = stage;
    info!(stage = %stage, "sandbox stage reached");
}

fn read_optional(path: &Path) -> std::io::Result<Option<String>> {
    if path.is_file() {
        fs::read_to_string(path).map(Some)
    } else {
        Ok(None)
    }
}

/// Signed change in elapsed time; positive means the modified tree is slower.
pub fn performance_delta(before: Duration, after: Duration) -> String {
    let base = before.as_secs_f64();
    if base <= 0.0 {
        return "N/A".to_string();
    }
    let pct = (after.as_secs_f64() - base) / base * 100.0;
    format!("{:+.1}%", pct)
}

fn npm_scripts(root: &Path) -> Option<BTreeMap<String, String>> {
    let content = fs::read_to_string(root.join("package.json")).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&content).ok()?;
    let scripts = manifest.get("scripts")?.as_object()?;
    Some(
        scripts
            .iter()
            .filter_map(|(name, body)| Some((name.clone(), body.as_str()?.to_string())))
            .collect(),
    )
}

fn is_real_script(scripts: &BTreeMap<String, String>, name: &str) -> bool {
    scripts
        .get(name)
        .is_some_and(|body| !body.contains(NPM_PLACEHOLDER))
}

/// The npm script an `npm test` / `npm run x` command needs, if it is missing.
pub fn missing_npm_script(root: &Path, command: &[String]) -> Option<String> {
    if command.first().map(String::as_str) != Some("npm") {
        return None;
    }
    let script = match command.get(1).map(String::as_str) {
        Some("test" | "t") => "test",
        Some("run" | "run-script") => command.get(2)?.as_str(),
        _ => return None,
    };
    let scripts = npm_scripts(root).unwrap_or_default();
    (!is_real_script(&scripts, script)).then(|| script.to_string())
}

/// Suites implied by the tree when none are configured.
pub fn detect_suites(root: &Path) -> Vec<TestSuite> {
    let argv = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    if let Some(scripts) = npm_scripts(root) {
        let mut suites = Vec::new();
        if is_real_script(&scripts, "test") {
            suites.push(TestSuite::new("unit", argv(&["npm", "test"]), true));
        }
        if is_real_script(&scripts, "test:integration") {
            suites.push(TestSuite::new(
                "integration",
                argv(&["npm", "run", "test:integration"]),
                false,
            ));
        }
        return suites;
    }
    if root.join("Cargo.toml").is_file() {
        return vec![TestSuite::new("unit", argv(&["cargo", "test"]), true)];
    }
    Vec::new()
}
