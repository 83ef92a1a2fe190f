//! Precedence resolution for configuration.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. CLI flags (passed at runtime)
//! 2. Environment (`BH_DATA_DIR`)
//! 3. Project config (`<repo>/bulkhead.kdl`)
//! 4. System config (`~/.config/bulkhead/config.kdl`, or `$BH_CONFIG_DIR/config.kdl`)
//! 5. Built-in defaults
//!
//! Every resolved value carries the [`ValueSource`] it came from so that
//! `bh config show` can explain itself.

use crate::config::schema::{BulkheadConfig, SandboxSection, SuiteSpec, ValidatorSection};
use crate::sandbox::{SandboxConfig, TestSuite};
use crate::storage::{DEFAULT_EXCLUDES, DataDir, rel_to_string};
use crate::validator::ValidatorConfig;
use crate::{Error, Result};
use kdl::KdlDocument;
use serde_json::{Value, json};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "BH_DATA_DIR";

/// Environment variable overriding the system config directory.
pub const CONFIG_DIR_ENV: &str = "BH_CONFIG_DIR";

/// Name of the per-repository config file.
pub const PROJECT_CONFIG_FILE: &str = "bulkhead.kdl";

/// Tracks where a resolved value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    /// Value from CLI flag
    CliFlag,
    /// Value from environment variable
    EnvVar(String),
    /// Value from the repository's bulkhead.kdl
    Project,
    /// Value from the user's config.kdl
    System,
    /// Built-in default value
    Default,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::CliFlag => write!(f, "cli"),
            ValueSource::EnvVar(name) => write!(f, "env:{}", name),
            ValueSource::Project => write!(f, "project"),
            ValueSource::System => write!(f, "system"),
            ValueSource::Default => write!(f, "default"),
        }
    }
}

/// A resolved value with its source.
#[derive(Debug, Clone)]
pub struct Resolved<T> {
    pub value: T,
    pub source: ValueSource,
}

impl<T> Resolved<T> {
    pub fn new(value: T, source: ValueSource) -> Self {
        Self { value, source }
    }
}

/// Pick the first layer that sets a value, else the default.
fn layered<T: Clone>(project: Option<&T>, system: Option<&T>, default: T) -> Resolved<T> {
    if let Some(v) = project {
        Resolved::new(v.clone(), ValueSource::Project)
    } else if let Some(v) = system {
        Resolved::new(v.clone(), ValueSource::System)
    } else {
        Resolved::new(default, ValueSource::Default)
    }
}

fn layered_opt<T: Clone>(project: Option<&T>, system: Option<&T>) -> Option<Resolved<T>> {
    project
        .map(|v| Resolved::new(v.clone(), ValueSource::Project))
        .or_else(|| system.map(|v| Resolved::new(v.clone(), ValueSource::System)))
}

/// CLI overrides for configuration resolution.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub data_dir: Option<PathBuf>,
}

impl ConfigOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }
}

/// Fully resolved configuration with source tracking.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub repo: PathBuf,
    pub data_dir: Resolved<PathBuf>,
    pub max_depth: Resolved<usize>,
    pub similarity_threshold: Resolved<f64>,
    pub recency_window_hours: Resolved<u64>,
    pub history_limit: Resolved<usize>,
    pub risk_threshold: Resolved<u32>,
    pub max_files: Resolved<usize>,
    pub protected: Resolved<Vec<String>>,
    /// Extra excludes on top of the built-in list
    pub excludes: Resolved<Vec<String>>,
    pub timeout_secs: Resolved<u64>,
    pub install_timeout_secs: Resolved<u64>,
    pub unit: Option<Resolved<SuiteSpec>>,
    pub integration: Option<Resolved<SuiteSpec>>,
    pub bench: Option<Resolved<Vec<String>>>,
    pub syntax_check: Option<Resolved<Vec<String>>>,
    pub backup_retention: Resolved<usize>,
    pub transaction_retention_days: Resolved<u32>,
    pub action_log_enabled: Resolved<bool>,
}

impl ResolvedConfig {
    pub fn data(&self) -> DataDir {
        DataDir::at(&self.data_dir.value)
    }

    /// Built-in excludes, configured excludes, and the data dir when it lives
    /// inside the repository.
    pub fn all_excludes(&self) -> Vec<String> {
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        for extra in &self.excludes.value {
            if !excludes.contains(extra) {
                excludes.push(extra.clone());
            }
        }
        if let Ok(inside) = self.data_dir.value.strip_prefix(&self.repo) {
            let inside = rel_to_string(inside);
            if !inside.is_empty() && !excludes.contains(&inside) {
                excludes.push(inside);
            }
        }
        excludes
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            max_depth: self.max_depth.value,
            similarity_threshold: self.similarity_threshold.value,
            recency_window_hours: self.recency_window_hours.value,
            history_limit: self.history_limit.value,
            risk_threshold: self.risk_threshold.value,
            max_files: self.max_files.value,
            protected: self.protected.value.clone(),
        }
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        let mut suites = Vec::new();
        if let Some(ref unit) = self.unit {
            suites.push(TestSuite::new("unit", unit.value.command.clone(), unit.value.required));
        }
        if let Some(ref integration) = self.integration {
            suites.push(TestSuite::new(
                "integration",
                integration.value.command.clone(),
                integration.value.required,
            ));
        }
        SandboxConfig {
            excludes: self.all_excludes(),
            timeout: Duration::from_secs(self.timeout_secs.value),
            install_timeout: Duration::from_secs(self.install_timeout_secs.value),
            suites,
            bench: self.bench.as_ref().map(|r| r.value.clone()),
            syntax_check: self.syntax_check.as_ref().map(|r| r.value.clone()),
        }
    }

    /// Effective settings as a config layer, for `bh config init`.
    ///
    /// The data dir is left out since it is usually machine specific.
    pub fn to_layer(&self) -> BulkheadConfig {
        let suite = |r: &Option<Resolved<SuiteSpec>>| r.as_ref().map(|r| r.value.clone());
        BulkheadConfig {
            data_dir: None,
            validator: ValidatorSection {
                max_depth: Some(self.max_depth.value),
                similarity_threshold: Some(self.similarity_threshold.value),
                recency_window_hours: Some(self.recency_window_hours.value),
                history_limit: Some(self.history_limit.value),
                risk_threshold: Some(self.risk_threshold.value),
                max_files: Some(self.max_files.value),
            },
            protected: Some(self.protected.value.clone()),
            sandbox: SandboxSection {
                exclude: Some(self.excludes.value.clone()).filter(|e| !e.is_empty()),
                timeout_secs: Some(self.timeout_secs.value),
                install_timeout_secs: Some(self.install_timeout_secs.value),
                unit: suite(&self.unit),
                integration: suite(&self.integration),
                bench: self.bench.as_ref().map(|r| r.value.clone()),
                syntax_check: self.syntax_check.as_ref().map(|r| r.value.clone()),
            },
            backup_retention: Some(self.backup_retention.value),
            transaction_retention_days: Some(self.transaction_retention_days.value),
            action_log_enabled: Some(self.action_log_enabled.value),
        }
    }

    /// Key, value, and source of every setting, for `bh config show`.
    pub fn entries(&self) -> Vec<(&'static str, Value, String)> {
        fn entry<T: serde::Serialize>(
            key: &'static str,
            r: &Resolved<T>,
        ) -> (&'static str, Value, String) {
            (key, json!(r.value), r.source.to_string())
        }
        fn opt_entry<T: serde::Serialize>(
            key: &'static str,
            r: &Option<Resolved<T>>,
        ) -> (&'static str, Value, String) {
            match r {
                Some(r) => entry(key, r),
                None => (key, Value::Null, ValueSource::Default.to_string()),
            }
        }

        vec![
            entry("data-dir", &self.data_dir),
            entry("validator.max-depth", &self.max_depth),
            entry("validator.similarity-threshold", &self.similarity_threshold),
            entry("validator.recency-window-hours", &self.recency_window_hours),
            entry("validator.history-limit", &self.history_limit),
            entry("validator.risk-threshold", &self.risk_threshold),
            entry("validator.max-files", &self.max_files),
            entry("protected", &self.protected),
            entry("sandbox.exclude", &self.excludes),
            entry("sandbox.timeout-secs", &self.timeout_secs),
            entry("sandbox.install-timeout-secs", &self.install_timeout_secs),
            opt_entry("sandbox.unit", &self.unit),
            opt_entry("sandbox.integration", &self.integration),
            opt_entry("sandbox.bench", &self.bench),
            opt_entry("sandbox.syntax-check", &self.syntax_check),
            entry("backup.retention", &self.backup_retention),
            entry("transactions.retention-days", &self.transaction_retention_days),
            entry("action-log.enabled", &self.action_log_enabled),
        ]
    }
}

/// Path of the system-level config file.
pub fn system_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        if !dir.is_empty() {
            return Some(PathBuf::from(dir).join("config.kdl"));
        }
    }
    dirs::config_dir().map(|d| d.join("bulkhead").join("config.kdl"))
}

/// Path of the project-level config file.
pub fn project_config_path(repo: &Path) -> PathBuf {
    repo.join(PROJECT_CONFIG_FILE)
}

/// Load and validate one config layer. A missing file is `None`.
pub fn load_config_file(path: &Path) -> Result<Option<BulkheadConfig>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };
    let doc: KdlDocument = content
        .parse()
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    let config = BulkheadConfig::from_kdl(&doc);
    config
        .validate()
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    Ok(Some(config))
}

fn anchor(repo: &Path, dir: &str) -> PathBuf {
    let path = PathBuf::from(dir);
    if path.is_absolute() {
        path
    } else {
        repo.join(path)
    }
}

/// Resolve configuration with the full precedence chain.
pub fn resolve_config(repo: &Path, overrides: &ConfigOverrides) -> Result<ResolvedConfig> {
    let system = match system_config_path() {
        Some(path) => load_config_file(&path)?,
        None => None,
    }
    .unwrap_or_default();
    let project = load_config_file(&project_config_path(repo))?.unwrap_or_default();
    resolve_layers(repo, overrides, &project, &system)
}

/// Resolve from already-loaded layers.
pub fn resolve_layers(
    repo: &Path,
    overrides: &ConfigOverrides,
    project: &BulkheadConfig,
    system: &BulkheadConfig,
) -> Result<ResolvedConfig> {
    let data_dir = if let Some(ref dir) = overrides.data_dir {
        Resolved::new(dir.clone(), ValueSource::CliFlag)
    } else if let Some(dir) = std::env::var(DATA_DIR_ENV).ok().filter(|d| !d.is_empty()) {
        Resolved::new(PathBuf::from(dir), ValueSource::EnvVar(DATA_DIR_ENV.to_string()))
    } else if let Some(ref dir) = project.data_dir {
        Resolved::new(anchor(repo, dir), ValueSource::Project)
    } else if let Some(ref dir) = system.data_dir {
        Resolved::new(anchor(repo, dir), ValueSource::System)
    } else {
        Resolved::new(
            DataDir::for_repo(repo)?.root().to_path_buf(),
            ValueSource::Default,
        )
    };

    let defaults = ValidatorConfig::default();
    let (pv, sv) = (&project.validator, &system.validator);
    let (ps, ss) = (&project.sandbox, &system.sandbox);

    Ok(ResolvedConfig {
        repo: repo.to_path_buf(),
        data_dir,
        max_depth: layered(pv.max_depth.as_ref(), sv.max_depth.as_ref(), defaults.max_depth),
        similarity_threshold: layered(
            pv.similarity_threshold.as_ref(),
            sv.similarity_threshold.as_ref(),
            defaults.similarity_threshold,
        ),
        recency_window_hours: layered(
            pv.recency_window_hours.as_ref(),
            sv.recency_window_hours.as_ref(),
            defaults.recency_window_hours,
        ),
        history_limit: layered(
            pv.history_limit.as_ref(),
            sv.history_limit.as_ref(),
            defaults.history_limit,
        ),
        risk_threshold: layered(
            pv.risk_threshold.as_ref(),
            sv.risk_threshold.as_ref(),
            defaults.risk_threshold,
        ),
        max_files: layered(pv.max_files.as_ref(), sv.max_files.as_ref(), defaults.max_files),
        protected: layered(
            project.protected.as_ref(),
            system.protected.as_ref(),
            defaults.protected,
        ),
        excludes: layered(ps.exclude.as_ref(), ss.exclude.as_ref(), Vec::new()),
        timeout_secs: layered(ps.timeout_secs.as_ref(), ss.timeout_secs.as_ref(), 300),
        install_timeout_secs: layered(
            ps.install_timeout_secs.as_ref(),
            ss.install_timeout_secs.as_ref(),
            600,
        ),
        unit: layered_opt(ps.unit.as_ref(), ss.unit.as_ref()),
        integration: layered_opt(ps.integration.as_ref(), ss.integration.as_ref()),
        bench: layered_opt(ps.bench.as_ref(), ss.bench.as_ref()),
        syntax_check: layered_opt(ps.syntax_check.as_ref(), ss.syntax_check.as_ref()),
        backup_retention: layered(
            project.backup_retention.as_ref(),
            system.backup_retention.as_ref(),
            10,
        ),
        transaction_retention_days: layered(
            project.transaction_retention_days.as_ref(),
            system.transaction_retention_days.as_ref(),
            30,
        ),
        action_log_enabled: layered(
            project.action_log_enabled.as_ref(),
            system.action_log_enabled.as_ref(),
            true,
        ),
    })
}
