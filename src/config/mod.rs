//! Configuration for Bulkhead.
//!
//! Settings live in KDL files with a shared schema:
//!
//! - Project: `<repo>/bulkhead.kdl` (checked in alongside the tree it guards)
//! - System: `~/.config/bulkhead/config.kdl`
//!
//! Precedence: CLI flag > environment > project > system > defaults.
//! Use the [`resolver`] module for precedence resolution.

pub mod resolver;
pub mod schema;

pub use resolver::{
    CONFIG_DIR_ENV, ConfigOverrides, DATA_DIR_ENV, PROJECT_CONFIG_FILE, Resolved, ResolvedConfig,
    ValueSource, load_config_file, project_config_path, resolve_config, resolve_layers,
    system_config_path,
};
pub use schema::{BulkheadConfig, SandboxSection, SuiteSpec, ValidatorSection};
