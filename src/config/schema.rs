//! KDL schema for `bulkhead.kdl` / `config.kdl`.
//!
//! Both the project file and the system file share this schema. Every field
//! is optional so that layers can be merged; unset fields fall through to
//! the next layer and finally to built-in defaults.
//!
//! ```kdl
//! data-dir ".bulkhead"
//! validator {
//!     max-depth 3
//!     similarity-threshold 0.8
//!     recency-window-hours 24
//!     history-limit 100
//!     risk-threshold 7
//!     max-files 50
//! }
//! protected ".git" "bulkhead.kdl" ".env"
//! sandbox {
//!     exclude "node_modules" "target"
//!     timeout-secs 300
//!     install-timeout-secs 600
//!     unit "npm" "test" required=#true
//!     integration "npm" "run" "test:integration" required=#false
//!     bench "npm" "run" "bench"
//!     syntax-check "node" "--check" "{file}"
//! }
//! backup { retention 10 }
//! transactions { retention-days 30 }
//! action-log enabled=#true
//! ```

use kdl::{KdlDocument, KdlEntry, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};

/// A test command declared in the `sandbox` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteSpec {
    pub command: Vec<String>,
    pub required: bool,
}

/// `validator { ... }` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidatorSection {
    pub max_depth: Option<usize>,
    pub similarity_threshold: Option<f64>,
    pub recency_window_hours: Option<u64>,
    pub history_limit: Option<usize>,
    pub risk_threshold: Option<u32>,
    pub max_files: Option<usize>,
}

/// `sandbox { ... }` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxSection {
    pub exclude: Option<Vec<String>>,
    pub timeout_secs: Option<u64>,
    pub install_timeout_secs: Option<u64>,
    pub unit: Option<SuiteSpec>,
    pub integration: Option<SuiteSpec>,
    pub bench: Option<Vec<String>>,
    pub syntax_check: Option<Vec<String>>,
}

/// One configuration layer as read from a KDL file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkheadConfig {
    pub data_dir: Option<String>,
    pub validator: ValidatorSection,
    pub protected: Option<Vec<String>>,
    pub sandbox: SandboxSection,
    pub backup_retention: Option<usize>,
    pub transaction_retention_days: Option<u32>,
    pub action_log_enabled: Option<bool>,
}

fn string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn first_string(node: &KdlNode) -> Option<String> {
    node.entries()
        .first()
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn first_integer(node: &KdlNode) -> Option<i128> {
    node.entries().first().and_then(|e| e.value().as_integer())
}

fn first_float(node: &KdlNode) -> Option<f64> {
    let value = node.entries().first()?.value();
    value
        .as_float()
        .or_else(|| value.as_integer().map(|i| i as f64))
}

fn suite(node: &KdlNode) -> Option<SuiteSpec> {
    let command = string_args(node);
    if command.is_empty() {
        return None;
    }
    let required = node
        .get("required")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    Some(SuiteSpec { command, required })
}

fn string_node(name: &str, args: &[String]) -> KdlNode {
    let mut node = KdlNode::new(name);
    for arg in args {
        node.push(KdlEntry::new(KdlValue::String(arg.clone())));
    }
    node
}

fn integer_node(name: &str, value: i128) -> KdlNode {
    let mut node = KdlNode::new(name);
    node.push(KdlEntry::new(KdlValue::Integer(value)));
    node
}

fn suite_node(name: &str, spec: &SuiteSpec) -> KdlNode {
    let mut node = string_node(name, &spec.command);
    node.push(KdlEntry::new_prop("required", KdlValue::Bool(spec.required)));
    node
}

impl BulkheadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check ranges of set values.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(t) = self.validator.similarity_threshold {
            if !(0.0..=1.0).contains(&t) {
                return Err(format!("similarity-threshold must be 0.0-1.0, got {}", t));
            }
        }
        if self.validator.max_files == Some(0) {
            return Err("max-files must be at least 1".to_string());
        }
        if self.validator.history_limit == Some(0) {
            return Err("history-limit must be at least 1".to_string());
        }
        if self.sandbox.timeout_secs == Some(0) {
            return Err("timeout-secs must be non-zero".to_string());
        }
        if self.sandbox.install_timeout_secs == Some(0) {
            return Err("install-timeout-secs must be non-zero".to_string());
        }
        if self.backup_retention == Some(0) {
            return Err("backup retention must be at least 1".to_string());
        }
        if let Some(ref check) = self.sandbox.syntax_check {
            if !check.iter().any(|a| a.contains("{file}")) {
                return Err("syntax-check command must contain a {file} placeholder".to_string());
            }
        }
        Ok(())
    }

    /// Parse config from a KDL document. Unknown nodes are ignored.
    pub fn from_kdl(doc: &KdlDocument) -> Self {
        let mut config = Self::new();

        for node in doc.nodes() {
            match node.name().value() {
                "data-dir" => config.data_dir = first_string(node),
                "protected" => config.protected = Some(string_args(node)),
                "action-log" => {
                    config.action_log_enabled = node
                        .get("enabled")
                        .and_then(|v| v.as_bool())
                        .or_else(|| node.entries().first().and_then(|e| e.value().as_bool()));
                }
                "validator" => {
                    if let Some(children) = node.children() {
                        parse_validator(children, &mut config.validator);
                    }
                }
                "sandbox" => {
                    if let Some(children) = node.children() {
                        parse_sandbox(children, &mut config.sandbox);
                    }
                }
                "backup" => {
                    if let Some(retention) = node
                        .children()
                        .and_then(|c| c.get("retention"))
                        .and_then(first_integer)
                    {
                        config.backup_retention = usize::try_from(retention).ok();
                    }
                }
                "transactions" => {
                    if let Some(days) = node
                        .children()
                        .and_then(|c| c.get("retention-days"))
                        .and_then(first_integer)
                    {
                        config.transaction_retention_days = u32::try_from(days).ok();
                    }
                }
                _ => {}
            }
        }

        config
    }

    /// Convert config to a KDL document.
    pub fn to_kdl(&self) -> KdlDocument {
        let mut doc = KdlDocument::new();

        if let Some(ref dir) = self.data_dir {
            doc.nodes_mut()
                .push(string_node("data-dir", std::slice::from_ref(dir)));
        }

        let mut validator = KdlDocument::new();
        let v = &self.validator;
        if let Some(n) = v.max_depth {
            validator.nodes_mut().push(integer_node("max-depth", n as i128));
        }
        if let Some(t) = v.similarity_threshold {
            let mut node = KdlNode::new("similarity-threshold");
            node.push(KdlEntry::new(KdlValue::Float(t)));
            validator.nodes_mut().push(node);
        }
        if let Some(h) = v.recency_window_hours {
            validator
                .nodes_mut()
                .push(integer_node("recency-window-hours", h as i128));
        }
        if let Some(n) = v.history_limit {
            validator.nodes_mut().push(integer_node("history-limit", n as i128));
        }
        if let Some(n) = v.risk_threshold {
            validator.nodes_mut().push(integer_node("risk-threshold", n as i128));
        }
        if let Some(n) = v.max_files {
            validator.nodes_mut().push(integer_node("max-files", n as i128));
        }
        if !validator.nodes().is_empty() {
            let mut node = KdlNode::new("validator");
            node.set_children(validator);
            doc.nodes_mut().push(node);
        }

        if let Some(ref protected) = self.protected {
            doc.nodes_mut().push(string_node("protected", protected));
        }

        let mut sandbox = KdlDocument::new();
        let s = &self.sandbox;
        if let Some(ref exclude) = s.exclude {
            sandbox.nodes_mut().push(string_node("exclude", exclude));
        }
        if let Some(n) = s.timeout_secs {
            sandbox.nodes_mut().push(integer_node("timeout-secs", n as i128));
        }
        if let Some(n) = s.install_timeout_secs {
            sandbox
                .nodes_mut()
                .push(integer_node("install-timeout-secs", n as i128));
        }
        if let Some(ref unit) = s.unit {
            sandbox.nodes_mut().push(suite_node("unit", unit));
        }
        if let Some(ref integration) = s.integration {
            sandbox.nodes_mut().push(suite_node("integration", integration));
        }
        if let Some(ref bench) = s.bench {
            sandbox.nodes_mut().push(string_node("bench", bench));
        }
        if let Some(ref check) = s.syntax_check {
            sandbox.nodes_mut().push(string_node("syntax-check", check));
        }
        if !sandbox.nodes().is_empty() {
            let mut node = KdlNode::new("sandbox");
            node.set_children(sandbox);
            doc.nodes_mut().push(node);
        }

        if let Some(retention) = self.backup_retention {
            let mut children = KdlDocument::new();
            children
                .nodes_mut()
                .push(integer_node("retention", retention as i128));
            let mut node = KdlNode::new("backup");
            node.set_children(children);
            doc.nodes_mut().push(node);
        }

        if let Some(days) = self.transaction_retention_days {
            let mut children = KdlDocument::new();
            children
                .nodes_mut()
                .push(integer_node("retention-days", days as i128));
            let mut node = KdlNode::new("transactions");
            node.set_children(children);
            doc.nodes_mut().push(node);
        }

        if let Some(enabled) = self.action_log_enabled {
            let mut node = KdlNode::new("action-log");
            node.push(KdlEntry::new_prop("enabled", KdlValue::Bool(enabled)));
            doc.nodes_mut().push(node);
        }

        doc
    }
}

fn parse_validator(doc: &KdlDocument, out: &mut ValidatorSection) {
    for child in doc.nodes() {
        match child.name().value() {
            "max-depth" => out.max_depth = first_integer(child).and_then(|n| n.try_into().ok()),
            "similarity-threshold" => out.similarity_threshold = first_float(child),
            "recency-window-hours" => {
                out.recency_window_hours = first_integer(child).and_then(|n| n.try_into().ok())
            }
            "history-limit" => {
                out.history_limit = first_integer(child).and_then(|n| n.try_into().ok())
            }
            "risk-threshold" => {
                out.risk_threshold = first_integer(child).and_then(|n| n.try_into().ok())
            }
            "max-files" => out.max_files = first_integer(child).and_then(|n| n.try_into().ok()),
            _ => {}
        }
    }
}

fn parse_sandbox(doc: &KdlDocument, out: &mut SandboxSection) {
    for child in doc.nodes() {
        match child.name().value() {
            "exclude" => out.exclude = Some(string_args(child)),
            "timeout-secs" => {
                out.timeout_secs = first_integer(child).and_then(|n| n.try_into().ok())
            }
            "install-timeout-secs" => {
                out.install_timeout_secs = first_integer(child).and_then(|n| n.try_into().ok())
            }
            "unit" => out.unit = suite(child),
            "integration" => out.integration = suite(child),
            "bench" => out.bench = Some(string_args(child)).filter(|a| !a.is_empty()),
            "syntax-check" => out.syntax_check = Some(string_args(child)).filter(|a| !a.is_empty()),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        data-dir ".bulkhead"
        validator {
            max-depth 5
            similarity-threshold 0.9
            recency-window-hours 12
            history-limit 40
            risk-threshold 6
            max-files 25
        }
        protected ".git" "secrets"
        sandbox {
            exclude "dist"
            timeout-secs 60
            unit "npm" "test" required=#true
            integration "npm" "run" "test:integration" required=#false
            bench "node" "bench.js"
            syntax-check "node" "--check" "{file}"
        }
        backup { retention 4 }
        transactions { retention-days 7 }
        action-log enabled=#false
    "#;

    #[test]
    fn test_config_from_kdl_empty() {
        let config = BulkheadConfig::from_kdl(&KdlDocument::new());
        assert_eq!(config, BulkheadConfig::default());
    }

    #[test]
    fn test_config_from_kdl_full() {
        let doc: KdlDocument = FULL.parse().unwrap();
        let config = BulkheadConfig::from_kdl(&doc);

        assert_eq!(config.data_dir.as_deref(), Some(".bulkhead"));
        assert_eq!(config.validator.max_depth, Some(5));
        assert_eq!(config.validator.similarity_threshold, Some(0.9));
        assert_eq!(config.validator.risk_threshold, Some(6));
        assert_eq!(
            config.protected,
            Some(vec![".git".to_string(), "secrets".to_string()])
        );
        assert_eq!(config.sandbox.timeout_secs, Some(60));
        let integration = config.sandbox.integration.as_ref().unwrap();
        assert_eq!(integration.command, vec!["npm", "run", "test:integration"]);
        assert!(!integration.required);
        assert!(config.sandbox.unit.as_ref().unwrap().required);
        assert_eq!(config.backup_retention, Some(4));
        assert_eq!(config.transaction_retention_days, Some(7));
        assert_eq!(config.action_log_enabled, Some(false));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_to_kdl_roundtrip() {
        let doc: KdlDocument = FULL.parse().unwrap();
        let config = BulkheadConfig::from_kdl(&doc);
        let reparsed: KdlDocument = config.to_kdl().to_string().parse().unwrap();
        assert_eq!(BulkheadConfig::from_kdl(&reparsed), config);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = BulkheadConfig::default();
        config.validator.similarity_threshold = Some(1.5);
        assert!(config.validate().unwrap_err().contains("similarity-threshold"));

        let mut config = BulkheadConfig::default();
        config.sandbox.timeout_secs = Some(0);
        assert!(config.validate().is_err());

        let mut config = BulkheadConfig::default();
        config.sandbox.syntax_check = Some(vec!["node".to_string(), "--check".to_string()]);
        assert!(config.validate().unwrap_err().contains("{file}"));
    }
}
