//! Per-invocation audit trail.
//!
//! Every `bh` command appends one JSON line to `<data-dir>/action.log`:
//! what ran, where, with which (sanitized) arguments, and how it ended.
//! Logging never fails a command; write errors surface as warnings only.

use crate::Result;
use crate::storage::{append_jsonl, read_jsonl};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::warn;

/// Keys whose values are never written to the log.
const SECRET_MARKERS: &[&str] = &["password", "token", "secret", "key", "credential"];

/// Strings longer than this are truncated.
const MAX_STRING_LEN: usize = 120;

/// Arrays longer than this are summarized.
const MAX_ARRAY_LEN: usize = 10;

/// One recorded command invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub timestamp: DateTime<Utc>,
    pub repo: String,
    /// Command path, e.g. "tx rollback"
    pub command: String,
    pub args: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub user: String,
}

/// Where and whether to record.
#[derive(Debug, Clone)]
pub struct ActionLogger<'a> {
    path: &'a Path,
    enabled: bool,
}

impl<'a> ActionLogger<'a> {
    pub fn new(path: &'a Path, enabled: bool) -> Self {
        Self { path, enabled }
    }

    /// Append a record for one finished command.
    pub fn record(
        &self,
        repo: &Path,
        command: &str,
        args: Value,
        outcome: std::result::Result<(), String>,
        duration_ms: u64,
    ) {
        if !self.enabled {
            return;
        }
        let (success, error) = match outcome {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e)),
        };
        let record = ActionRecord {
            timestamp: Utc::now(),
            repo: repo.display().to_string(),
            command: command.to_string(),
            args: sanitize_args(&args),
            success,
            error,
            duration_ms,
            user: current_user(),
        };
        if let Err(e) = append_jsonl(self.path, &record) {
            warn!(path = %self.path.display(), error = %e, "failed to write action log");
        }
    }
}

/// Read back the log, oldest first.
pub fn read_actions(path: &Path) -> Result<Vec<ActionRecord>> {
    read_jsonl(path)
}

fn is_secret_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SECRET_MARKERS.iter().any(|m| lower.contains(m))
}

/// Redact secret-looking keys, shorten long strings, and summarize big arrays.
pub fn sanitize_args(args: &Value) -> Value {
    match args {
        Value::Object(map) => {
            let mut clean = Map::with_capacity(map.len());
            for (key, value) in map {
                let value = if is_secret_key(key) && !value.is_null() {
                    Value::String("[REDACTED]".to_string())
                } else {
                    sanitize_args(value)
                };
                clean.insert(key.clone(), value);
            }
            Value::Object(clean)
        }
        Value::Array(items) if items.len() > MAX_ARRAY_LEN => {
            Value::String(format!("[{} items]", items.len()))
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_args).collect()),
        Value::String(s) if s.chars().count() > MAX_STRING_LEN => {
            let head: String = s.chars().take(MAX_STRING_LEN - 3).collect();
            Value::String(format!("{}... ({} chars)", head, s.chars().count()))
        }
        other => other.clone(),
    }
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_secret_keys_redacted_recursively() {
        let args = json!({
            "label": "nightly",
            "api_token": "abc",
            "nested": { "password": "hunter2", "path": "src/a.js" },
            "key_file": null
        });
        let clean = sanitize_args(&args);
        assert_eq!(clean["label"], "nightly");
        assert_eq!(clean["api_token"], "[REDACTED]");
        assert_eq!(clean["nested"]["password"], "[REDACTED]");
        assert_eq!(clean["nested"]["path"], "src/a.js");
        assert!(clean["key_file"].is_null());
    }

    #[test]
    fn test_long_values_shortened() {
        let clean = sanitize_args(&json!({ "text": "é".repeat(200), "ids": (0..12).collect::<Vec<_>>() }));
        let text = clean["text"].as_str().unwrap();
        assert!(text.ends_with("... (200 chars)"));
        assert_eq!(clean["ids"], "[12 items]");
        assert_eq!(sanitize_args(&json!([1, 2])), json!([1, 2]));
    }

    #[test]
    fn test_record_appends_and_disabled_is_silent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("action.log");

        let logger = ActionLogger::new(&path, true);
        logger.record(tmp.path(), "tx begin", json!({}), Ok(()), 3);
        logger.record(tmp.path(), "tx commit", json!({"id": "tx-1"}), Err("Transaction is not active".into()), 1);

        let records = read_actions(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].success);
        assert_eq!(records[1].command, "tx commit");
        assert_eq!(records[1].error.as_deref(), Some("Transaction is not active"));

        ActionLogger::new(&path, false).record(tmp.path(), "backup list", json!({}), Ok(()), 0);
        assert_eq!(read_actions(&path).unwrap().len(), 2);
    }
}
