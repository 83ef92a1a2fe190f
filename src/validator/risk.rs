//! Additive risk scoring for improvement requests.
//!
//! Each heuristic contributes a named factor with a fixed weight. The total
//! is compared against the configured threshold; a request scoring above it
//! is rejected even when nothing else flagged it.

use crate::models::{ImprovementRequest, RiskAssessment, Scope};

/// Weights and limits used by the heuristics.
pub mod weights {
    /// Request declares a general (system-wide) scope.
    pub const GENERAL_SCOPE: u32 = 3;
    /// Request mentions security-sensitive areas.
    pub const SECURITY_SENSITIVE: u32 = 2;
    /// Request reaches across the architecture.
    pub const ARCHITECTURE_WIDE: u32 = 3;
    /// Request uses destructive verbs.
    pub const DESTRUCTIVE: u32 = 2;
    /// Request touches persistence.
    pub const DATA_LAYER: u32 = 1;
    /// Caller allows a large number of files.
    pub const BROAD_FILE_SCOPE: u32 = 1;
    /// Caller explicitly waived tests.
    pub const TESTS_NOT_REQUIRED: u32 = 1;
    /// Request text is unusually long.
    pub const LONG_REQUEST: u32 = 1;

    /// `max_files` above this counts as broad.
    pub const BROAD_FILE_COUNT: usize = 20;
    /// Request length (chars) above this counts as long.
    pub const LONG_REQUEST_CHARS: usize = 500;
}

const SECURITY_TERMS: &[&str] = &[
    "security",
    "auth",
    "authentication",
    "authorization",
    "password",
    "passwords",
    "credential",
    "credentials",
    "token",
    "tokens",
    "crypto",
    "encryption",
    "permission",
    "permissions",
    "secret",
    "secrets",
];

const ARCHITECTURE_TERMS: &[&str] = &[
    "architecture",
    "framework",
    "core",
    "entire",
    "whole",
    "everything",
    "global",
    "rewrite",
    "redesign",
];

const ARCHITECTURE_PHRASES: &[&str] = &["system-wide", "system wide", "all modules"];

const DESTRUCTIVE_TERMS: &[&str] = &["delete", "remove", "drop", "purge", "wipe", "truncate"];

const DATA_TERMS: &[&str] = &["database", "schema", "migration", "migrations", "storage"];

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect()
}

fn mentions(words: &[String], terms: &[&str]) -> bool {
    words.iter().any(|w| terms.contains(&w.as_str()))
}

/// Score a request against `threshold`.
pub fn assess(request: &ImprovementRequest, threshold: u32) -> RiskAssessment {
    let mut risk = RiskAssessment::new(threshold);
    let text_lower = request.text.to_lowercase();
    let words = words(&request.text);

    if request.scope == Scope::General {
        risk.add("general_scope", weights::GENERAL_SCOPE);
    }

    if mentions(&words, SECURITY_TERMS) {
        risk.add("security_sensitive", weights::SECURITY_SENSITIVE);
    }

    if mentions(&words, ARCHITECTURE_TERMS)
        || ARCHITECTURE_PHRASES.iter().any(|p| text_lower.contains(p))
    {
        risk.add("architecture_wide", weights::ARCHITECTURE_WIDE);
    }

    if mentions(&words, DESTRUCTIVE_TERMS) {
        risk.add("destructive", weights::DESTRUCTIVE);
    }

    if mentions(&words, DATA_TERMS) {
        risk.add("data_layer", weights::DATA_LAYER);
    }

    if request
        .constraints
        .max_files
        .is_some_and(|n| n > weights::BROAD_FILE_COUNT)
    {
        risk.add("broad_file_scope", weights::BROAD_FILE_SCOPE);
    }

    if request.constraints.require_tests == Some(false) {
        risk.add("tests_not_required", weights::TESTS_NOT_REQUIRED);
    }

    if request.text.chars().count() > weights::LONG_REQUEST_CHARS {
        risk.add("long_request", weights::LONG_REQUEST);
    }

    risk
}
