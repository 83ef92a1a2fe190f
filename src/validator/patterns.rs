//! Fixed table of dangerous phrasings in improvement requests.

use regex::Regex;
use std::sync::LazyLock;

/// A named pattern and the warning attached when it matches.
pub struct SuspiciousPattern {
    pub name: &'static str,
    pub warning: &'static str,
    regex: Regex,
}

const TABLE: &[(&str, &str, &str)] = &[
    (
        "disable_safety",
        r"(?i)\b(disable|turn\s+off|switch\s+off|skip|deactivate)\b.{0,30}\b(safety|safeguards?|protections?|guards?)\b",
        "Request attempts to disable safety mechanisms",
    ),
    (
        "bypass_validation",
        r"(?i)\b(bypass|circumvent|ignore|skip|avoid)\b.{0,30}\b(validation|validators?|verification|checks?|review)\b",
        "Request attempts to bypass validation",
    ),
    (
        "remove_checks",
        r"(?i)\b(remove|delete|strip|drop|eliminate)\b.{0,30}\b(checks?|assertions?|tests?|guards?|limits?)\b",
        "Request attempts to remove checks or tests",
    ),
    (
        "unlimited_resources",
        r"(?i)\b(unlimited|unbounded|infinite|no)\s+(resources?|memory|recursion|retries|loops?|limits?|timeouts?)\b",
        "Request asks for unlimited resources",
    ),
    (
        "disable_rollback",
        r"(?i)\b(disable|remove|skip|prevent)\b.{0,30}\b(rollback|backups?|undo|recovery)\b",
        "Request attempts to disable recovery mechanisms",
    ),
];

static PATTERNS: LazyLock<Vec<SuspiciousPattern>> = LazyLock::new(|| {
    TABLE
        .iter()
        .filter_map(|(name, pattern, warning)| {
            Regex::new(pattern).ok().map(|regex| SuspiciousPattern {
                name,
                warning,
                regex,
            })
        })
        .collect()
});

/// All patterns matching `text`, in table order.
pub fn matching(text: &str) -> Vec<&'static SuspiciousPattern> {
    PATTERNS.iter().filter(|p| p.regex.is_match(text)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(PATTERNS.len(), TABLE.len());
    }

    #[test]
    fn test_disable_safety_checks_matches() {
        let names: Vec<_> = matching("Disable all safety checks for speed")
            .iter()
            .map(|p| p.name)
            .collect();
        assert!(names.contains(&"disable_safety"));
    }

    #[test]
    fn test_bypass_and_unlimited() {
        assert!(!matching("bypass validation on deploy").is_empty());
        assert!(!matching("allow unlimited memory for workers").is_empty());
        assert!(!matching("skip the rollback step").is_empty());
    }

    #[test]
    fn test_benign_request_does_not_match() {
        assert!(matching("Improve error handling in auth module").is_empty());
        assert!(matching("Add input validation to the signup form").is_empty());
    }
}
