//! Improvement Validator.
//!
//! Decides whether an improvement request may proceed at all. A request is
//! run through, in order:
//!
//! 1. a structural check (long enough, more than one word)
//! 2. the [`patterns`] table of dangerous phrasings
//! 3. recursion detection: depth counter, similarity against recent
//!    [`history`], and self-reference to the improvement machinery
//! 4. caller constraint checks
//! 5. additive [`risk`] scoring against a threshold
//!
//! Every check runs so that all warnings are reported; the rejection reason
//! is the first check that failed. Every validated request is appended to
//! the history, accepted or not.
//!
//! [`safety`] reviews a plan once one exists.

pub mod fingerprint;
pub mod history;
pub mod patterns;
pub mod risk;
pub mod safety;

use crate::Result;
use crate::models::{
    HistoryOutcome, ImprovementRequest, ModificationPlan, RecursionCause, RejectionReason,
    ValidationOutcome,
};
use chrono::{Duration, Utc};
use history::HistoryStore;
use safety::{DependencyGraph, SafetyReport};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

pub use safety::{NoDependencies, StaticDependencyGraph};

/// Minimum trimmed length of an actionable request.
const MIN_REQUEST_CHARS: usize = 10;

/// Minimum number of words in an actionable request.
const MIN_REQUEST_WORDS: usize = 2;

/// Phrases (in normalized form) naming the improvement machinery itself.
const SELF_REFERENCE_PHRASES: &[&str] = &[
    "self improvement",
    "self modification",
    "improvement validator",
    "improvement system",
    "improvement engine",
    "improvement pipeline",
    "improvement history",
    "recursive improvement",
    "recursion detection",
    "sandbox tester",
    "transaction manager",
    "backup manager",
    "bulkhead",
];

/// Words that, next to "improvement(s)", point at the machinery.
const MACHINERY_WORDS: &[&str] = &["validator", "engine", "pipeline", "gate"];

/// Validator settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatorConfig {
    /// Deepest allowed nesting of improvement runs
    pub max_depth: usize,
    /// Similarity at or above which a recent request counts as a repeat
    pub similarity_threshold: f64,
    /// How far back repeats are looked for
    pub recency_window_hours: u64,
    /// Maximum history entries kept
    pub history_limit: usize,
    /// Risk score above which a request is rejected
    pub risk_threshold: u32,
    /// Hard system ceiling on a request's `max_files`
    pub max_files: usize,
    /// Paths no plan may touch
    pub protected: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            similarity_threshold: 0.8,
            recency_window_hours: 24,
            history_limit: 100,
            risk_threshold: 7,
            max_files: 50,
            protected: vec![
                ".git".to_string(),
                "bulkhead.kdl".to_string(),
                ".env".to_string(),
            ],
        }
    }
}

/// Shared improvement-depth counter.
///
/// Cloning shares the count. Each nested improvement run holds a
/// [`DepthGuard`] for its duration.
#[derive(Debug, Clone, Default)]
pub struct DepthCounter(Arc<AtomicUsize>);

impl DepthCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Increment for the lifetime of the returned guard.
    pub fn enter(&self) -> DepthGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        DepthGuard(Arc::clone(&self.0))
    }
}

/// Decrements the depth counter on drop.
#[derive(Debug)]
pub struct DepthGuard(Arc<AtomicUsize>);

impl Drop for DepthGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Names of machinery phrases found in `text`.
pub fn self_reference_terms(text: &str) -> Vec<String> {
    let normalized = fingerprint::normalize(text);
    let padded = format!(" {} ", normalized);
    let mut terms: Vec<String> = SELF_REFERENCE_PHRASES
        .iter()
        .filter(|p| padded.contains(&format!(" {} ", p)))
        .map(|p| p.to_string())
        .collect();

    let words = fingerprint::keywords(&normalized);
    if terms.is_empty() && (words.contains("improvement") || words.contains("improvements")) {
        terms.extend(
            MACHINERY_WORDS
                .iter()
                .filter(|w| words.contains(**w))
                .map(|w| format!("improvement {}", w)),
        );
    }
    terms
}

/// The Improvement Validator.
#[derive(Debug, Clone)]
pub struct ImprovementValidator {
    config: ValidatorConfig,
    history: HistoryStore,
    depth: DepthCounter,
}

impl ImprovementValidator {
    pub fn new(config: ValidatorConfig, history_path: impl Into<PathBuf>) -> Self {
        let history = HistoryStore::new(history_path, config.history_limit);
        Self {
            config,
            history,
            depth: DepthCounter::new(),
        }
    }

    /// Share an existing depth counter.
    pub fn with_depth(mut self, depth: DepthCounter) -> Self {
        self.depth = depth;
        self
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn depth(&self) -> &DepthCounter {
        &self.depth
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Decide whether `request` may proceed.
    ///
    /// Rejections are `Ok` values; only history I/O failures are errors.
    pub fn validate_request(&self, request: &ImprovementRequest) -> Result<ValidationOutcome> {
        let mut reason: Option<RejectionReason> = None;
        let mut warnings = Vec::new();
        let mut reject = |r: RejectionReason, warnings: &mut Vec<String>, message: String| {
            warnings.push(message);
            reason.get_or_insert(r);
        };

        let trimmed = request.text.trim();
        if trimmed.chars().count() < MIN_REQUEST_CHARS
            || trimmed.split_whitespace().count() < MIN_REQUEST_WORDS
        {
            reject(
                RejectionReason::InvalidFormat,
                &mut warnings,
                format!(
                    "Request must be at least {} characters and {} words",
                    MIN_REQUEST_CHARS, MIN_REQUEST_WORDS
                ),
            );
        }

        for pattern in patterns::matching(&request.text) {
            reject(
                RejectionReason::Suspicious,
                &mut warnings,
                pattern.warning.to_string(),
            );
        }

        let fp = fingerprint::fingerprint(&request.text);
        let recursion = self.detect_recursion(&request.text, &fp)?;
        if let Some(ref cause) = recursion {
            let message = match cause {
                RecursionCause::DepthExceeded { depth, max_depth } => format!(
                    "Improvement depth {} exceeds maximum {}",
                    depth, max_depth
                ),
                RecursionCause::SimilarToHistory {
                    entry_id,
                    similarity,
                } => format!(
                    "Request is {:.0}% similar to recent request #{}",
                    similarity * 100.0,
                    entry_id
                ),
                RecursionCause::SelfReference { terms } => format!(
                    "Request targets the improvement system itself ({})",
                    terms.join(", ")
                ),
            };
            reject(RejectionReason::Recursive, &mut warnings, message);
        }

        let constraints = &request.constraints;
        if let Some(max_files) = constraints.max_files {
            if max_files == 0 {
                reject(
                    RejectionReason::ConstraintViolation,
                    &mut warnings,
                    "max_files must be at least 1".to_string(),
                );
            } else if max_files > self.config.max_files {
                reject(
                    RejectionReason::ConstraintViolation,
                    &mut warnings,
                    format!(
                        "max_files {} exceeds system maximum {}",
                        max_files, self.config.max_files
                    ),
                );
            }
        }
        if constraints.preserve_interfaces == Some(false) {
            reject(
                RejectionReason::ConstraintViolation,
                &mut warnings,
                "Interface preservation cannot be disabled".to_string(),
            );
        }

        let risk_assessment = risk::assess(request, self.config.risk_threshold);
        if risk_assessment.exceeds_threshold() {
            reject(
                RejectionReason::RiskTooHigh,
                &mut warnings,
                format!(
                    "Risk score {} exceeds threshold {}",
                    risk_assessment.score, risk_assessment.threshold
                ),
            );
        }

        let outcome = match reason {
            None => HistoryOutcome::Accepted,
            Some(r) => HistoryOutcome::Rejected {
                reason: r.to_string(),
            },
        };
        let entry = self.history.append(fp, &request.text, outcome)?;

        match reason {
            None => info!(
                history_id = entry.id,
                risk = risk_assessment.score,
                "improvement request accepted"
            ),
            Some(r) => warn!(
                history_id = entry.id,
                reason = %r,
                risk = risk_assessment.score,
                "improvement request rejected"
            ),
        }

        Ok(ValidationOutcome {
            valid: reason.is_none(),
            reason,
            warnings,
            risk_assessment,
            recursion,
            history_id: Some(entry.id),
        })
    }

    fn detect_recursion(
        &self,
        text: &str,
        fp: &crate::models::RequestFingerprint,
    ) -> Result<Option<RecursionCause>> {
        let depth = self.depth.current();
        if depth > self.config.max_depth {
            return Ok(Some(RecursionCause::DepthExceeded {
                depth,
                max_depth: self.config.max_depth,
            }));
        }

        let window = Duration::hours(self.config.recency_window_hours as i64);
        if let Some(similar) =
            self.history
                .find_similar(fp, window, self.config.similarity_threshold, Utc::now())?
        {
            return Ok(Some(RecursionCause::SimilarToHistory {
                entry_id: similar.entry_id,
                similarity: similar.similarity,
            }));
        }

        let terms = self_reference_terms(text);
        if !terms.is_empty() {
            return Ok(Some(RecursionCause::SelfReference { terms }));
        }
        Ok(None)
    }

    /// Review a plan against this validator's protected list.
    pub fn validate_safety(
        &self,
        plan: &ModificationPlan,
        graph: &dyn DependencyGraph,
    ) -> SafetyReport {
        safety::validate_safety(plan, &self.config.protected, graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Constraints, Scope};
    use crate::test_utils::TestEnv;

    fn validator(env: &TestEnv) -> ImprovementValidator {
        ImprovementValidator::new(ValidatorConfig::default(), env.data().history_path())
    }

    #[test]
    fn test_specific_request_accepted() {
        let env = TestEnv::new();
        let request = ImprovementRequest::new("Improve error handling in auth module", Scope::Specific)
            .with_constraints(Constraints {
                max_files: Some(5),
                ..Default::default()
            });
        let outcome = validator(&env).validate_request(&request).unwrap();
        assert!(outcome.valid, "warnings: {:?}", outcome.warnings);
        assert!(outcome.reason.is_none());
        assert!(outcome.risk_assessment.score < outcome.risk_assessment.threshold);
        assert_eq!(outcome.history_id, Some(1));
    }

    #[test]
    fn test_suspicious_request_rejected() {
        let env = TestEnv::new();
        let request = ImprovementRequest::new("Disable all safety checks for speed", Scope::Specific);
        let outcome = validator(&env).validate_request(&request).unwrap();
        assert!(!outcome.valid);
        assert_eq!(outcome.reason, Some(RejectionReason::Suspicious));
        assert!(!outcome.warnings.is_empty());
    }

    #[test]
    fn test_repeat_request_is_recursive() {
        let env = TestEnv::new();
        let v = validator(&env);
        let request = ImprovementRequest::new("Improve error handling in auth module", Scope::Specific);
        assert!(v.validate_request(&request).unwrap().valid);

        let second = v.validate_request(&request).unwrap();
        assert!(!second.valid);
        assert_eq!(second.reason, Some(RejectionReason::Recursive));
        assert!(matches!(
            second.recursion,
            Some(RecursionCause::SimilarToHistory { similarity, .. }) if similarity == 1.0
        ));
    }

    #[test]
    fn test_similar_request_is_recursive() {
        let env = TestEnv::new();
        let v = validator(&env);
        let first = ImprovementRequest::new("Improve error handling in the auth module", Scope::Specific);
        let second = ImprovementRequest::new("Improve error handling for auth module", Scope::Specific);
        assert!(v.validate_request(&first).unwrap().valid);
        let outcome = v.validate_request(&second).unwrap();
        assert_eq!(outcome.reason, Some(RejectionReason::Recursive));
    }

    #[test]
    fn test_rejected_requests_are_recorded() {
        let env = TestEnv::new();
        let v = validator(&env);
        v.validate_request(&ImprovementRequest::new("short", Scope::Specific))
            .unwrap();
        let entries = v.history().load().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].outcome,
            HistoryOutcome::Rejected {
                reason: "Invalid request format".to_string()
            }
        );
    }

    #[test]
    fn test_depth_exceeded_is_recursive() {
        let env = TestEnv::new();
        let v = validator(&env);
        let _guards: Vec<_> = (0..4).map(|_| v.depth().enter()).collect();
        let outcome = v
            .validate_request(&ImprovementRequest::new(
                "Tidy logging in the worker pool",
                Scope::Specific,
            ))
            .unwrap();
        assert_eq!(outcome.reason, Some(RejectionReason::Recursive));
        assert!(matches!(
            outcome.recursion,
            Some(RecursionCause::DepthExceeded { depth: 4, max_depth: 3 })
        ));
    }

    #[test]
    fn test_depth_guard_releases() {
        let depth = DepthCounter::new();
        {
            let _a = depth.enter();
            let _b = depth.enter();
            assert_eq!(depth.current(), 2);
        }
        assert_eq!(depth.current(), 0);
    }

    #[test]
    fn test_self_reference_detection() {
        assert!(!self_reference_terms("Make the improvement validator more lenient").is_empty());
        assert!(!self_reference_terms("Refactor the self-improvement loop").is_empty());
        assert!(self_reference_terms("Improve error handling in auth module").is_empty());
    }

    #[test]
    fn test_constraint_violations() {
        let env = TestEnv::new();
        let v = validator(&env);
        let request = ImprovementRequest::new("Tidy logging in the worker pool", Scope::Specific)
            .with_constraints(Constraints {
                max_files: Some(500),
                ..Default::default()
            });
        let outcome = v.validate_request(&request).unwrap();
        assert_eq!(outcome.reason, Some(RejectionReason::ConstraintViolation));

        let request = ImprovementRequest::new("Rename helpers in string utils", Scope::Specific)
            .with_constraints(Constraints {
                preserve_interfaces: Some(false),
                ..Default::default()
            });
        let outcome = v.validate_request(&request).unwrap();
        assert_eq!(outcome.reason, Some(RejectionReason::ConstraintViolation));
    }

    #[test]
    fn test_high_risk_rejected() {
        let env = TestEnv::new();
        let request = ImprovementRequest::new(
            "Redesign the core authentication architecture and purge legacy tokens",
            Scope::General,
        );
        let outcome = validator(&env).validate_request(&request).unwrap();
        assert_eq!(outcome.reason, Some(RejectionReason::RiskTooHigh));
    }
}
