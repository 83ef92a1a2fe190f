//! Improvement requests and the validator's verdicts on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;

/// Declared scope of an improvement request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Targets a named component or file set
    #[default]
    Specific,
    /// Targets the system broadly
    General,
}

impl Scope {
    /// Parse from string, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "specific" => Some(Scope::Specific),
            "general" => Some(Scope::General),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Specific => "specific",
            Scope::General => "general",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Caller-supplied limits on what a request may do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    /// Ceiling on the number of files a resulting plan may touch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_files: Option<usize>,

    /// Whether every modification must come with tests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_tests: Option<bool>,

    /// Whether public interfaces must be preserved (only `true` is accepted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserve_interfaces: Option<bool>,
}

/// A proposed improvement, as submitted by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImprovementRequest {
    /// Free-text description of the change
    pub text: String,

    #[serde(default)]
    pub scope: Scope,

    #[serde(default)]
    pub constraints: Constraints,
}

impl ImprovementRequest {
    pub fn new(text: impl Into<String>, scope: Scope) -> Self {
        Self {
            text: text.into(),
            scope,
            constraints: Constraints::default(),
        }
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }
}

/// Normalized signature of a request used for repeat detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFingerprint {
    /// Hash of the normalized text
    pub hash: String,
    /// Significant words of the request
    pub keywords: BTreeSet<String>,
    /// Length of the normalized text
    pub length: usize,
}

/// One contributor to a risk score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub name: String,
    pub points: u32,
}

/// Additive risk score for a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: u32,
    pub factors: Vec<RiskFactor>,
    /// Score above which the request is rejected
    pub threshold: u32,
}

impl RiskAssessment {
    pub fn new(threshold: u32) -> Self {
        Self {
            score: 0,
            factors: Vec::new(),
            threshold,
        }
    }

    /// Add a weighted factor.
    pub fn add(&mut self, name: impl Into<String>, points: u32) {
        self.score = self.score.saturating_add(points);
        self.factors.push(RiskFactor {
            name: name.into(),
            points,
        });
    }

    pub fn exceeds_threshold(&self) -> bool {
        self.score > self.threshold
    }

    pub fn has_factor(&self, name: &str) -> bool {
        self.factors.iter().any(|f| f.name == name)
    }
}

/// Why a request was declined.
///
/// Serialized as the reason string reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    InvalidFormat,
    Suspicious,
    Recursive,
    ConstraintViolation,
    RiskTooHigh,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::InvalidFormat => "Invalid request format",
            RejectionReason::Suspicious => "Suspicious improvement pattern detected",
            RejectionReason::Recursive => "recursive",
            RejectionReason::ConstraintViolation => "Constraint violation",
            RejectionReason::RiskTooHigh => "Risk score exceeds threshold",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for RejectionReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Which recursion rule fired.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum RecursionCause {
    /// The improvement depth counter exceeded its maximum
    DepthExceeded { depth: usize, max_depth: usize },
    /// A recent history entry is too similar
    SimilarToHistory { entry_id: u64, similarity: f64 },
    /// The request targets the improvement machinery itself
    SelfReference { terms: Vec<String> },
}

/// Result of `validate_request`.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub reason: Option<RejectionReason>,
    pub warnings: Vec<String>,
    pub risk_assessment: RiskAssessment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recursion: Option<RecursionCause>,
    /// History entry written for this request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_id: Option<u64>,
}

/// Verdict stored in the improvement history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HistoryOutcome {
    Accepted,
    Rejected { reason: String },
}

/// Persisted record of a validated request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: u64,
    pub fingerprint: RequestFingerprint,
    pub request: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: HistoryOutcome,
}
