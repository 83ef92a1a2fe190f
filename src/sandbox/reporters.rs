//! Pass/fail extraction from test runner output.
//!
//! Each known reporter format has its own summary shape. Parsers are tried
//! in a fixed order and the first one that recognises the output wins.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// Counts extracted from a test run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
}

/// Which reporter format matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reporter {
    Cargo,
    Jest,
    Mocha,
    Pytest,
    Tap,
}

struct Patterns {
    cargo: Regex,
    jest_line: Regex,
    mocha_passing: Regex,
    mocha_failing: Regex,
    pytest_line: Regex,
    tap_pass: Regex,
    tap_fail: Regex,
    tap_ok: Regex,
    tap_not_ok: Regex,
    passed: Regex,
    failed: Regex,
    errors: Regex,
}

fn patterns() -> Option<Patterns> {
    Some(Patterns {
        cargo: Regex::new(r"test result: \w+\. (\d+) passed; (\d+) failed").ok()?,
        jest_line: Regex::new(r"(?m)^Tests:\s+(.*)$").ok()?,
        mocha_passing: Regex::new(r"(?m)^\s*(\d+) passing\b").ok()?,
        mocha_failing: Regex::new(r"(?m)^\s*(\d+) failing\b").ok()?,
        pytest_line: Regex::new(r"(?m)^=+ (.*\b(?:passed|failed|error)\b.*) in [\d.]+s.*=+\s*$")
            .ok()?,
        tap_pass: Regex::new(r"(?m)^#\s*pass\s+(\d+)").ok()?,
        tap_fail: Regex::new(r"(?m)^#\s*fail\s+(\d+)").ok()?,
        tap_ok: Regex::new(r"(?m)^ok \d+").ok()?,
        tap_not_ok: Regex::new(r"(?m)^not ok \d+").ok()?,
        passed: Regex::new(r"(\d+) passed").ok()?,
        failed: Regex::new(r"(\d+) failed").ok()?,
        errors: Regex::new(r"(\d+) errors?\b").ok()?,
    })
}

static PATTERNS: LazyLock<Option<Patterns>> = LazyLock::new(patterns);

fn number(re: &Regex, text: &str) -> Option<u32> {
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

/// Parse runner output. Returns `None` for unrecognised output.
pub fn parse(output: &str) -> Option<(Reporter, TestCounts)> {
    let p = PATTERNS.as_ref()?;

    // cargo prints one summary per test binary
    let mut cargo = TestCounts::default();
    let mut cargo_seen = false;
    for caps in p.cargo.captures_iter(output) {
        cargo_seen = true;
        cargo.passed += caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        cargo.failed += caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    }
    if cargo_seen {
        return Some((Reporter::Cargo, cargo));
    }

    if let Some(line) = p.jest_line.captures(output).and_then(|c| c.get(1)) {
        let line = line.as_str();
        return Some((
            Reporter::Jest,
            TestCounts {
                passed: number(&p.passed, line).unwrap_or(0),
                failed: number(&p.failed, line).unwrap_or(0),
            },
        ));
    }

    let passing = number(&p.mocha_passing, output);
    let failing = number(&p.mocha_failing, output);
    if passing.is_some() || failing.is_some() {
        return Some((
            Reporter::Mocha,
            TestCounts {
                passed: passing.unwrap_or(0),
                failed: failing.unwrap_or(0),
            },
        ));
    }

    if let Some(line) = p.pytest_line.captures(output).and_then(|c| c.get(1)) {
        let line = line.as_str();
        let errors = number(&p.errors, line).unwrap_or(0);
        return Some((
            Reporter::Pytest,
            TestCounts {
                passed: number(&p.passed, line).unwrap_or(0),
                failed: number(&p.failed, line).unwrap_or(0) + errors,
            },
        ));
    }

    let tap_pass = number(&p.tap_pass, output);
    let tap_fail = number(&p.tap_fail, output);
    if tap_pass.is_some() || tap_fail.is_some() {
        return Some((
            Reporter::Tap,
            TestCounts {
                passed: tap_pass.unwrap_or(0),
                failed: tap_fail.unwrap_or(0),
            },
        ));
    }
    let ok = p.tap_ok.find_iter(output).count() as u32;
    let not_ok = p.tap_not_ok.find_iter(output).count() as u32;
    if ok + not_ok > 0 {
        return Some((
            Reporter::Tap,
            TestCounts {
                passed: ok,
                failed: not_ok,
            },
        ));
    }

    None
}
