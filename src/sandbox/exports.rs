//! Exported-name scanning for breaking-change detection.
//!
//! Breaking changes are found by structural name diffing: every name a file
//! exported before the plan ran must still be exported afterwards. This is a
//! heuristic. A rename looks exactly like a removal, and a changed signature
//! under the same name is not noticed at all. Scanners sit behind the
//! [`ExportScanner`] trait so a syntax-aware implementation can replace the
//! regex one without touching the sandbox.

use crate::sandbox::checks::Lang;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Extracts the publicly exported names of a source file.
pub trait ExportScanner: Send + Sync {
    /// Exported names of `content`, which was read from `path`.
    fn exports(&self, path: &str, content: &str) -> BTreeSet<String>;
}

/// Names exported before and missing after, as `file: name`.
pub fn removed_exports(
    scanner: &dyn ExportScanner,
    path: &str,
    before: &str,
    after: Option<&str>,
) -> Vec<String> {
    let old = scanner.exports(path, before);
    let new = after
        .map(|content| scanner.exports(path, content))
        .unwrap_or_default();
    old.difference(&new)
        .map(|name| format!("{}: {}", path, name))
        .collect()
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

static JS_NAMED: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?m)^\s*export\s+(?:declare\s+)?(?:async\s+)?(?:function\s*\*?|class|const|let|var|interface|type|enum|abstract\s+class)\s+([A-Za-z_$][\w$]*)",
        r"(?m)^\s*(?:module\.)?exports\.([A-Za-z_$][\w$]*)\s*=",
    ])
});

static JS_LISTS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?m)^\s*export\s*(?:type\s*)?\{([^}]*)\}",
        r"module\.exports\s*=\s*\{([^}]*)\}",
    ])
});

static JS_DEFAULT: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile(&[r"(?m)^\s*export\s+default\b", r"module\.exports\s*=\s*[^{\s]"]));

static RUST_PUB: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r#"(?m)^\s*pub\s+(?:(?:async|const|unsafe|extern\s+"[^"]*")\s+)*(?:fn|struct|enum|trait|type|const|static|mod|union|macro)\s+([A-Za-z_][A-Za-z0-9_]*)"#,
        r"(?m)^\s*pub\s+use\s+[^;]*?(?:::|\s)([A-Za-z_][A-Za-z0-9_]*)\s*;",
        r"(?m)^\s*pub\s+use\s+[^;]*\bas\s+([A-Za-z_][A-Za-z0-9_]*)\s*;",
    ])
});

static PY_TOP: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?m)^(?:async\s+)?def\s+([A-Za-z][A-Za-z0-9_]*)",
        r"(?m)^class\s+([A-Za-z][A-Za-z0-9_]*)",
        r"(?m)^([A-Z][A-Z0-9_]*)\s*=",
    ])
});

fn capture_all(regexes: &[Regex], content: &str, out: &mut BTreeSet<String>) {
    for re in regexes {
        for caps in re.captures_iter(content) {
            if let Some(m) = caps.get(1) {
                out.insert(m.as_str().to_string());
            }
        }
    }
}

/// Names inside `{ a, b as c, type D }`: the exported (right-hand) name.
fn list_names(list: &str) -> impl Iterator<Item = String> + '_ {
    list.split(',').filter_map(|item| {
        let item = item.trim().trim_start_matches("type ").trim();
        let name = match item.split_once(" as ") {
            Some((_, alias)) => alias.trim(),
            None => item.split(':').next().unwrap_or_default().trim(),
        };
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '$');
        valid.then(|| name.to_string())
    })
}

/// Regex-based scanner for JavaScript/TypeScript, Rust, and Python.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexExportScanner;

impl ExportScanner for RegexExportScanner {
    fn exports(&self, path: &str, content: &str) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        match Lang::of(path) {
            Lang::JavaScript => {
                capture_all(&JS_NAMED, content, &mut names);
                for re in JS_LISTS.iter() {
                    for caps in re.captures_iter(content) {
                        if let Some(m) = caps.get(1) {
                            names.extend(list_names(m.as_str()));
                        }
                    }
                }
                if JS_DEFAULT.iter().any(|re| re.is_match(content)) {
                    names.insert("default".to_string());
                }
            }
            Lang::Rust => capture_all(&RUST_PUB, content, &mut names),
            Lang::Python => capture_all(&PY_TOP, content, &mut names),
            _ => {}
        }
        names
    }
}
