//! Syntax and import checks run against the sandboxed post-image.

use crate::process::{CancelToken, ProcessStatus, command_from_argv, run_bounded};
use crate::storage::normalize_rel_path;
use kdl::KdlDocument;
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

/// Source language, by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lang {
    JavaScript,
    Rust,
    Python,
    /// Other brace languages with C-style comments
    CLike,
    Json,
    Toml,
    Kdl,
    Other,
}

impl Lang {
    pub fn of(path: &str) -> Self {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "js" | "jsx" | "mjs" | "cjs" | "ts" | "tsx" | "mts" | "cts" => Lang::JavaScript,
            "rs" => Lang::Rust,
            "py" | "pyi" => Lang::Python,
            "go" | "java" | "c" | "h" | "cc" | "cpp" | "hpp" | "cs" | "css" | "scss" | "swift"
            | "kt" => Lang::CLike,
            "json" => Lang::Json,
            "toml" => Lang::Toml,
            "kdl" => Lang::Kdl,
            _ => Lang::Other,
        }
    }
}

/// Byte offsets and characters of `content` that are code, skipping string
/// literals and comments.
pub fn code_chars(content: &str, lang: Lang) -> Vec<(usize, char)> {
    scan(content, lang, false)
}

fn scan(content: &str, lang: Lang, keep_strings: bool) -> Vec<(usize, char)> {
    let chars: Vec<(usize, char)> = content.char_indices().collect();
    let mut out = Vec::with_capacity(chars.len());
    let at = |i: usize| chars.get(i).map(|&(_, c)| c);
    let mut i = 0;

    let hash_comments = lang == Lang::Python;
    let slash_comments = matches!(lang, Lang::JavaScript | Lang::Rust | Lang::CLike);

    while i < chars.len() {
        let (pos, c) = chars[i];

        if slash_comments && c == '/' && at(i + 1) == Some('/') {
            while i < chars.len() && chars[i].1 != '\n' {
                i += 1;
            }
            continue;
        }
        if slash_comments && c == '/' && at(i + 1) == Some('*') {
            i += 2;
            while i < chars.len() && !(chars[i].1 == '*' && at(i + 1) == Some('/')) {
                i += 1;
            }
            i += 2;
            continue;
        }
        if hash_comments && c == '#' {
            while i < chars.len() && chars[i].1 != '\n' {
                i += 1;
            }
            continue;
        }

        if lang == Lang::Python && (c == '"' || c == '\'') && at(i + 1) == Some(c) && at(i + 2) == Some(c) {
            i += 3;
            while i < chars.len()
                && !(chars[i].1 == c && at(i + 1) == Some(c) && at(i + 2) == Some(c))
            {
                i += 1;
            }
            i += 3;
            continue;
        }

        let quote = match (lang, c) {
            (Lang::Rust, '\'') => {
                // char literal, otherwise a lifetime
                if at(i + 1) == Some('\\') || at(i + 2) == Some('\'') {
                    Some('\'')
                } else {
                    None
                }
            }
            (Lang::Rust, '"') => Some('"'),
            (Lang::JavaScript | Lang::CLike, '"' | '\'' | '`') => Some(c),
            (Lang::Python, '"' | '\'') => Some(c),
            _ => None,
        };

        if let Some(q) = quote {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i].1 != q {
                if chars[i].1 == '\\' {
                    i += 1;
                } else if chars[i].1 == '\n' && q != '`' && lang != Lang::Rust {
                    break;
                }
                i += 1;
            }
            i += 1;
            if keep_strings {
                out.extend_from_slice(&chars[start..i.min(chars.len())]);
            }
            continue;
        }

        out.push((pos, c));
        i += 1;
    }
    out
}

fn line_of(content: &str, pos: usize) -> usize {
    content[..pos.min(content.len())].matches('\n').count() + 1
}

/// Check that brackets balance outside strings and comments.
pub fn check_delimiters(content: &str, lang: Lang) -> Result<(), String> {
    let mut stack: Vec<(char, usize)> = Vec::new();
    for (pos, c) in code_chars(content, lang) {
        match c {
            '(' | '[' | '{' => stack.push((c, pos)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_pos)) => {
                        return Err(format!(
                            "mismatched '{}' at line {} (opened '{}' at line {})",
                            c,
                            line_of(content, pos),
                            open,
                            line_of(content, open_pos)
                        ));
                    }
                    None => {
                        return Err(format!(
                            "unexpected '{}' at line {}",
                            c,
                            line_of(content, pos)
                        ));
                    }
                }
            }
            _ => {}
        }
    }
    match stack.pop() {
        Some((open, pos)) => Err(format!(
            "unclosed '{}' opened at line {}",
            open,
            line_of(content, pos)
        )),
        None => Ok(()),
    }
}

/// Built-in syntax check for a file's content.
pub fn builtin_syntax_check(path: &str, content: &str) -> Result<(), String> {
    match Lang::of(path) {
        Lang::Json => serde_json::from_str::<serde_json::Value>(content)
            .map(|_| ())
            .map_err(|e| e.to_string()),
        Lang::Toml => toml::from_str::<toml::Value>(content)
            .map(|_| ())
            .map_err(|e| e.to_string()),
        Lang::Kdl => content
            .parse::<KdlDocument>()
            .map(|_| ())
            .map_err(|e| e.to_string()),
        Lang::Other => Ok(()),
        lang => check_delimiters(content, lang),
    }
}

/// Run a configured external checker, substituting `{file}`.
///
/// Returns `None` when the checker program is not installed so the caller
/// can fall back to the built-in check.
pub fn external_syntax_check(
    template: &[String],
    file: &Path,
    cwd: &Path,
    timeout: Duration,
    cancel: &CancelToken,
) -> Option<Result<(), String>> {
    let file_str = file.to_string_lossy();
    let argv: Vec<String> = template
        .iter()
        .map(|arg| arg.replace("{file}", &file_str))
        .collect();
    let mut cmd = match command_from_argv(&argv) {
        Ok(cmd) => cmd,
        Err(e) => return Some(Err(e.to_string())),
    };
    cmd.current_dir(cwd);

    let output = match run_bounded("syntax-check", cmd, timeout, cancel) {
        Ok(output) => output,
        Err(e) => return Some(Err(e.to_string())),
    };
    match output.status {
        ProcessStatus::NotFound => {
            warn!(program = %argv[0], "syntax checker not found, using built-in checks");
            None
        }
        ProcessStatus::Exited(Some(0)) => Some(Ok(())),
        _ => {
            let detail = output
                .combined()
                .lines()
                .find(|l| !l.trim().is_empty())
                .unwrap_or_default()
                .trim()
                .to_string();
            Some(Err(if detail.is_empty() {
                output.describe("syntax-check")
            } else {
                detail
            }))
        }
    }
}

static JS_IMPORT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r#"(?:\bimport\s+(?:[\w*{}\s,$]+\s+from\s+)?|\bexport\s+[\w*{}\s,$]+\s+from\s+|\brequire\s*\(\s*|\bimport\s*\(\s*)['"](\.{1,2}/[^'"]+)['"]"#,
    )
    .ok()
});

static RUST_MOD: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?mod\s+([A-Za-z_][A-Za-z0-9_]*)\s*;").ok()
});

const JS_SUFFIXES: &[&str] = &[
    "", ".js", ".mjs", ".cjs", ".jsx", ".ts", ".tsx", ".json", "/index.js", "/index.ts",
];

/// Join `rel` onto `base` lexically, refusing to climb above the root.
fn join_within(base: &Path, rel: &str) -> Option<PathBuf> {
    let mut out = base.to_path_buf();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            _ => return None,
        }
    }
    Some(out)
}

/// Relative imports and module declarations in `file` that do not resolve to
/// a file inside `root`.
pub fn unresolved_imports(root: &Path, file: &str, content: &str) -> Vec<String> {
    let Ok(rel) = normalize_rel_path(file) else {
        return Vec::new();
    };
    let dir = rel.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut missing = Vec::new();

    match Lang::of(file) {
        Lang::JavaScript => {
            let Some(re) = JS_IMPORT.as_ref() else {
                return missing;
            };
            let code = mask_comments(content, Lang::JavaScript);
            for caps in re.captures_iter(&code) {
                let Some(m) = caps.get(1) else { continue };
                // spans are shared between code and content
                let spec = &content[m.start()..m.end()];
                let resolved = join_within(&dir, spec).is_some_and(|target| {
                    JS_SUFFIXES.iter().any(|suffix| {
                        let candidate = format!("{}{}", target.to_string_lossy(), suffix);
                        root.join(candidate).is_file()
                    })
                });
                if !resolved {
                    missing.push(spec.to_string());
                }
            }
        }
        Lang::Rust => {
            let Some(re) = RUST_MOD.as_ref() else {
                return missing;
            };
            let stem = rel.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            let mod_dir = if matches!(stem, "lib" | "main" | "mod") {
                dir.clone()
            } else {
                dir.join(stem)
            };
            let code = mask_comments(content, Lang::Rust);
            for caps in re.captures_iter(&code) {
                let Some(m) = caps.get(1) else { continue };
                let name = m.as_str();
                let flat = root.join(&mod_dir).join(format!("{}.rs", name));
                let nested = root.join(&mod_dir).join(name).join("mod.rs");
                if !flat.is_file() && !nested.is_file() {
                    missing.push(format!("mod {}", name));
                }
            }
        }
        _ => {}
    }

    if !missing.is_empty() {
        debug!(file, missing = ?missing, "unresolved imports");
    }
    missing
}

/// Replace comment bytes with spaces, keeping offsets.
fn mask_comments(content: &str, lang: Lang) -> String {
    let mut masked: Vec<u8> = content
        .bytes()
        .map(|b| if b == b'\n' { b'\n' } else { b' ' })
        .collect();
    for (pos, c) in scan(content, lang, true) {
        let len = c.len_utf8();
        masked[pos..pos + len].copy_from_slice(&content.as_bytes()[pos..pos + len]);
    }
    String::from_utf8_lossy(&masked).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lang_detection() {
        assert_eq!(Lang::of("src/app.ts"), Lang::JavaScript);
        assert_eq!(Lang::of("src/lib.rs"), Lang::Rust);
        assert_eq!(Lang::of("Cargo.toml"), Lang::Toml);
        assert_eq!(Lang::of("README.md"), Lang::Other);
    }

    #[test]
    fn test_delimiters_ignore_strings_and_comments() {
        let js = "function f() {\n  const s = '}';\n  // )\n  /* ] */\n  return `{${s}`;\n}\n";
        assert!(check_delimiters(js, Lang::JavaScript).is_ok());

        let rs = "fn f<'a>(x: &'a str) -> char {\n    let c = '{';\n    c\n}\n";
        assert!(check_delimiters(rs, Lang::Rust).is_ok());

        let py = "def f():\n    s = \"\"\"(\n\"\"\"  # )\n    return [s]\n";
        assert!(check_delimiters(py, Lang::Python).is_ok());
    }

    #[test]
    fn test_delimiter_errors_report_line() {
        let err = check_delimiters("function f() {\n  if (x) {\n}\n", Lang::JavaScript).unwrap_err();
        assert!(err.contains("unclosed '{'"), "{}", err);
        assert!(err.contains("line 1"), "{}", err);

        let err = check_delimiters("a)\n", Lang::CLike).unwrap_err();
        assert!(err.contains("unexpected ')'"));
    }

    #[test]
    fn test_builtin_structured_formats() {
        assert!(builtin_syntax_check("a.json", "{\"a\": 1}").is_ok());
        assert!(builtin_syntax_check("a.json", "{\"a\": }").is_err());
        assert!(builtin_syntax_check("a.toml", "[package]\nname = \"x\"\n").is_ok());
        assert!(builtin_syntax_check("a.toml", "name = ").is_err());
        assert!(builtin_syntax_check("a.kdl", "node \"x\" {\n  child 1\n}\n").is_ok());
        assert!(builtin_syntax_check("a.kdl", "node {").is_err());
        assert!(builtin_syntax_check("notes.md", "(((").is_ok());
    }

    #[test]
    fn test_unresolved_js_imports() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("src/util")).unwrap();
        fs::write(temp.path().join("src/util/index.js"), "").unwrap();
        fs::write(temp.path().join("src/db.ts"), "").unwrap();

        let content = "import util from './util';\nimport { q } from './db';\nconst x = require('./missing');\nconst fs = require('fs');\n// import y from './commented';\n";
        let missing = unresolved_imports(temp.path(), "src/app.js", content);
        assert_eq!(missing, vec!["./missing"]);
    }

    #[test]
    fn test_imports_cannot_escape_root() {
        let temp = TempDir::new().unwrap();
        let missing = unresolved_imports(temp.path(), "app.js", "import x from '../../etc/passwd';");
        assert_eq!(missing.len(), 1);
    }

    #[test]
    fn test_unresolved_rust_mods() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("src/net")).unwrap();
        fs::write(temp.path().join("src/config.rs"), "").unwrap();
        fs::write(temp.path().join("src/net/mod.rs"), "").unwrap();

        let content = "mod config;\npub mod net;\npub(crate) mod gone;\nmod inline { }\n";
        let missing = unresolved_imports(temp.path(), "src/lib.rs", content);
        assert_eq!(missing, vec!["mod gone"]);
    }
}
