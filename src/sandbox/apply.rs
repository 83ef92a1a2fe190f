//! Replays planned operations against a tree.
//!
//! Each [`OperationKind`] has one handler. Source-rewriting strategies
//! (error wrapping, retry loops, error message enrichment) understand
//! JavaScript/TypeScript only; other files are skipped with a warning.

use crate::models::{InsertPosition, OperationKind, PlannedOperation};
use crate::sandbox::checks::{Lang, code_chars};
use crate::storage::normalize_rel_path;
use crate::{Error, Result};
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

/// What happened to one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Not applied, with the reason as a warning
    Skipped(String),
}

fn read(path: &Path, rel: &str) -> Result<String> {
    fs::read_to_string(path).map_err(|e| Error::InvalidInput(format!("cannot read {}: {}", rel, e)))
}

/// Apply one operation to the tree rooted at `root`.
pub fn apply_operation(root: &Path, op: &PlannedOperation) -> Result<ApplyOutcome> {
    let rel = normalize_rel_path(&op.file)?;
    let path = root.join(&rel);
    let file = op.file.as_str();

    match &op.kind {
        OperationKind::CreateFile { content } => {
            if path.exists() {
                return Err(Error::InvalidInput(format!("{} already exists", file)));
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, content)?;
        }
        OperationKind::DeleteFile => {
            if !path.is_file() {
                return Err(Error::NotFound(file.to_string()));
            }
            fs::remove_file(&path)?;
        }
        OperationKind::Replace { find, replace, all } => {
            let content = read(&path, file)?;
            if find.is_empty() || !content.contains(find.as_str()) {
                return Err(Error::InvalidInput(format!("text to replace not found in {}", file)));
            }
            let updated = if *all {
                content.replace(find.as_str(), replace)
            } else {
                content.replacen(find.as_str(), replace, 1)
            };
            fs::write(&path, updated)?;
        }
        OperationKind::Insert {
            text,
            anchor,
            position,
        } => {
            let content = read(&path, file)?;
            let updated = insert(&content, text, anchor.as_deref(), *position)
                .map_err(|e| Error::InvalidInput(format!("{}: {}", file, e)))?;
            fs::write(&path, updated)?;
        }
        OperationKind::WrapErrorHandling { function } => {
            return rewrite_js(&path, file, |content| wrap_error_handling(content, function));
        }
        OperationKind::AddRetry { function, attempts } => {
            return rewrite_js(&path, file, |content| add_retry(content, function, *attempts));
        }
        OperationKind::EnrichErrorMessages => {
            return rewrite_js(&path, file, |content| enrich_error_messages(content, file));
        }
        OperationKind::Unsupported => {
            return Ok(ApplyOutcome::Skipped(format!(
                "Unsupported operation type for {} skipped",
                file
            )));
        }
    }
    Ok(ApplyOutcome::Applied)
}

/// Run a JS-only rewrite. `Ok(None)` from the rewrite means nothing to do.
fn rewrite_js<F>(path: &Path, file: &str, rewrite: F) -> Result<ApplyOutcome>
where
    F: FnOnce(&str) -> std::result::Result<Option<String>, String>,
{
    if Lang::of(file) != Lang::JavaScript {
        return Ok(ApplyOutcome::Skipped(format!(
            "Source rewrite not supported for {}",
            file
        )));
    }
    let content = read(path, file)?;
    match rewrite(&content) {
        Ok(Some(updated)) => {
            fs::write(path, updated)?;
            Ok(ApplyOutcome::Applied)
        }
        Ok(None) => Ok(ApplyOutcome::Skipped(format!("Nothing to rewrite in {}", file))),
        Err(e) => Err(Error::InvalidInput(format!("{}: {}", file, e))),
    }
}

fn insert(
    content: &str,
    text: &str,
    anchor: Option<&str>,
    position: InsertPosition,
) -> std::result::Result<String, String> {
    match position {
        InsertPosition::Start => Ok(format!("{}{}", text, content)),
        InsertPosition::End => {
            let sep = if content.is_empty() || content.ends_with('\n') {
                ""
            } else {
                "\n"
            };
            Ok(format!("{}{}{}", content, sep, text))
        }
        InsertPosition::BeforeAnchor | InsertPosition::AfterAnchor => {
            let anchor = anchor.ok_or("insert position requires an anchor")?;
            let idx = content
                .find(anchor)
                .ok_or_else(|| format!("anchor '{}' not found", anchor))?;
            let at = if position == InsertPosition::BeforeAnchor {
                idx
            } else {
                idx + anchor.len()
            };
            Ok(format!("{}{}{}", &content[..at], text, &content[at..]))
        }
    }
}

/// Byte offsets of the opening and closing braces of `name`'s body.
pub fn find_function_body(content: &str, name: &str) -> Option<(usize, usize)> {
    let name = regex::escape(name);
    let patterns = [
        format!(r"\bfunction\s*\*?\s*{}\s*\(", name),
        format!(r"\b{}\s*[:=]\s*(?:async\s+)?function\b", name),
        format!(r"\b{}\s*[:=]\s*(?:async\s+)?(?:\([^)]*\)|[A-Za-z_$][\w$]*)\s*=>", name),
        format!(r"(?m)^\s*(?:(?:static|async|public|private|protected)\s+)*{}\s*\(", name),
    ];

    let code = code_chars(content, Lang::JavaScript);
    let is_code = |pos: usize| code.binary_search_by_key(&pos, |&(p, _)| p).is_ok();

    for pattern in &patterns {
        let Ok(re) = Regex::new(pattern) else { continue };
        for m in re.find_iter(content) {
            let start = m.start() + (m.as_str().len() - m.as_str().trim_start().len());
            if !is_code(start) {
                continue;
            }
            if let Some(body) = body_after(&code, start) {
                return Some(body);
            }
        }
    }
    None
}

/// First `{` at paren depth zero from `from` on, and its matching `}`.
fn body_after(code: &[(usize, char)], from: usize) -> Option<(usize, usize)> {
    let first = code.partition_point(|&(p, _)| p < from);
    let mut parens: i32 = 0;
    let mut open = None;
    let mut depth = 0usize;

    for &(pos, c) in &code[first..] {
        match open {
            None => match c {
                '(' => parens += 1,
                ')' => parens -= 1,
                ';' if parens <= 0 => return None,
                '{' if parens <= 0 => {
                    open = Some(pos);
                    depth = 1;
                }
                _ => {}
            },
            Some(start) => match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some((start, pos));
                    }
                }
                _ => {}
            },
        }
    }
    None
}

fn indent_of(content: &str, pos: usize) -> String {
    let line_start = content[..pos].rfind('\n').map(|i| i + 1).unwrap_or(0);
    content[line_start..]
        .chars()
        .take_while(|c| *c == ' ' || *c == '\t')
        .collect()
}

fn reindent(body: &str, extra: &str) -> String {
    body.trim_matches('\n')
        .lines()
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else {
                format!("{}{}", extra, line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn wrap_body<F>(
    content: &str,
    function: &str,
    build: F,
) -> std::result::Result<Option<String>, String>
where
    F: FnOnce(&str, &str) -> Option<String>,
{
    let (open, close) = find_function_body(content, function)
        .ok_or_else(|| format!("function '{}' not found", function))?;
    let indent = indent_of(content, open);
    let body = &content[open + 1..close];
    let Some(new_body) = build(body, &indent) else {
        return Ok(None);
    };
    Ok(Some(format!(
        "{}{{\n{}\n{}}}{}",
        &content[..open],
        new_body,
        indent,
        &content[close + 1..]
    )))
}

fn wrap_error_handling(
    content: &str,
    function: &str,
) -> std::result::Result<Option<String>, String> {
    wrap_body(content, function, |body, indent| {
        if body.trim_start().starts_with("try {") || body.trim_start().starts_with("try{") {
            return None;
        }
        let inner = format!("{}  ", indent);
        Some(format!(
            "{inner}try {{\n{body}\n{inner}}} catch (error) {{\n{inner}  console.error('Error in {function}:', error);\n{inner}  throw error;\n{inner}}}",
            inner = inner,
            body = reindent(body, "  "),
            function = function,
        ))
    })
}

fn add_retry(
    content: &str,
    function: &str,
    attempts: u32,
) -> std::result::Result<Option<String>, String> {
    let attempts = attempts.max(1);
    wrap_body(content, function, |body, indent| {
        if body.contains("__attempt") {
            return None;
        }
        let inner = format!("{}  ", indent);
        let (call, arrow) = if body.contains("await") {
            ("return await", "async () =>")
        } else {
            ("return", "() =>")
        };
        Some(format!(
            "{inner}let __lastError;\n\
             {inner}for (let __attempt = 1; __attempt <= {attempts}; __attempt++) {{\n\
             {inner}  try {{\n\
             {inner}    {call} ({arrow} {{\n{body}\n{inner}    }})();\n\
             {inner}  }} catch (error) {{\n\
             {inner}    __lastError = error;\n\
             {inner}  }}\n\
             {inner}}}\n\
             {inner}throw __lastError;",
            inner = inner,
            attempts = attempts,
            call = call,
            arrow = arrow,
            body = reindent(body, "      "),
        ))
    })
}

static ERROR_CTOR: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"\bnew\s+((?:[A-Z]\w*)?Error)\(\s*(["'`])((?:\\.|[^\\])*?)(["'`])"#).ok()
});

fn enrich_error_messages(
    content: &str,
    file: &str,
) -> std::result::Result<Option<String>, String> {
    let re = ERROR_CTOR
        .as_ref()
        .ok_or_else(|| "error pattern unavailable".to_string())?;
    let code = code_chars(content, Lang::JavaScript);
    let is_code = |pos: usize| code.binary_search_by_key(&pos, |&(p, _)| p).is_ok();

    let mut out = String::with_capacity(content.len());
    let mut last = 0;
    let mut changed = 0;

    for caps in re.captures_iter(content) {
        let (Some(whole), Some(open), Some(msg), Some(close)) =
            (caps.get(0), caps.get(2), caps.get(3), caps.get(4))
        else {
            continue;
        };
        if open.as_str() != close.as_str() || !is_code(whole.start()) {
            continue;
        }
        let context = format!("[{}:", file);
        if msg.as_str().contains(&context) {
            continue;
        }
        let line = content[..whole.start()].matches('\n').count() + 1;
        out.push_str(&content[last..close.start()]);
        out.push_str(&format!(" [{}:{}]", file, line));
        last = close.start();
        changed += 1;
    }

    if changed == 0 {
        return Ok(None);
    }
    out.push_str(&content[last..]);
    Ok(Some(out))
}
