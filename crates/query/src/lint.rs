use regex::Regex;
use std::sync::LazyLock;

use extract::is_identifier;

static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"'(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*""#).expect("valid regex"));
static WRITE_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|[^.\w`])(CREATE|MERGE|DELETE|DETACH|SET|REMOVE|DROP|FOREACH|LOAD\s+CSV)\b")
        .expect("valid regex")
});
/// `(var:A|B&!C word` with the label expression in group 1 and an optional
/// bare word after it in group 2. Each name runs up to whitespace, a label
/// operator, or the end of the node.
static NODE_LABELS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\(\s*(?:[A-Za-z_][A-Za-z0-9_]*)?\s*:\s*(!?(?:`[^`]*`|[^\s)\{:|&!`])+(?:\s*[:|&!]\s*!?(?:`[^`]*`|[^\s)\{:|&!`])+)*)(?:\s+([A-Za-z_][A-Za-z0-9_]*))?",
    )
    .expect("valid regex")
});
static REL_TYPES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\[\s*(?:[A-Za-z_][A-Za-z0-9_]*)?\s*:\s*(!?(?:`[^`]*`|[^\s\]\{\*:|&!`])+(?:\s*[:|&!]\s*!?(?:`[^`]*`|[^\s\]\{\*:|&!`])+)*)(?:\s+([A-Za-z_][A-Za-z0-9_]*))?",
    )
    .expect("valid regex")
});

/// Words that may follow a label check inside a parenthesised predicate,
/// as in `WHERE (n:Disease OR n:Symptom)` or `(n:Disease WHERE n.x > 1)`.
const OPERATOR_WORDS: &[&str] = &["AND", "OR", "XOR", "WHERE", "IS", "IN", "CONTAINS", "STARTS", "ENDS", "THEN"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LintError {
    #[error("query contains a write clause: {0}")]
    WriteClause(String),
    #[error("malformed node label: {0:?}")]
    MalformedLabel(String),
    #[error("malformed relationship type: {0:?}")]
    MalformedRelationshipType(String),
}

/// Pre-flight check on generated queries. Only read queries pass, and every
/// label and relationship type in a pattern must be a plain identifier or
/// backtick-quoted. Whether the names exist in the schema is left to the
/// database.
pub fn lint(query: &str) -> Result<(), LintError> {
    let stripped = STRING_LITERAL.replace_all(query, "''");

    if let Some(clause) = WRITE_CLAUSE.captures(&stripped).and_then(|c| c.get(1)) {
        return Err(LintError::WriteClause(clause.as_str().to_uppercase()));
    }

    for caps in NODE_LABELS.captures_iter(&stripped) {
        check_names(&caps, LintError::MalformedLabel)?;
    }
    for caps in REL_TYPES.captures_iter(&stripped) {
        check_names(&caps, LintError::MalformedRelationshipType)?;
    }

    Ok(())
}

fn check_names(caps: &regex::Captures<'_>, malformed: fn(String) -> LintError) -> Result<(), LintError> {
    let expr = &caps[1];
    // An unquoted multi-word name such as `Clinical Trial`.
    if let Some(word) = caps.get(2).map(|m| m.as_str()) {
        if !OPERATOR_WORDS.iter().any(|w| w.eq_ignore_ascii_case(word)) {
            return Err(malformed(format!("{expr} {word}")));
        }
    }
    match names(expr).into_iter().find(|name| !well_formed(name)) {
        Some(name) => Err(malformed(name.to_string())),
        None => Ok(()),
    }
}

/// Split a label expression on `:`, `|`, `&` and `!`, leaving
/// backtick-quoted names whole.
fn names(expr: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (i, c) in expr.char_indices() {
        match c {
            '`' => quoted = !quoted,
            ':' | '|' | '&' | '!' if !quoted => {
                out.push(&expr[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    out.push(&expr[start..]);
    out.into_iter().map(str::trim).filter(|s| !s.is_empty()).collect()
}

fn well_formed(name: &str) -> bool {
    if let Some(inner) = name.strip_prefix('`').and_then(|n| n.strip_suffix('`')) {
        return !inner.is_empty() && !inner.contains('`');
    }
    is_identifier(name)
}
