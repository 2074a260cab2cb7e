//! Expression classification and the per-record rewrite
//!
//! Clients write expressions against a collection (an array of records).
//! Streaming evaluation feeds records one at a time, so a collection-shaped
//! expression is rewritten into its per-record variant first.
//!
//! # Rewrite rules
//!
//! Exactly one rule applies, checked in this order; the first match wins and
//! the result is not rewritten again.
//!
//! | Rule | Input | Per-record variant |
//! |------|-------|--------------------|
//! | [`RewriteRule::IterationPipe`] | `.[] \| F` (also `.[]? \| F`) | `F` |
//! | [`RewriteRule::IterationPath`] | `.[].a.b \| F`, `.[]["k"]` | `.a.b \| F`, `.["k"]` |
//! | [`RewriteRule::BareIteration`] | `.[]` | `.` |
//! | [`RewriteRule::MapWrapper`] | `map(F)` spanning the whole expression | `F` |
//! | [`RewriteRule::CollectWrapper`] | `[.[] \| F]` spanning the whole expression | `F` |
//! | [`RewriteRule::Unchanged`] | anything else | unchanged |
//!
//! `IterationPath` requires the path to be followed by nothing or a pipe, so
//! `.[].a, .b` or `.[].a // 0` stay unchanged. Wrapper rules produce a
//! stream of values where the collection form produced one array.
//!
//! # Classification
//!
//! Checked in order:
//!
//! 1. Empty or `.`: per-record.
//! 2. The iteration rules above: per-record. Pipes bind loosest, so whatever
//!    follows `.[] |` already runs once per record.
//! 3. Starts with a `.field` access: per-record (it cannot apply to an array).
//! 4. Contains an [`AGGREGATION_KEYWORDS`] identifier anywhere: aggregating.
//! 5. Starts with `select(` or an object constructor, and never indexes its
//!    own input with `.[`: per-record. `{ids: [.[].id]}` stays aggregating.
//! 6. Anything else: aggregating.
//!
//! Ambiguous shapes fall through to aggregating, which is always correct for a
//! collection-shaped expression, only slower.

use serde::{Deserialize, Serialize};

use super::lexer::{matching_close, tokenize, Token, TokenKind};

/// Identifiers that make an expression whole-collection
pub const AGGREGATION_KEYWORDS: &[&str] = &[
    "group_by", "sort", "sort_by", "unique", "unique_by", "min", "min_by", "max", "max_by",
    "add", "length", "reduce", "foreach", "map", "first", "last", "nth", "limit", "flatten",
    "transpose", "reverse", "any", "all", "keys", "to_entries", "join", "combinations",
    "indices", "index", "rindex",
];

/// Execution strategy for an expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// Evaluated record by record; results are a union
    PerRecord,
    /// Evaluated once over every record materialized together
    Aggregating,
}

/// The rule a rewrite applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteRule {
    /// `.[] | F` to `F`
    IterationPipe,
    /// `.[].path | F` to `.path | F`
    IterationPath,
    /// `.[]` to `.`
    BareIteration,
    /// `map(F)` to `F`
    MapWrapper,
    /// `[.[] | F]` to `F`
    CollectWrapper,
    /// No rule matched
    Unchanged,
}

/// Per-record variant of an expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    /// Expression to run against each record
    pub expression: String,
    /// Rule that produced it
    pub rule: RewriteRule,
}

/// Rewrite a collection-shaped expression for per-record evaluation
#[must_use]
pub fn per_record_variant(expression: &str) -> Rewrite {
    let source = expression.trim();
    let tokens = tokenize(source);

    if let Some((rule, rest)) = strip_iteration(source, &tokens) {
        return Rewrite {
            expression: rest,
            rule,
        };
    }

    if let Some(inner) = whole_call(source, &tokens, "map") {
        return Rewrite {
            expression: inner.to_string(),
            rule: RewriteRule::MapWrapper,
        };
    }

    if tokens.first().is_some_and(|t| t.is_punct('['))
        && matching_close(&tokens, 0) == Some(tokens.len() - 1)
    {
        let inner_tokens = &tokens[1..tokens.len() - 1];
        if let Some((RewriteRule::IterationPipe, rest)) = strip_iteration(source, inner_tokens) {
            return Rewrite {
                expression: rest,
                rule: RewriteRule::CollectWrapper,
            };
        }
    }

    Rewrite {
        expression: source.to_string(),
        rule: RewriteRule::Unchanged,
    }
}

/// Classify an expression; see the module docs for the rules
#[must_use]
pub fn classify(expression: &str) -> QueryKind {
    let source = expression.trim();
    let tokens = tokenize(source);

    if tokens.is_empty() || (tokens.len() == 1 && tokens[0].is_punct('.')) {
        return QueryKind::PerRecord;
    }
    if strip_iteration(source, &tokens).is_some() {
        return QueryKind::PerRecord;
    }
    if matches!(tokens[0].kind, TokenKind::Field(_)) {
        return QueryKind::PerRecord;
    }
    let aggregating = tokens.iter().any(|t| match &t.kind {
        TokenKind::Ident(name) => AGGREGATION_KEYWORDS.contains(&name.as_str()),
        _ => false,
    });
    if aggregating {
        return QueryKind::Aggregating;
    }
    let select_first =
        tokens[0].is_ident("select") && tokens.get(1).is_some_and(|t| t.is_punct('('));
    if (select_first || tokens[0].is_punct('{')) && !indexes_input(&tokens) {
        return QueryKind::PerRecord;
    }
    QueryKind::Aggregating
}

/// Whether `.[` appears anywhere, iterating or indexing the input itself
fn indexes_input(tokens: &[Token]) -> bool {
    tokens
        .windows(2)
        .any(|pair| pair[0].is_punct('.') && pair[1].is_punct('['))
}

/// Match `.[]` (optionally `?`) at the front of `tokens`
///
/// Returns the rule and the remaining expression text.
fn strip_iteration(source: &str, tokens: &[Token]) -> Option<(RewriteRule, String)> {
    let [dot, open, close, rest @ ..] = tokens else {
        return None;
    };
    if !(dot.is_punct('.') && open.is_punct('[') && close.is_punct(']')) {
        return None;
    }
    let rest = match rest.first() {
        Some(t) if t.is_op("?") => &rest[1..],
        _ => rest,
    };
    let tail_end = tokens.last().map_or(source.len(), |t| t.end);

    let Some(first) = rest.first() else {
        return Some((RewriteRule::BareIteration, ".".to_string()));
    };

    if first.is_op("|") {
        let after = rest.get(1)?;
        return Some((
            RewriteRule::IterationPipe,
            source[after.start..tail_end].trim().to_string(),
        ));
    }

    // Path continuation: fields, brackets, optional markers, `."quoted"`
    let mut idx = 0;
    while let Some(token) = rest.get(idx) {
        match &token.kind {
            TokenKind::Field(_) => idx += 1,
            TokenKind::Op(op) if op == "?" => idx += 1,
            TokenKind::Punct('[') => idx = matching_close(rest, idx)? + 1,
            TokenKind::Punct('.')
                if matches!(rest.get(idx + 1).map(|t| &t.kind), Some(TokenKind::Str(_))) =>
            {
                idx += 2;
            }
            _ => break,
        }
    }
    if idx == 0 {
        return None;
    }
    match rest.get(idx) {
        None => {}
        Some(t) if t.is_op("|") => {}
        Some(_) => return None,
    }

    let path = &source[first.start..tail_end];
    let variant = if first.is_punct('[') {
        format!(".{path}")
    } else {
        path.to_string()
    };
    Some((RewriteRule::IterationPath, variant))
}

/// Inner text of `name(...)` when the call spans all of `tokens`
fn whole_call<'a>(source: &'a str, tokens: &[Token], name: &str) -> Option<&'a str> {
    let [head, open, ..] = tokens else {
        return None;
    };
    if !head.is_ident(name) || !open.is_punct('(') {
        return None;
    }
    let close = matching_close(tokens, 1)?;
    if close != tokens.len() - 1 {
        return None;
    }
    Some(source[open.end..tokens[close].start].trim())
}
