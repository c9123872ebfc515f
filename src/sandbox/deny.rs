//! Static deny-list applied to candidate source before parsing.
//!
//! The language has no I/O at all, so these rules are a tripwire for sources
//! that were clearly not produced by the synthesizer. The nested-quantifier
//! scan is also used at run time on patterns built by the candidate.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Why a source was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DenyReason {
    #[error("dynamic import")]
    DynamicImport,
    #[error("filesystem access: {0}")]
    FileAccess(String),
    #[error("dunder identifier: {0}")]
    DunderIdentifier(String),
    #[error("process or network primitive: {0}")]
    ProcessOrNetwork(String),
    #[error("dynamic evaluation: {0}")]
    DynamicEval(String),
    #[error("nested quantifier in pattern: {0}")]
    NestedQuantifier(String),
}

type Rule = (Regex, fn(&str) -> DenyReason);

static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    let rule = |pattern: &str, build: fn(&str) -> DenyReason| -> Option<Rule> {
        Regex::new(pattern).ok().map(|re| (re, build))
    };
    [
        rule(r"\b(?:import|require)\b", |_| DenyReason::DynamicImport),
        rule(r"__\w+__", |m| DenyReason::DunderIdentifier(m.to_string())),
        rule(r"\b(?:open|fopen|read_file|write_file|remove_file)\s*\(", |m| {
            DenyReason::FileAccess(m.trim_end_matches(['(', ' ']).to_string())
        }),
        rule(
            r"\b(?:subprocess|socket|popen|fork|spawn|system|process|Command|connect)\b",
            |m| DenyReason::ProcessOrNetwork(m.to_string()),
        ),
        rule(r"\b(?:exec|eval|compile|globals|locals|getattr|setattr)\b", |m| {
            DenyReason::DynamicEval(m.to_string())
        }),
    ]
    .into_iter()
    .flatten()
    .collect()
});

/// First deny-list violation in `source`, if any.
pub fn deny_list_check(source: &str) -> Option<DenyReason> {
    for (re, build) in RULES.iter() {
        if let Some(m) = re.find(source) {
            return Some(build(m.as_str()));
        }
    }
    string_literals(source)
        .into_iter()
        .find(|lit| has_nested_quantifier(lit))
        .map(DenyReason::NestedQuantifier)
}

/// Raw contents of every double-quoted literal, escapes left in place.
/// Text after `#` outside a literal is a comment and is skipped.
fn string_literals(source: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = source.chars();
    while let Some(c) = chars.next() {
        match c {
            '#' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '"' => {
                let mut lit = String::new();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            lit.push('\\');
                            if let Some(next) = chars.next() {
                                lit.push(next);
                            }
                        }
                        '"' => break,
                        other => lit.push(other),
                    }
                }
                out.push(lit);
            }
            _ => {}
        }
    }
    out
}

/// `true` when a quantified group contains another quantifier, e.g. `(a+)+`
/// or `(?:x*y)*`. Escapes and character classes are skipped; the check is
/// deliberately conservative and also flags merely optional nestings.
pub fn has_nested_quantifier(pattern: &str) -> bool {
    let chars: Vec<char> = pattern.chars().collect();
    // One entry per open group: "contains a quantifier somewhere inside".
    let mut stack: Vec<bool> = vec![false];
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let end = (i + 2).min(chars.len());
                i = mark_quantified(&mut stack, &chars, end);
            }
            '[' => {
                let end = skip_class(&chars, i);
                i = mark_quantified(&mut stack, &chars, end);
            }
            '(' => {
                stack.push(false);
                // `(?` introduces flags / non-capturing syntax, not a quantifier.
                i += if chars.get(i + 1) == Some(&'?') { 2 } else { 1 };
            }
            ')' => {
                let inner = stack.pop().unwrap_or(false);
                let (quantified, next) = quantifier_at(&chars, i + 1);
                if quantified && inner {
                    return true;
                }
                if let Some(top) = stack.last_mut() {
                    *top |= inner || quantified;
                } else {
                    stack.push(inner || quantified);
                }
                i = next;
            }
            _ => i = mark_quantified(&mut stack, &chars, i + 1),
        }
    }
    false
}

/// Records a quantifier following the atom that ends at `end` and returns
/// the index after it.
fn mark_quantified(stack: &mut [bool], chars: &[char], end: usize) -> usize {
    let (quantified, next) = quantifier_at(chars, end);
    if quantified {
        if let Some(top) = stack.last_mut() {
            *top = true;
        }
    }
    next
}

/// Index just past a `[...]` class starting at `start`.
fn skip_class(chars: &[char], start: usize) -> usize {
    let mut i = start + 1;
    if chars.get(i) == Some(&'^') {
        i += 1;
    }
    if chars.get(i) == Some(&']') {
        i += 1;
    }
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            ']' => return i + 1,
            _ => i += 1,
        }
    }
    i
}

/// Whether a quantifier starts at `i`, and the index after it (including a
/// lazy/possessive suffix).
fn quantifier_at(chars: &[char], i: usize) -> (bool, usize) {
    let end = match chars.get(i) {
        Some('*') | Some('+') | Some('?') => i + 1,
        Some('{') => match counted_repetition(chars, i) {
            Some(end) => end,
            None => return (false, i),
        },
        _ => return (false, i),
    };
    match chars.get(end) {
        Some('?') | Some('+') => (true, end + 1),
        _ => (true, end),
    }
}

/// `{n}`, `{n,}` or `{n,m}` starting at `i`; returns the index after `}`.
fn counted_repetition(chars: &[char], i: usize) -> Option<usize> {
    let mut j = i + 1;
    let mut digits = 0;
    while j < chars.len() && (chars[j].is_ascii_digit() || chars[j] == ',') {
        if chars[j].is_ascii_digit() {
            digits += 1;
        }
        j += 1;
    }
    (digits > 0 && chars.get(j) == Some(&'}')).then_some(j + 1)
}
