//! # Stage: Candidate Synthesizer
//!
//! ## Responsibility
//! Expand a [`SynthParams`] tuple into the source of a summarizer-shaped
//! function `(text, max_len)` in the sandbox language, and draw tuples from
//! the meta-policy's current choice sets.
//!
//! ## Guarantees
//! - Deterministic: identical params always render identical source
//! - Clean: every rendered source passes the sandbox deny-list and compiles
//! - Bounded output: head and tail are taken as fractions of `max_len`
//!
//! ## NOT Responsible For
//! - Deciding which params to try (meta-policy) or whether they are any good
//!   (evaluator)

use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::meta_policy::MetaPolicyState;

/// Salient terms a candidate may carry over into a truncated head.
pub const KEYWORD_PATTERN: &str =
    r"(?i)\b(?:goal|error|risk|safety|truth|deadline|objectif|erreur|sécurité|vérité)\b";

/// Share of `max_len` the joined keywords may occupy before they are dropped.
const KEYWORD_BUDGET: f64 = 0.15;
/// Hard cap on the head once keywords are appended.
const KEYWORD_HEAD_CAP: f64 = 0.8;

pub const DEFAULT_HEAD: f64 = 0.65;
pub const DEFAULT_TAIL: f64 = 0.25;

// ---------------------------------------------------------------------------
// SynthParams
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SynthParams {
    pub head_fraction: f64,
    pub tail_fraction: f64,
    pub normalize_whitespace: bool,
    pub keep_keywords: bool,
}

impl Default for SynthParams {
    fn default() -> Self {
        Self {
            head_fraction: DEFAULT_HEAD,
            tail_fraction: DEFAULT_TAIL,
            normalize_whitespace: true,
            keep_keywords: false,
        }
    }
}

impl fmt::Display for SynthParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "head={:.2} tail={:.2} normalize={} keywords={}",
            self.head_fraction, self.tail_fraction, self.normalize_whitespace, self.keep_keywords
        )
    }
}

// ---------------------------------------------------------------------------
// Synthesizer
// ---------------------------------------------------------------------------

/// Renders candidate source for a skill. Swappable so tests can feed the
/// trial loop hostile or broken candidates.
pub trait Synthesizer: Send + Sync {
    fn generate(&self, function_name: &str, params: &SynthParams) -> String;
}

/// The production head/tail template.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateSynthesizer;

impl Synthesizer for TemplateSynthesizer {
    fn generate(&self, function_name: &str, params: &SynthParams) -> String {
        let mut src = String::new();
        src.push_str(&format!("# candidate {params}\n"));
        src.push_str(&format!("fn {function_name}(text, max_len)\n"));
        src.push_str("  let t = trim(text)\n");
        if params.normalize_whitespace {
            src.push_str("  t = collapse_ws(t)\n");
        }
        src.push_str("  if len(t) <= max_len\n    return t\n  end\n");
        src.push_str(&format!(
            "  let head = trim_end(take(t, floor(max_len * {:.2})))\n",
            params.head_fraction
        ));
        src.push_str(&format!(
            "  let tail = trim_start(last(t, floor(max_len * {:.2})))\n",
            params.tail_fraction
        ));
        if params.keep_keywords {
            src.push_str(&format!("  let kws = find_all(t, \"{KEYWORD_PATTERN}\")\n"));
            src.push_str("  let joined = join(kws, \" \")\n");
            src.push_str(&format!(
                "  if len(kws) > 0 and len(joined) < floor(max_len * {KEYWORD_BUDGET:.2})\n"
            ));
            src.push_str(&format!(
                "    head = take(trim(head + \" \" + joined), floor(max_len * {KEYWORD_HEAD_CAP:.2}))\n"
            ));
            src.push_str("  end\n");
        }
        src.push_str("  return head + \" … \" + tail\nend\n");
        src
    }
}

/// Draw one parameter tuple from the policy's choice sets and flag
/// probabilities. Empty choice sets fall back to the defaults.
pub fn sample_params<R: Rng + ?Sized>(policy: &MetaPolicyState, rng: &mut R) -> SynthParams {
    let head_fraction = policy.head_choices.choose(rng).copied().unwrap_or(DEFAULT_HEAD);
    let tail_fraction = policy.tail_choices.choose(rng).copied().unwrap_or(DEFAULT_TAIL);
    SynthParams {
        head_fraction,
        tail_fraction,
        normalize_whitespace: rng.gen_bool(policy.normalize_prob.clamp(0.0, 1.0)),
        keep_keywords: rng.gen_bool(policy.keywords_prob.clamp(0.0, 1.0)),
    }
}
