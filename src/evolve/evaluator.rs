//! # Stage: Evaluator
//!
//! ## Responsibility
//! Score output text against a weighted four-dimension rubric, score a
//! whole skill over a sample set, and nudge the weights from user feedback.
//!
//! ## Guarantees
//! - Bounded: every weight stays in `[0.0, 2.0]` after any `learn` call and
//!   after loading a hand-edited `feedback.json`
//! - Complete: a weights file missing a dimension gets that dimension's
//!   default on load
//! - Atomic: learning is one locked read-modify-write of `feedback.json`
//!
//! ## NOT Responsible For
//! - Running skills (callers pass an invoke closure to [`Evaluator::score_samples`])

use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::skills::Sample;
use crate::error::Result;
use crate::store::{Store, Versioned, FEEDBACK_FILE};

pub const WEIGHT_MIN: f64 = 0.0;
pub const WEIGHT_MAX: f64 = 2.0;
pub const LEARN_STEP: f64 = 0.05;
/// Deducted per sample whose output overshoots `max_len` by more than
/// [`OVERSHOOT_SLACK`] characters.
pub const OVERSHOOT_PENALTY: f64 = 0.5;
pub const OVERSHOOT_SLACK: usize = 50;

static SENTENCE_BOUNDARY: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"[.!?]\s+\p{Lu}").ok());
static HEDGES: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:maybe|perhaps|probably|possibly|peut-être|probablement|sans doute)\b").ok()
});

fn matches(re: &Lazy<Option<Regex>>, text: &str) -> bool {
    match &**re {
        Some(r) => r.is_match(text),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Dimension
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    LengthFit,
    LineCount,
    Structure,
    Assurance,
}

impl Dimension {
    pub fn name(self) -> &'static str {
        match self {
            Dimension::LengthFit => "length_fit",
            Dimension::LineCount => "line_count",
            Dimension::Structure => "structure",
            Dimension::Assurance => "assurance",
        }
    }

    pub fn all() -> &'static [Dimension] {
        &[Dimension::LengthFit, Dimension::LineCount, Dimension::Structure, Dimension::Assurance]
    }

    pub fn default_weight(self) -> f64 {
        match self {
            Dimension::LengthFit => 1.0,
            Dimension::LineCount => 0.5,
            Dimension::Structure => 0.5,
            Dimension::Assurance => 0.25,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

pub type Weights = BTreeMap<Dimension, f64>;

pub fn default_weights() -> Weights {
    Dimension::all().iter().map(|d| (*d, d.default_weight())).collect()
}

// ---------------------------------------------------------------------------
// FeedbackLabel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackLabel {
    Approve,
    Reject,
}

impl FeedbackLabel {
    fn delta(self) -> f64 {
        match self {
            FeedbackLabel::Approve => LEARN_STEP,
            FeedbackLabel::Reject => -LEARN_STEP,
        }
    }
}

impl fmt::Display for FeedbackLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FeedbackLabel::Approve => "approve",
            FeedbackLabel::Reject => "reject",
        })
    }
}

// ---------------------------------------------------------------------------
// Persisted weights
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackFile {
    pub schema: u32,
    pub weights: Weights,
    pub ts: Option<String>,
}

impl Default for FeedbackFile {
    fn default() -> Self {
        Self { schema: Self::SCHEMA, weights: default_weights(), ts: None }
    }
}

impl Versioned for FeedbackFile {
    const SCHEMA: u32 = 1;
}

/// Fill missing dimensions with defaults and clamp everything into bounds.
pub fn normalize_weights(weights: &mut Weights) {
    for d in Dimension::all() {
        let w = weights.entry(*d).or_insert_with(|| d.default_weight());
        *w = if w.is_finite() { w.clamp(WEIGHT_MIN, WEIGHT_MAX) } else { d.default_weight() };
    }
}

/// Shift every weight by the label's step, clamped.
pub fn apply_label(weights: &mut Weights, label: FeedbackLabel) {
    normalize_weights(weights);
    for w in weights.values_mut() {
        let next = *w + label.delta();
        *w = ((next * 100.0).round() / 100.0).clamp(WEIGHT_MIN, WEIGHT_MAX);
    }
}

// ---------------------------------------------------------------------------
// EvaluatorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluatorConfig {
    /// Inclusive length window (characters) for the length bonus.
    pub min_len: usize,
    pub max_len: usize,
    /// Newline ceiling for the line-count bonus.
    pub max_lines: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self { min_len: 40, max_len: 1600, max_lines: 40 }
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Evaluator {
    weights: Weights,
    config: EvaluatorConfig,
}

impl Evaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self { weights: default_weights(), config }
    }

    pub fn with_weights(config: EvaluatorConfig, mut weights: Weights) -> Self {
        normalize_weights(&mut weights);
        Self { weights, config }
    }

    pub fn load(store: &Store, config: EvaluatorConfig) -> Self {
        let file: FeedbackFile = store.load_json_or_default(&store.path(FEEDBACK_FILE));
        Self::with_weights(config, file.weights)
    }

    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    pub fn weight(&self, d: Dimension) -> f64 {
        self.weights.get(&d).copied().unwrap_or_else(|| d.default_weight())
    }

    /// Which rubric indicators `text` satisfies.
    pub fn indicators(&self, text: &str) -> Vec<(Dimension, bool)> {
        let chars = text.chars().count();
        let newlines = text.matches('\n').count();
        Dimension::all()
            .iter()
            .map(|d| {
                let hit = match d {
                    Dimension::LengthFit => (self.config.min_len..=self.config.max_len).contains(&chars),
                    Dimension::LineCount => newlines <= self.config.max_lines,
                    Dimension::Structure => {
                        matches(&SENTENCE_BOUNDARY, text) || text.contains(':') || text.contains('—')
                    }
                    Dimension::Assurance => !matches(&HEDGES, text),
                };
                (*d, hit)
            })
            .collect()
    }

    /// Weighted sum of satisfied indicators.
    pub fn score(&self, text: &str) -> f64 {
        self.indicators(text)
            .into_iter()
            .filter(|(_, hit)| *hit)
            .map(|(d, _)| self.weight(d))
            .sum()
    }

    /// Mean output score over `samples`, minus the overshoot penalty per
    /// over-long output. A failed invocation contributes zero.
    pub fn score_samples<F>(&self, samples: &[Sample], mut invoke: F) -> f64
    where
        F: FnMut(&Sample) -> Option<String>,
    {
        if samples.is_empty() {
            return 0.0;
        }
        let mut total = 0.0;
        for sample in samples {
            let Some(out) = invoke(sample) else {
                continue;
            };
            total += self.score(&out);
            let limit = usize::try_from(sample.max_len.max(0)).unwrap_or(usize::MAX);
            if out.chars().count() > limit.saturating_add(OVERSHOOT_SLACK) {
                total -= OVERSHOOT_PENALTY;
            }
        }
        total / samples.len() as f64
    }

    /// Apply one feedback label to the persisted weights and adopt the
    /// result in memory.
    pub fn learn(&mut self, store: &Store, label: FeedbackLabel) -> Result<Weights> {
        let weights = store.update_json(&store.path(FEEDBACK_FILE), |f: &mut FeedbackFile| {
            f.schema = FeedbackFile::SCHEMA;
            apply_label(&mut f.weights, label);
            f.ts = Some(chrono::Utc::now().to_rfc3339());
            f.weights.clone()
        })?;
        info!(target: "evolve::evaluator", %label, "evaluator weights updated");
        self.weights = weights.clone();
        Ok(weights)
    }
}
