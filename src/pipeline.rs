//! # Stage: Request Pipeline
//!
//! ## Responsibility
//! Turn one chat prompt into a reply by running an ordered list of named,
//! capability-typed stages: filter, classify, invoke-skill, mutate-hook,
//! annotate.
//!
//! ## Guarantees
//! - Ordered: stages run in registration order; any stage may halt the turn
//! - Local: every stage is pure text processing plus skill invocation; no
//!   network, no provider calls
//! - Non-blocking: the mutate-hook only flags the turn; the mutation itself
//!   runs off the response path
//!
//! ## NOT Responsible For
//! - Authorizing private mode (the engine downgrades before the pipeline runs)

use std::fmt;

use clap::ValueEnum;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::engine::Engine;
use crate::error::Result;
use crate::evolve::skills::{DEFINE, PLAN, SUMMARIZER};

pub const APP_TAG: &str = "skill-evolver";
pub const REJECTION: &str = "Rejected: the request conflicts with the content policy.";

// ---------------------------------------------------------------------------
// Mode / Intent / Capability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Public,
    Private,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Public => write!(f, "public"),
            Mode::Private => write!(f, "private"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Summarize,
    Define,
    Plan,
    Answer,
}

impl Intent {
    pub fn all() -> &'static [Intent] {
        &[Intent::Summarize, Intent::Define, Intent::Plan, Intent::Answer]
    }

    /// The skill backing this intent, if any.
    pub fn skill(self) -> Option<&'static str> {
        match self {
            Intent::Summarize => Some(SUMMARIZER),
            Intent::Define => Some(DEFINE),
            Intent::Plan => Some(PLAN),
            Intent::Answer => None,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::Summarize => write!(f, "summarize"),
            Intent::Define => write!(f, "define"),
            Intent::Plan => write!(f, "plan"),
            Intent::Answer => write!(f, "answer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Filter,
    Classify,
    Transform,
    Hook,
    Annotate,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Filter => "filter",
            Capability::Classify => "classify",
            Capability::Transform => "transform",
            Capability::Hook => "hook",
            Capability::Annotate => "annotate",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Turn
// ---------------------------------------------------------------------------

/// State threaded through the stages for one prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub prompt: String,
    pub mode: Mode,
    pub intent: Intent,
    /// Skill that produced the draft, if any.
    pub skill: Option<String>,
    pub draft: String,
    pub score: Option<f64>,
    pub cautions: Vec<String>,
    /// Skill the mutate-hook asked to evolve.
    pub mutation_requested: Option<String>,
    pub halted: bool,
    pub output: String,
}

impl Turn {
    pub fn new(prompt: impl Into<String>, mode: Mode) -> Self {
        Self {
            prompt: prompt.into(),
            mode,
            intent: Intent::Answer,
            skill: None,
            draft: String::new(),
            score: None,
            cautions: Vec::new(),
            mutation_requested: None,
            halted: false,
            output: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageFlow {
    Continue,
    Halt,
}

// ---------------------------------------------------------------------------
// Stage trait / Pipeline
// ---------------------------------------------------------------------------

pub trait Stage: Send + Sync {
    fn name(&self) -> &str;
    fn capability(&self) -> Capability;
    fn process(&self, turn: &mut Turn, engine: &Engine) -> Result<StageFlow>;
}

pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.stage_names()).finish()
    }
}

impl Pipeline {
    pub fn empty() -> Self {
        Self { stages: Vec::new() }
    }

    /// filter → classify → invoke-skill → mutate-hook → annotate.
    pub fn standard() -> Self {
        let mut p = Self::empty();
        p.push(Box::new(ContentFilter));
        p.push(Box::new(IntentClassifier));
        p.push(Box::new(SkillInvoker));
        p.push(Box::new(MutationHook));
        p.push(Box::new(Annotator));
        p
    }

    pub fn push(&mut self, stage: Box<dyn Stage>) {
        self.stages.push(stage);
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn run(&self, turn: &mut Turn, engine: &Engine) -> Result<()> {
        for stage in &self.stages {
            trace!(target: "pipeline", stage = stage.name(), capability = %stage.capability(), "stage start");
            if stage.process(turn, engine)? == StageFlow::Halt {
                debug!(target: "pipeline", stage = stage.name(), "turn halted");
                turn.halted = true;
                return Ok(());
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

static BANNED: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\bexplosi(?:f|ve)s?\b",
        r"(?i)\bimprovised\b",
        r"(?i)\bbomb(?:e|s)?\b",
        r"(?i)\bfraude?\b",
        r"(?i)\bmalware\b",
        r"(?i)\bvirus\b",
        r"(?i)\bhack\b",
        r"(?i)\bcarte\s+bleue\b",
        r"(?i)\bporn\w*\b",
        r"(?i)\bviol(?:ence)?\b",
        r"(?i)\bhaine\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Halts prompts matching a banned-content pattern.
pub struct ContentFilter;

impl Stage for ContentFilter {
    fn name(&self) -> &str {
        "filter"
    }

    fn capability(&self) -> Capability {
        Capability::Filter
    }

    fn process(&self, turn: &mut Turn, _engine: &Engine) -> Result<StageFlow> {
        if BANNED.iter().any(|re| re.is_match(&turn.prompt)) {
            turn.output = REJECTION.to_string();
            return Ok(StageFlow::Halt);
        }
        Ok(StageFlow::Continue)
    }
}

const SUMMARIZE_KEYS: &[&str] = &["résume", "resume", "resumer", "summary", "summarize", "summarise", "synthèse", "synthese", "tl;dr"];
const DEFINE_KEYS: &[&str] = &["définis", "definis", "definition", "définition", "c'est quoi", "expliquer", "define", "what is"];
const PLAN_KEYS: &[&str] = &["plan", "étapes", "etapes", "steps", "comment faire", "how to"];

/// Keyword intent detection, first match wins in summarize, define, plan order.
pub fn classify_intent(prompt: &str) -> Intent {
    let t = prompt.to_lowercase();
    let hit = |keys: &[&str]| keys.iter().any(|k| t.contains(k));
    if hit(SUMMARIZE_KEYS) {
        Intent::Summarize
    } else if hit(DEFINE_KEYS) {
        Intent::Define
    } else if hit(PLAN_KEYS) {
        Intent::Plan
    } else {
        Intent::Answer
    }
}

pub struct IntentClassifier;

impl Stage for IntentClassifier {
    fn name(&self) -> &str {
        "classify"
    }

    fn capability(&self) -> Capability {
        Capability::Classify
    }

    fn process(&self, turn: &mut Turn, _engine: &Engine) -> Result<StageFlow> {
        turn.intent = classify_intent(&turn.prompt);
        Ok(StageFlow::Continue)
    }
}

static LABEL_PREFIX: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[^:\n]*:\s*").ok());
static DEFINE_TERM: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)(?:définis|definis|définition|definition|c'est quoi|expliquer|define|what is)\s+(.+)").ok()
});

/// Drop a leading `label:` prefix, e.g. `Summarize this: <text>`.
pub fn strip_label(prompt: &str) -> &str {
    match &*LABEL_PREFIX {
        Some(re) => match re.find(prompt) {
            Some(m) if m.end() < prompt.len() => &prompt[m.end()..],
            _ => prompt,
        },
        None => prompt,
    }
}

/// The term following a definition keyword, or the whole prompt.
pub fn extract_term(prompt: &str) -> &str {
    let re: &Option<Regex> = &DEFINE_TERM;
    re.as_ref()
        .and_then(|re| re.captures(prompt))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(prompt)
}

/// Collapse whitespace and cut at a word boundary so the result, including
/// the ` …` placeholder, fits in `width` characters.
pub fn shorten(text: &str, width: usize) -> String {
    const PLACEHOLDER: &str = " …";
    let words: Vec<&str> = text.split_whitespace().collect();
    let joined = words.join(" ");
    if joined.chars().count() <= width {
        return joined;
    }
    let budget = width.saturating_sub(PLACEHOLDER.chars().count());
    let mut out = String::new();
    for w in words {
        let extra = if out.is_empty() { 0 } else { 1 };
        if out.chars().count() + extra + w.chars().count() > budget {
            break;
        }
        if extra == 1 {
            out.push(' ');
        }
        out.push_str(w);
    }
    if out.is_empty() {
        return PLACEHOLDER.trim_start().to_string();
    }
    out.push_str(PLACEHOLDER);
    out
}

/// Produces the draft with the skill matching the intent.
pub struct SkillInvoker;

impl Stage for SkillInvoker {
    fn name(&self) -> &str {
        "invoke-skill"
    }

    fn capability(&self) -> Capability {
        Capability::Transform
    }

    fn process(&self, turn: &mut Turn, engine: &Engine) -> Result<StageFlow> {
        let max_len = engine.chat_max_chars(turn.mode);
        let prompt = turn.prompt.trim().to_string();
        let input = match turn.intent {
            Intent::Summarize => strip_label(&prompt).to_string(),
            Intent::Define => extract_term(&prompt).to_string(),
            Intent::Plan => prompt.clone(),
            Intent::Answer => {
                turn.draft = shorten(&prompt, usize::try_from(max_len).unwrap_or(0));
                return Ok(StageFlow::Continue);
            }
        };
        if let Some(skill) = turn.intent.skill() {
            turn.draft = engine.run_skill_with(skill, &input, max_len)?;
            turn.skill = Some(skill.to_string());
        }
        Ok(StageFlow::Continue)
    }
}

/// Flags a low-scoring draft for a background mutation of its skill.
pub struct MutationHook;

impl Stage for MutationHook {
    fn name(&self) -> &str {
        "mutate-hook"
    }

    fn capability(&self) -> Capability {
        Capability::Hook
    }

    fn process(&self, turn: &mut Turn, engine: &Engine) -> Result<StageFlow> {
        let score = engine.score_text(&turn.draft);
        turn.score = Some(score);
        let chat = &engine.config().chat;
        if !chat.mutate_hook || score >= chat.mutate_below {
            return Ok(StageFlow::Continue);
        }
        if let Some(skill) = turn.skill.as_deref() {
            if engine.is_mutable(skill) {
                debug!(target: "pipeline", skill, score, "draft below floor, mutation requested");
                turn.mutation_requested = Some(skill.to_string());
            }
        }
        Ok(StageFlow::Continue)
    }
}

static HEDGING: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:maybe|perhaps|probably|possibly|peut-être|probablement|sans doute)\b").ok()
});
static NOVELTY: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:inédit absolu|entièrement nouveau|completely new|never been done|first ever|unprecedented)\b").ok()
});

fn is_match(re: &Lazy<Option<Regex>>, text: &str) -> bool {
    match &**re {
        Some(r) => r.is_match(text),
        None => false,
    }
}

/// `1 - 0.2 * cautions`, clamped to `[0.1, 0.99]`.
pub fn confidence(cautions: usize) -> f64 {
    (1.0 - 0.2 * cautions as f64).clamp(0.1, 0.99)
}

/// Final formatting: trace header in private mode, cautions, confidence.
pub struct Annotator;

impl Stage for Annotator {
    fn name(&self) -> &str {
        "annotate"
    }

    fn capability(&self) -> Capability {
        Capability::Annotate
    }

    fn process(&self, turn: &mut Turn, engine: &Engine) -> Result<StageFlow> {
        if is_match(&HEDGING, &turn.draft) {
            turn.cautions.push("hedged wording; treat the claim as unverified".to_string());
        }
        if is_match(&NOVELTY, &turn.draft) {
            turn.cautions.push("absolute novelty claimed; originality is likely, not guaranteed".to_string());
        }

        let mut out = String::new();
        if turn.mode == Mode::Private {
            let fingerprint = turn
                .skill
                .as_deref()
                .and_then(|s| engine.skill_fingerprint(s))
                .unwrap_or_else(|| "none".to_string());
            out.push_str(&format!(
                "[{APP_TAG}] mode=private intent={} skill={} fingerprint={fingerprint}\n\n",
                turn.intent,
                turn.skill.as_deref().unwrap_or("-"),
            ));
        }
        out.push_str(turn.draft.trim());
        for c in &turn.cautions {
            out.push_str(&format!("\n- Caution: {c}"));
        }
        if turn.mode == Mode::Private {
            out.push_str(&format!("\nconfidence: {:.2}", confidence(turn.cautions.len())));
        }
        turn.output = out;
        Ok(StageFlow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Résume ce texte: bla", Intent::Summarize)]
    #[case("give me a summary of this", Intent::Summarize)]
    #[case("c'est quoi un quorum", Intent::Define)]
    #[case("define backpressure", Intent::Define)]
    #[case("les étapes pour migrer", Intent::Plan)]
    #[case("how to ship faster", Intent::Plan)]
    #[case("bonjour", Intent::Answer)]
    fn test_classify_intent(#[case] prompt: &str, #[case] want: Intent) {
        assert_eq!(classify_intent(prompt), want);
    }

    #[test]
    fn test_strip_label() {
        assert_eq!(strip_label("Summarize this: the body"), "the body");
        assert_eq!(strip_label("no label here"), "no label here");
        assert_eq!(strip_label("dangling:"), "dangling:");
    }

    #[test]
    fn test_extract_term() {
        assert_eq!(extract_term("please define idempotence"), "idempotence");
        assert_eq!(extract_term("C'est quoi un quorum ?"), "un quorum ?");
        assert_eq!(extract_term("quorum"), "quorum");
    }

    #[test]
    fn test_shorten_word_boundary() {
        assert_eq!(shorten("hello   world", 20), "hello world");
        assert_eq!(shorten("the quick brown fox jumps", 14), "the quick …");
        assert!(shorten("the quick brown fox jumps", 14).chars().count() <= 14);
        assert_eq!(shorten("supercalifragilistic", 5), "…");
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(confidence(0), 0.99);
        assert!((confidence(1) - 0.8).abs() < 1e-9);
        assert_eq!(confidence(10), 0.1);
    }

    #[test]
    fn test_intent_skill_mapping() {
        assert_eq!(Intent::Summarize.skill(), Some(SUMMARIZER));
        assert_eq!(Intent::Answer.skill(), None);
        assert_eq!(Intent::all().len(), 4);
    }

    #[test]
    fn test_standard_stage_order() {
        assert_eq!(
            Pipeline::standard().stage_names(),
            vec!["filter", "classify", "invoke-skill", "mutate-hook", "annotate"]
        );
    }
}
