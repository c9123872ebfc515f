//! # Stage: Skill Registry
//!
//! ## Responsibility
//! Hold the built-in skills, their active compiled implementations and their
//! fixed sample sets, and reconcile them with `variants.json` at start-up.
//!
//! ## Guarantees
//! - Exactly one active implementation per skill
//! - A persisted source that no longer compiles is ignored with a warning and
//!   the built-in default is used instead
//! - Training and holdout samples of each skill are disjoint
//!
//! ## NOT Responsible For
//! - Deciding adoption (see `evolve::trial`); the registry only hot-swaps

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::synth::SynthParams;
use crate::error::{EvolveError, Result};
use crate::sandbox::{CompiledSkill, Sandbox};
use crate::store::{Store, Versioned, VARIANTS_FILE};

pub const SUMMARIZER: &str = "summarizer";
pub const DEFINE: &str = "define";
pub const PLAN: &str = "plan";

// ---------------------------------------------------------------------------
// Samples
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub text: String,
    pub max_len: i64,
}

impl Sample {
    pub fn new(text: impl Into<String>, max_len: i64) -> Self {
        Self { text: text.into(), max_len }
    }
}

/// Disjoint training and holdout samples for one skill.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleSet {
    pub train: Vec<Sample>,
    pub holdout: Vec<Sample>,
}

impl SampleSet {
    /// `true` when no text appears in both halves.
    pub fn is_disjoint(&self) -> bool {
        self.train.iter().all(|t| self.holdout.iter().all(|h| h.text != t.text))
    }
}

const SUMMARIZER_TRAIN: [(&str, i64); 2] = [
    (
        "Release notes for the storage layer. The write path now goes through a single \
         lock per file, and every update is written to a temporary sibling before it is \
         renamed into place. Readers never take the lock, so a slow writer cannot stall \
         them. Error handling changed as well: a lock that cannot be acquired within two \
         seconds surfaces as a retryable timeout instead of a generic failure. Stale locks \
         left by crashed processes are reclaimed after two minutes. The goal of this \
         release is that no reader ever sees a half-written file, even under heavy \
         contention from several processes at once.",
        280,
    ),
    (
        "Incident summary. At 09:12 the nightly import job started reading a malformed \
         batch file and retried the same record in a tight loop. CPU on the worker pool \
         climbed to full utilisation within four minutes and the queue behind it backed up. \
         The on-call engineer paused the job at 09:31, quarantined the batch and restarted \
         the workers. No customer data was lost. Root cause: the parser treated an \
         unterminated quote as a recoverable error. Follow-up: cap retries per record, \
         alert on queue depth, and add the malformed file to the regression corpus so the \
         same mistake cannot ship again without a failing test.",
        320,
    ),
];

const SUMMARIZER_HOLDOUT: [(&str, i64); 2] = [
    (
        "Design review for the evaluation rubric. Each output is scored on four \
         dimensions: whether its length falls inside a sensible window, whether it stays \
         under a line ceiling, whether it shows sentence structure, and whether it avoids \
         hedging language. Weights start at fixed defaults and move in small steps when a \
         reviewer approves or rejects an answer. Every weight is clamped so that no single \
         dimension can dominate the score. The rubric is intentionally simple; it exists \
         to rank candidate summaries against each other, not to judge them in absolute \
         terms, and it should be revisited once real feedback data is available.",
        300,
    ),
    (
        "Meeting notes, planning session. The team agreed to ship the sandbox rewrite \
         behind a configuration switch first and to keep the old path available for one \
         release. Risks discussed: candidate programs that loop forever, regular \
         expressions with nested repetition, and very large inputs. Each has a mitigation \
         in place: a step budget, a static pattern check, and hard caps on string and list \
         sizes. Open item: decide whether the canary input should be configurable. Next \
         meeting in two weeks, after the first batch of mutation runs has produced data \
         worth looking at.",
        260,
    ),
];

const DEFINE_TRAIN: [(&str, i64); 2] = [("idempotence", 200), ("backpressure?", 200)];
const DEFINE_HOLDOUT: [(&str, i64); 2] = [("circuit breaker", 200), ("quorum:", 160)];
const PLAN_TRAIN: [(&str, i64); 2] = [
    ("migrate the billing service to the new queue", 380),
    ("reduce cold start time of the CLI", 380),
];
const PLAN_HOLDOUT: [(&str, i64); 2] = [
    ("roll out structured logging across every worker", 380),
    ("replace the nightly cron job with an event trigger", 300),
];

fn sample_set(train: &[(&str, i64)], holdout: &[(&str, i64)]) -> SampleSet {
    SampleSet {
        train: train.iter().map(|(t, m)| Sample::new(*t, *m)).collect(),
        holdout: holdout.iter().map(|(t, m)| Sample::new(*t, *m)).collect(),
    }
}

// ---------------------------------------------------------------------------
// Built-in sources
// ---------------------------------------------------------------------------

/// Default summarizer: whitespace-normalised head/tail cut.
pub const SUMMARIZER_SOURCE: &str = r#"# default summarizer
fn summarizer(text, max_len)
  let t = collapse_ws(trim(text))
  if len(t) <= max_len
    return t
  end
  let head = trim_end(take(t, floor(max_len * 0.65)))
  let tail = trim_start(last(t, floor(max_len * 0.25)))
  return head + " … " + tail
end
"#;

pub const DEFINE_SOURCE: &str = r#"# one-line definition scaffold
fn define(text, max_len)
  let term = strip_end(collapse_ws(trim(text)), "?!.:")
  if len(term) == 0
    return ""
  end
  return take(term + ": a short operational definition, with one example and one limit.", max_len)
end
"#;

pub const PLAN_SOURCE: &str = r#"# four-step plan scaffold
fn plan(text, max_len)
  let goal = collapse_ws(trim(text))
  let budget = max(0, max_len / 2)
  if len(goal) > budget
    goal = trim_end(take(goal, budget)) + " …"
  end
  let steps = ["clarify the expected result", "list constraints and risks (safety, data, scope)", "run a minimal local test", "iterate in small, controlled steps"]
  let out = "Goal: " + goal
  let i = 1
  for step in steps
    out = out + "\n- Step " + str(i) + ": " + step
    i = i + 1
  end
  return take(out, max_len)
end
"#;

struct Builtin {
    name: &'static str,
    mutable: bool,
    source: &'static str,
    samples: SampleSet,
}

fn builtins() -> Vec<Builtin> {
    vec![
        Builtin {
            name: SUMMARIZER,
            mutable: true,
            source: SUMMARIZER_SOURCE,
            samples: sample_set(&SUMMARIZER_TRAIN, &SUMMARIZER_HOLDOUT),
        },
        Builtin {
            name: DEFINE,
            mutable: false,
            source: DEFINE_SOURCE,
            samples: sample_set(&DEFINE_TRAIN, &DEFINE_HOLDOUT),
        },
        Builtin {
            name: PLAN,
            mutable: false,
            source: PLAN_SOURCE,
            samples: sample_set(&PLAN_TRAIN, &PLAN_HOLDOUT),
        },
    ]
}

// ---------------------------------------------------------------------------
// Persisted variants
// ---------------------------------------------------------------------------

/// One adopted candidate. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantRecord {
    pub id: String,
    pub skill: String,
    pub source: String,
    pub params: SynthParams,
    pub train_score: f64,
    pub val_score: f64,
    pub adopted: bool,
    pub ts: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VariantsFile {
    pub schema: u32,
    pub active: BTreeMap<String, String>,
    pub created: BTreeMap<String, String>,
    pub history: Vec<VariantRecord>,
}

impl Default for VariantsFile {
    fn default() -> Self {
        Self {
            schema: Self::SCHEMA,
            active: BTreeMap::new(),
            created: BTreeMap::new(),
            history: Vec::new(),
        }
    }
}

impl Versioned for VariantsFile {
    const SCHEMA: u32 = 1;
}

// ---------------------------------------------------------------------------
// Skill / SkillRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    /// Only mutable skills have a candidate grammar.
    pub mutable: bool,
    pub active: CompiledSkill,
    pub default_source: String,
    pub samples: SampleSet,
    pub created: String,
}

impl Skill {
    /// `true` when the active source is the built-in default.
    pub fn is_default(&self) -> bool {
        self.active.source() == self.default_source
    }
}

#[derive(Debug, Clone, Default)]
pub struct SkillRegistry {
    skills: BTreeMap<String, Skill>,
}

impl SkillRegistry {
    /// Compile the built-ins, then apply any persisted active sources.
    pub fn bootstrap(sandbox: &Sandbox, store: &Store) -> Result<Self> {
        let path = store.path(VARIANTS_FILE);
        let persisted: VariantsFile = store.load_json_or_default(&path);
        let now = chrono::Utc::now().to_rfc3339();

        let mut skills = BTreeMap::new();
        let mut missing_created = Vec::new();
        for b in builtins() {
            let default = sandbox.try_compile(b.source, b.name).map_err(|e| {
                EvolveError::Config(format!("built-in skill '{}' does not compile: {e}", b.name))
            })?;
            let active = match persisted.active.get(b.name) {
                Some(src) if src != b.source => match sandbox.compile_candidate(src, b.name) {
                    Some(c) => {
                        info!(target: "evolve::skills", skill = b.name, "loaded persisted implementation");
                        c
                    }
                    None => {
                        warn!(
                            target: "evolve::skills",
                            skill = b.name,
                            "persisted implementation no longer compiles, using default"
                        );
                        default
                    }
                },
                _ => default,
            };
            let created = match persisted.created.get(b.name) {
                Some(ts) => ts.clone(),
                None => {
                    missing_created.push(b.name.to_string());
                    now.clone()
                }
            };
            skills.insert(
                b.name.to_string(),
                Skill {
                    name: b.name.to_string(),
                    mutable: b.mutable,
                    active,
                    default_source: b.source.to_string(),
                    samples: b.samples,
                    created,
                },
            );
        }

        if !missing_created.is_empty() {
            store.update_json(&path, |f: &mut VariantsFile| {
                f.schema = VariantsFile::SCHEMA;
                for name in &missing_created {
                    f.created.entry(name.clone()).or_insert_with(|| now.clone());
                }
            })?;
        }
        Ok(Self { skills })
    }

    pub fn get(&self, name: &str) -> Result<&Skill> {
        self.skills.get(name).ok_or_else(|| EvolveError::UnknownSkill(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.skills.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Skill> {
        self.skills.values()
    }

    /// Hot-swap the active implementation of `name`.
    pub fn install(&mut self, name: &str, compiled: CompiledSkill) -> Result<()> {
        let skill = self
            .skills
            .get_mut(name)
            .ok_or_else(|| EvolveError::UnknownSkill(name.to_string()))?;
        skill.active = compiled;
        Ok(())
    }

    /// Replace the sample sets of `name`.
    pub fn set_samples(&mut self, name: &str, samples: SampleSet) -> Result<()> {
        if !samples.is_disjoint() {
            return Err(EvolveError::InvalidArgument(format!(
                "training and holdout samples of '{name}' overlap"
            )));
        }
        let skill = self
            .skills
            .get_mut(name)
            .ok_or_else(|| EvolveError::UnknownSkill(name.to_string()))?;
        skill.samples = samples;
        Ok(())
    }
}
