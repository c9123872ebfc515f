//! # Stage: Engine
//!
//! ## Responsibility
//! Composition root. Owns the store, sandbox, seal gate, skill registry,
//! evaluator, meta-policy controller, synthesizer and request pipeline for
//! one workspace, and exposes the collaborator API (`run_skill`,
//! `request_mutation`) plus everything the CLI needs.
//!
//! ## Guarantees
//! - No global state: two engines on two workspaces never interact
//! - One mutation at a time per engine; other processes are serialized by
//!   the store's file locks
//! - Mutation runs hold no in-memory lock while candidates execute; they work
//!   on snapshots and install the winner at the end
//! - `run_skill` always returns text: active implementation, then the
//!   built-in default, then plain truncation
//!
//! ## NOT Responsible For
//! - Printing or exit codes (see `main`)

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{EvolveError, Result};
use crate::evolve::evaluator::{Evaluator, FeedbackLabel, Weights};
use crate::evolve::meta_policy::{MetaPolicyController, MetaPolicyState};
use crate::evolve::skills::{SkillRegistry, VariantRecord, VariantsFile, SUMMARIZER};
use crate::evolve::synth::{Synthesizer, TemplateSynthesizer};
use crate::evolve::trial::{self, MutationReport, TrialContext};
use crate::pipeline::{Mode, Pipeline, Turn};
use crate::sandbox::Sandbox;
use crate::seal::{Clock, SealGate, SealRecord, SealStatus};
use crate::store::{Store, VARIANTS_FILE};

/// `max_len` used by [`Engine::run_skill`].
pub const DEFAULT_MAX_LEN: i64 = 480;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillEval {
    pub skill: String,
    pub train: f64,
    pub val: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillInfo {
    pub name: String,
    pub mutable: bool,
    /// First 16 hex chars of the SHA-256 of the active source.
    pub source_hash: String,
    pub is_default: bool,
    pub created: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeReport {
    pub episode: u32,
    pub adopted: bool,
    pub trials: u32,
    pub train_margin: f64,
    pub val_margin: f64,
    pub gain: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetaRunReport {
    pub episodes: Vec<EpisodeReport>,
    pub adopted_any: bool,
    pub best_gain: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReply {
    pub output: String,
    /// Mode actually used; private requests without a valid seal phrase are
    /// downgraded.
    pub mode: Mode,
    pub turn: Turn,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    config: Config,
    store: Store,
    sandbox: Sandbox,
    seal: SealGate,
    registry: RwLock<SkillRegistry>,
    evaluator: RwLock<Evaluator>,
    policy: Mutex<MetaPolicyController>,
    synthesizer: Box<dyn Synthesizer>,
    mutation_gate: Mutex<()>,
    pipeline: Pipeline,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("workspace", &self.store.root())
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn guard<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

/// First 16 hex chars of the SHA-256 of `source`.
pub fn source_hash(source: &str) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, source.as_bytes());
    let mut h = hex::encode(digest.as_ref());
    h.truncate(16);
    h
}

impl Engine {
    /// Open the workspace at `workspace`, bootstrapping skills and loading
    /// persisted weights and policy.
    pub fn open(workspace: impl Into<PathBuf>, config: Config) -> Result<Self> {
        config.validate()?;
        let store = Store::open(workspace, config.lock_options())?;
        let sandbox = Sandbox::new(config.sandbox_config());
        let seal = SealGate::new(store.clone(), config.seal_policy());
        let registry = SkillRegistry::bootstrap(&sandbox, &store)?;
        let evaluator = Evaluator::load(&store, config.evaluator_config());
        let policy = MetaPolicyController::load(store.clone());
        info!(target: "engine", workspace = %store.root().display(), "engine opened");
        Ok(Self {
            config,
            store,
            sandbox,
            seal,
            registry: RwLock::new(registry),
            evaluator: RwLock::new(evaluator),
            policy: Mutex::new(policy),
            synthesizer: Box::new(TemplateSynthesizer),
            mutation_gate: Mutex::new(()),
            pipeline: Pipeline::standard(),
        })
    }

    /// Replace the candidate generator.
    pub fn with_synthesizer(mut self, synthesizer: Box<dyn Synthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    /// Drive seal lockouts from `clock` instead of the system clock.
    pub fn with_seal_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.seal = SealGate::with_clock(self.store.clone(), self.config.seal_policy(), clock);
        self
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    // -- skills -------------------------------------------------------------

    /// Run `skill` on `text` with [`DEFAULT_MAX_LEN`].
    pub fn run_skill(&self, skill: &str, text: &str) -> Result<String> {
        self.run_skill_with(skill, text, DEFAULT_MAX_LEN)
    }

    pub fn run_skill_with(&self, skill: &str, text: &str, max_len: i64) -> Result<String> {
        if max_len < 0 {
            return Err(EvolveError::InvalidArgument(format!("max_len must be >= 0, got {max_len}")));
        }
        let (active, default_source, is_default) = {
            let reg = read(&self.registry);
            let s = reg.get(skill)?;
            (s.active.clone(), s.default_source.clone(), s.is_default())
        };
        if let Some(out) = self.sandbox.call(&active, text, max_len) {
            return Ok(out);
        }
        warn!(target: "engine", skill, "active implementation failed, trying default");
        if !is_default {
            if let Some(out) = self
                .sandbox
                .compile_candidate(&default_source, skill)
                .and_then(|d| self.sandbox.call(&d, text, max_len))
            {
                return Ok(out);
            }
        }
        let limit = usize::try_from(max_len).unwrap_or(usize::MAX);
        Ok(text.trim().chars().take(limit).collect())
    }

    pub fn is_mutable(&self, skill: &str) -> bool {
        read(&self.registry).get(skill).map(|s| s.mutable).unwrap_or(false)
    }

    /// Hash of the active source of `skill`.
    pub fn skill_fingerprint(&self, skill: &str) -> Option<String> {
        read(&self.registry).get(skill).ok().map(|s| source_hash(s.active.source()))
    }

    pub fn skills(&self) -> Vec<SkillInfo> {
        read(&self.registry)
            .iter()
            .map(|s| SkillInfo {
                name: s.name.clone(),
                mutable: s.mutable,
                source_hash: source_hash(s.active.source()),
                is_default: s.is_default(),
                created: s.created.clone(),
            })
            .collect()
    }

    /// Adopted variants, optionally for one skill, oldest first.
    pub fn history(&self, skill: Option<&str>) -> Result<Vec<VariantRecord>> {
        if let Some(name) = skill {
            read(&self.registry).get(name)?;
        }
        let file: VariantsFile = self.store.load_json_or_default(&self.store.path(VARIANTS_FILE));
        Ok(file
            .history
            .into_iter()
            .filter(|v| skill.map_or(true, |s| v.skill == s))
            .collect())
    }

    // -- evaluation -----------------------------------------------------------

    pub fn score_text(&self, text: &str) -> f64 {
        read(&self.evaluator).score(text)
    }

    /// Score the active implementation of `skill` on both sample sets.
    pub fn eval_skill(&self, skill: &str) -> Result<SkillEval> {
        let s = read(&self.registry).get(skill)?.clone();
        let evaluator = read(&self.evaluator).clone();
        let run = |sample: &crate::evolve::Sample| self.sandbox.call(&s.active, &sample.text, sample.max_len);
        Ok(SkillEval {
            skill: s.name.clone(),
            train: evaluator.score_samples(&s.samples.train, run),
            val: evaluator.score_samples(&s.samples.holdout, run),
        })
    }

    pub fn feedback(&self, label: FeedbackLabel) -> Result<Weights> {
        write(&self.evaluator).learn(&self.store, label)
    }

    // -- mutation ---------------------------------------------------------------

    /// Mutate `skill` with `trials` candidates (the policy's budget when
    /// `None`), using the thread RNG.
    pub fn request_mutation(&self, skill: &str, trials: Option<u32>) -> Result<MutationReport> {
        self.request_mutation_with(skill, trials, &mut rand::thread_rng())
    }

    pub fn request_mutation_with<R: Rng + ?Sized>(
        &self,
        skill: &str,
        trials: Option<u32>,
        rng: &mut R,
    ) -> Result<MutationReport> {
        if let Some(n) = trials {
            let ceiling = self.config.mutation.max_trials;
            if n == 0 || n > ceiling {
                return Err(EvolveError::InvalidArgument(format!(
                    "trials must be between 1 and {ceiling}, got {n}"
                )));
            }
        }
        let _running = guard(&self.mutation_gate);

        let snapshot = read(&self.registry).get(skill)?.clone();
        if !snapshot.mutable {
            return Err(EvolveError::NotMutable(skill.to_string()));
        }
        let policy: MetaPolicyState = {
            let mut p = guard(&self.policy);
            p.reload();
            p.state().clone()
        };
        let evaluator = read(&self.evaluator).clone();
        let budget = trials.unwrap_or(policy.trials);

        let ctx = TrialContext {
            store: &self.store,
            sandbox: &self.sandbox,
            evaluator: &evaluator,
            synthesizer: self.synthesizer.as_ref(),
        };
        let outcome = trial::run_trials(&ctx, &snapshot, &policy, budget, rng)?;
        if let Some(compiled) = outcome.adopted {
            write(&self.registry).install(skill, compiled)?;
            info!(target: "engine", skill, variant = ?outcome.report.variant_id, "new implementation installed");
        }
        guard(&self.policy).update(outcome.report.adopted)?;
        Ok(outcome.report)
    }

    /// Run a mutation on the blocking pool so async callers never execute the
    /// trial loop inline.
    pub async fn spawn_mutation(
        self: Arc<Self>,
        skill: String,
        trials: Option<u32>,
    ) -> Result<MutationReport> {
        tokio::task::spawn_blocking(move || self.request_mutation(&skill, trials))
            .await
            .map_err(|e| EvolveError::Task(e.to_string()))?
    }

    /// `episodes` mutation runs of the summarizer, each with the policy's
    /// current budget.
    pub fn meta_run<R: Rng + ?Sized>(&self, episodes: u32, rng: &mut R) -> Result<MetaRunReport> {
        if episodes == 0 {
            return Err(EvolveError::InvalidArgument("episodes must be at least 1".into()));
        }
        let mut out = Vec::with_capacity(episodes as usize);
        for episode in 1..=episodes {
            let report = self.request_mutation_with(SUMMARIZER, None, rng)?;
            out.push(EpisodeReport {
                episode,
                adopted: report.adopted,
                trials: report.candidates_tried,
                train_margin: report.train_margin,
                val_margin: report.val_margin,
                gain: report.gain(),
            });
        }
        let adopted_any = out.iter().any(|e| e.adopted);
        // Only adopted episodes can raise the headline gain.
        let best_gain = out.iter().filter(|e| e.adopted).map(|e| e.gain).fold(0.0, f64::max);
        Ok(MetaRunReport { episodes: out, adopted_any, best_gain })
    }

    pub fn meta_policy(&self) -> MetaPolicyState {
        let mut p = guard(&self.policy);
        p.reload();
        p.state().clone()
    }

    pub fn meta_reset(&self) -> Result<MetaPolicyState> {
        let mut p = guard(&self.policy);
        p.reset()?;
        Ok(p.state().clone())
    }

    // -- seal ---------------------------------------------------------------------

    pub fn seal_init(&self, phrase: &str) -> Result<SealRecord> {
        self.seal.init(phrase)
    }

    pub fn seal_check(&self, phrase: &str) -> Result<bool> {
        self.seal.check(phrase)
    }

    pub fn seal_status(&self) -> SealStatus {
        self.seal.status()
    }

    // -- chat -----------------------------------------------------------------------

    pub fn chat_max_chars(&self, mode: Mode) -> i64 {
        match mode {
            Mode::Public => self.config.chat.public_max_chars,
            Mode::Private => self.config.chat.private_max_chars,
        }
    }

    /// Resolve the mode a request may use.
    pub fn authorize(&self, requested: Mode, seal_phrase: Option<&str>) -> Result<Mode> {
        if requested == Mode::Public || !self.seal.exists() {
            return Ok(requested);
        }
        match seal_phrase {
            Some(phrase) if self.seal.check(phrase)? => Ok(Mode::Private),
            _ => {
                info!(target: "engine", "private mode not authorized, using public");
                Ok(Mode::Public)
            }
        }
    }

    pub fn chat(&self, prompt: &str, mode: Mode, seal_phrase: Option<&str>) -> Result<ChatReply> {
        let mode = self.authorize(mode, seal_phrase)?;
        let mut turn = Turn::new(prompt, mode);
        self.pipeline.run(&mut turn, self)?;
        info!(
            target: "engine",
            %mode,
            intent = %turn.intent,
            halted = turn.halted,
            mutation_requested = ?turn.mutation_requested,
            "chat turn handled"
        );
        Ok(ChatReply { output: turn.output.clone(), mode, turn })
    }
}
