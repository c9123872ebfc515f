//! # Stage: Mutation Trial Loop
//!
//! ## Responsibility
//! Compare synthesized candidates against a skill's active implementation on
//! its training samples, validate the best one on the holdout samples, and
//! commit it only when both adoption margins hold.
//!
//! ## Guarantees
//! - Gated: adoption implies `best_train >= baseline_train + train_margin`
//!   and `best_val >= baseline_val + val_margin`
//! - Isolated failures: a candidate that fails to compile is skipped; the
//!   loop never aborts on it
//! - All-or-nothing: the history entry and the new active source are written
//!   in one locked update of `variants.json`; nothing is written otherwise
//! - Audited: every run appends one record to `mutation_ledger.jsonl`
//!
//! ## NOT Responsible For
//! - Adapting the search parameters (see `evolve::meta_policy`)
//! - Hot-swapping the in-memory registry (the engine installs the returned
//!   [`CompiledSkill`])

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::evaluator::Evaluator;
use super::meta_policy::MetaPolicyState;
use super::skills::{Sample, Skill, VariantRecord, VariantsFile};
use super::synth::{self, SynthParams, Synthesizer};
use crate::error::{EvolveError, Result};
use crate::sandbox::{CompiledSkill, Sandbox};
use crate::store::{Store, Versioned, MUTATION_LEDGER, VARIANTS_FILE};

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Outcome of one mutation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationReport {
    pub skill: String,
    pub baseline_train: f64,
    pub baseline_val: f64,
    /// `None` when no candidate compiled.
    pub best_train: Option<f64>,
    pub best_val: Option<f64>,
    pub candidates_tried: u32,
    pub candidates_compiled: u32,
    pub train_margin: f64,
    pub val_margin: f64,
    pub adopted: bool,
    pub variant_id: Option<String>,
    pub params: Option<SynthParams>,
    pub ts: String,
}

impl MutationReport {
    /// Combined improvement of the best candidate over the baseline:
    /// training delta plus holdout delta. Zero when nothing compiled.
    pub fn gain(&self) -> f64 {
        match (self.best_train, self.best_val) {
            (Some(t), Some(v)) => (t - self.baseline_train) + (v - self.baseline_val),
            _ => 0.0,
        }
    }
}

#[derive(Serialize)]
struct LedgerRecord<'a> {
    ts: &'a str,
    event: &'a str,
    data: &'a MutationReport,
}

// ---------------------------------------------------------------------------
// Trial context
// ---------------------------------------------------------------------------

/// Everything a trial run borrows. Snapshotted by the caller so no lock is
/// held while candidates execute.
pub struct TrialContext<'a> {
    pub store: &'a Store,
    pub sandbox: &'a Sandbox,
    pub evaluator: &'a Evaluator,
    pub synthesizer: &'a dyn Synthesizer,
}

/// Result of [`run_trials`]: the report plus the compiled winner when it was
/// adopted.
#[derive(Debug)]
pub struct TrialOutcome {
    pub report: MutationReport,
    pub adopted: Option<CompiledSkill>,
}

struct Best {
    compiled: CompiledSkill,
    params: SynthParams,
    train: f64,
}

fn score_on(ctx: &TrialContext<'_>, compiled: &CompiledSkill, samples: &[Sample]) -> f64 {
    ctx.evaluator
        .score_samples(samples, |s| ctx.sandbox.call(compiled, &s.text, s.max_len))
}

/// The adoption rule.
pub fn passes_margins(
    baseline_train: f64,
    baseline_val: f64,
    best_train: f64,
    best_val: f64,
    train_margin: f64,
    val_margin: f64,
) -> bool {
    best_train >= baseline_train + train_margin && best_val >= baseline_val + val_margin
}

/// Run `budget` candidates against `skill` and commit the winner if it clears
/// both margins.
pub fn run_trials<R: Rng + ?Sized>(
    ctx: &TrialContext<'_>,
    skill: &Skill,
    policy: &MetaPolicyState,
    budget: u32,
    rng: &mut R,
) -> Result<TrialOutcome> {
    if !skill.mutable {
        return Err(EvolveError::NotMutable(skill.name.clone()));
    }
    if budget == 0 {
        return Err(EvolveError::InvalidArgument("trial budget must be at least 1".into()));
    }

    let baseline_train = score_on(ctx, &skill.active, &skill.samples.train);
    let baseline_val = score_on(ctx, &skill.active, &skill.samples.holdout);
    debug!(target: "evolve::trial", skill = %skill.name, baseline_train, baseline_val, budget, "baseline scored");

    let mut best: Option<Best> = None;
    let mut compiled_count = 0u32;
    for i in 0..budget {
        let params = synth::sample_params(policy, rng);
        let source = ctx.synthesizer.generate(&skill.name, &params);
        let Some(compiled) = ctx.sandbox.compile_candidate(&source, &skill.name) else {
            debug!(target: "evolve::trial", skill = %skill.name, trial = i, %params, "candidate did not compile");
            continue;
        };
        compiled_count += 1;
        let train = score_on(ctx, &compiled, &skill.samples.train);
        debug!(target: "evolve::trial", skill = %skill.name, trial = i, %params, train, "candidate scored");
        if best.as_ref().map_or(true, |b| train > b.train) {
            best = Some(Best { compiled, params, train });
        }
    }

    let best_val = best.as_ref().map(|b| score_on(ctx, &b.compiled, &skill.samples.holdout));
    let adopted = match (&best, best_val) {
        (Some(b), Some(val)) => passes_margins(
            baseline_train,
            baseline_val,
            b.train,
            val,
            policy.train_margin,
            policy.val_margin,
        ),
        _ => false,
    };

    let ts = chrono::Utc::now().to_rfc3339();
    let mut report = MutationReport {
        skill: skill.name.clone(),
        baseline_train,
        baseline_val,
        best_train: best.as_ref().map(|b| b.train),
        best_val,
        candidates_tried: budget,
        candidates_compiled: compiled_count,
        train_margin: policy.train_margin,
        val_margin: policy.val_margin,
        adopted,
        variant_id: None,
        params: best.as_ref().map(|b| b.params),
        ts: ts.clone(),
    };

    let mut winner = None;
    if let (true, Some(b), Some(val)) = (adopted, best, best_val) {
        let record = VariantRecord {
            id: uuid::Uuid::new_v4().to_string(),
            skill: skill.name.clone(),
            source: b.compiled.source().to_string(),
            params: b.params,
            train_score: b.train,
            val_score: val,
            adopted: true,
            ts: ts.clone(),
        };
        commit_variant(ctx.store, &record)?;
        report.variant_id = Some(record.id);
        winner = Some(b.compiled);
    }

    ctx.store.append_record(
        &ctx.store.path(MUTATION_LEDGER),
        &LedgerRecord { ts: &ts, event: "mutation.run", data: &report },
    )?;
    info!(
        target: "evolve::trial",
        skill = %report.skill,
        adopted = report.adopted,
        compiled = report.candidates_compiled,
        tried = report.candidates_tried,
        baseline_train = report.baseline_train,
        baseline_val = report.baseline_val,
        best_train = ?report.best_train,
        best_val = ?report.best_val,
        "mutation run finished"
    );
    Ok(TrialOutcome { report, adopted: winner })
}

/// Append `record` to history and make its source active, in one update.
fn commit_variant(store: &Store, record: &VariantRecord) -> Result<()> {
    store.update_json(&store.path(VARIANTS_FILE), |f: &mut VariantsFile| {
        f.schema = VariantsFile::SCHEMA;
        f.active.insert(record.skill.clone(), record.source.clone());
        f.history.push(record.clone());
    })
}
