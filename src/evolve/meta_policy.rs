//! # Stage: Meta-Policy Controller
//!
//! ## Responsibility
//! Adapt the trial loop's own search hyperparameters from its adoption
//! history. A run of failures widens the search (more fractions, more
//! trials, lower margins); a run of successes tightens it.
//!
//! ## Guarantees
//! - Bounded: trial budget stays in `[3, 12]`, both margins in
//!   `[0.05, 0.20]`, normalize probability at most `0.9`
//! - Drift-free: margins are rounded to two decimals after every step
//! - Durable: each update is a single locked read-modify-write of
//!   `meta_mutator.json` plus one `meta_ledger.jsonl` record
//! - Repairing: a hand-edited state file is clamped back into bounds on load
//!
//! ## NOT Responsible For
//! - Running trials (see `evolve::trial`)
//! - Choosing params per candidate (see `evolve::synth::sample_params`)

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::synth::{self, SynthParams};
use crate::error::Result;
use crate::store::{Store, Versioned, META_LEDGER, META_POLICY_FILE};

// ---------------------------------------------------------------------------
// Bounds
// ---------------------------------------------------------------------------

pub const TRIALS_MIN: u32 = 3;
pub const TRIALS_MAX: u32 = 12;
pub const MARGIN_MIN: f64 = 0.05;
pub const MARGIN_MAX: f64 = 0.20;
pub const NORMALIZE_PROB_MAX: f64 = 0.9;

const WIDEN_BELOW_RATE: f64 = 0.3;
const TIGHTEN_ABOVE_RATE: f64 = 0.7;
const WIDEN_HEADS: [f64; 2] = [0.50, 0.75];
const WIDEN_TAILS: [f64; 2] = [0.15, 0.35];
const TRIALS_WIDEN_STEP: u32 = 2;
const MARGIN_STEP: f64 = 0.01;
const NORMALIZE_STEP: f64 = 0.02;

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// MetaPolicyState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaPolicyState {
    pub schema: u32,
    pub head_choices: Vec<f64>,
    pub tail_choices: Vec<f64>,
    pub normalize_prob: f64,
    pub keywords_prob: f64,
    pub trials: u32,
    pub train_margin: f64,
    pub val_margin: f64,
    pub widen_on_fail: bool,
    pub tighten_on_win: bool,
    pub attempts: u64,
    pub successes: u64,
}

impl Default for MetaPolicyState {
    fn default() -> Self {
        Self {
            schema: Self::SCHEMA,
            head_choices: vec![0.55, 0.60, 0.65, 0.70],
            tail_choices: vec![0.20, 0.25, 0.30],
            normalize_prob: 0.5,
            keywords_prob: 0.5,
            trials: 5,
            train_margin: 0.10,
            val_margin: 0.10,
            widen_on_fail: true,
            tighten_on_win: true,
            attempts: 0,
            successes: 0,
        }
    }
}

impl Versioned for MetaPolicyState {
    const SCHEMA: u32 = 1;
}

impl MetaPolicyState {
    /// Adoption rate so far; `0.0` before the first attempt.
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    /// Clamp every field back into its documented range.
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        let clean = |xs: &mut Vec<f64>, fallback: &[f64]| {
            xs.retain(|x| x.is_finite() && *x > 0.0 && *x < 1.0);
            xs.iter_mut().for_each(|x| *x = round2(*x));
            xs.sort_by(|a, b| a.total_cmp(b));
            xs.dedup();
            if xs.is_empty() {
                xs.extend_from_slice(fallback);
            }
        };
        clean(&mut self.head_choices, &defaults.head_choices);
        clean(&mut self.tail_choices, &defaults.tail_choices);
        let prob = |p: f64, d: f64| if p.is_finite() { p.clamp(0.0, 1.0) } else { d };
        self.normalize_prob = prob(self.normalize_prob, defaults.normalize_prob);
        self.keywords_prob = prob(self.keywords_prob, defaults.keywords_prob);
        self.trials = self.trials.clamp(TRIALS_MIN, TRIALS_MAX);
        let margin = |m: f64, d: f64| if m.is_finite() { round2(m.clamp(MARGIN_MIN, MARGIN_MAX)) } else { d };
        self.train_margin = margin(self.train_margin, defaults.train_margin);
        self.val_margin = margin(self.val_margin, defaults.val_margin);
        self.successes = self.successes.min(self.attempts);
        self.schema = Self::SCHEMA;
    }

    /// Record one episode outcome and adapt. Returns the new success rate.
    pub fn apply_outcome(&mut self, adopted: bool) -> f64 {
        self.attempts += 1;
        if adopted {
            self.successes += 1;
        }
        let rate = self.success_rate();

        if !adopted && rate < WIDEN_BELOW_RATE && self.widen_on_fail {
            for h in WIDEN_HEADS {
                if !self.head_choices.iter().any(|x| (x - h).abs() < 1e-9) {
                    self.head_choices.push(h);
                }
            }
            for t in WIDEN_TAILS {
                if !self.tail_choices.iter().any(|x| (x - t).abs() < 1e-9) {
                    self.tail_choices.push(t);
                }
            }
            self.trials = (self.trials + TRIALS_WIDEN_STEP).min(TRIALS_MAX);
            self.train_margin = round2((self.train_margin - MARGIN_STEP).max(MARGIN_MIN));
            self.val_margin = round2((self.val_margin - MARGIN_STEP).max(MARGIN_MIN));
        } else if adopted && rate > TIGHTEN_ABOVE_RATE && self.tighten_on_win {
            self.trials = self.trials.saturating_sub(1).max(TRIALS_MIN);
            self.train_margin = round2((self.train_margin + MARGIN_STEP).min(MARGIN_MAX));
            self.val_margin = round2((self.val_margin + MARGIN_STEP).min(MARGIN_MAX));
            self.normalize_prob = round2((self.normalize_prob + NORMALIZE_STEP).min(NORMALIZE_PROB_MAX));
        }
        rate
    }
}

// ---------------------------------------------------------------------------
// Ledger record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaLedgerRecord {
    pub ts: String,
    pub event: String,
    pub data: MetaUpdate,
}

/// Outcome of one update, as written to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaUpdate {
    pub adopted: bool,
    pub rate: f64,
    pub trials: u32,
    pub train_margin: f64,
    pub val_margin: f64,
    pub head_choices: Vec<f64>,
    pub tail_choices: Vec<f64>,
}

// ---------------------------------------------------------------------------
// MetaPolicyController
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct MetaPolicyController {
    store: Store,
    state: MetaPolicyState,
}

impl MetaPolicyController {
    pub fn load(store: Store) -> Self {
        let mut state: MetaPolicyState = store.load_json_or_default(&store.path(META_POLICY_FILE));
        state.sanitize();
        Self { store, state }
    }

    pub fn state(&self) -> &MetaPolicyState {
        &self.state
    }

    /// Re-read the persisted state, picking up updates from other processes.
    pub fn reload(&mut self) {
        let mut state: MetaPolicyState = self.store.load_json_or_default(&self.store.path(META_POLICY_FILE));
        state.sanitize();
        self.state = state;
    }

    pub fn sample_params<R: Rng + ?Sized>(&self, rng: &mut R) -> SynthParams {
        synth::sample_params(&self.state, rng)
    }

    /// Apply one episode outcome to the persisted state and log it.
    pub fn update(&mut self, adopted: bool) -> Result<MetaUpdate> {
        let path = self.store.path(META_POLICY_FILE);
        let (state, rate) = self.store.update_json(&path, |s: &mut MetaPolicyState| {
            s.sanitize();
            let rate = s.apply_outcome(adopted);
            (s.clone(), rate)
        })?;
        let update = MetaUpdate {
            adopted,
            rate,
            trials: state.trials,
            train_margin: state.train_margin,
            val_margin: state.val_margin,
            head_choices: state.head_choices.clone(),
            tail_choices: state.tail_choices.clone(),
        };
        self.store.append_record(
            &self.store.path(META_LEDGER),
            &MetaLedgerRecord {
                ts: chrono::Utc::now().to_rfc3339(),
                event: "meta.update".to_string(),
                data: update.clone(),
            },
        )?;
        info!(
            target: "evolve::meta_policy",
            adopted,
            rate,
            trials = state.trials,
            train_margin = state.train_margin,
            val_margin = state.val_margin,
            "meta-policy updated"
        );
        self.state = state;
        Ok(update)
    }

    /// Rewrite the defaults.
    pub fn reset(&mut self) -> Result<()> {
        let state = MetaPolicyState::default();
        self.store.save_json(&self.store.path(META_POLICY_FILE), &state)?;
        info!(target: "evolve::meta_policy", "meta-policy reset to defaults");
        self.state = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LockOptions;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn controller() -> (TempDir, MetaPolicyController) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), LockOptions::default()).unwrap();
        (dir, MetaPolicyController::load(store))
    }

    #[test]
    fn test_defaults() {
        let s = MetaPolicyState::default();
        assert_eq!(s.trials, 5);
        assert_eq!(s.train_margin, 0.10);
        assert_eq!(s.head_choices.len(), 4);
        assert_eq!(s.success_rate(), 0.0);
    }

    #[test]
    fn test_failure_widens() {
        let mut s = MetaPolicyState::default();
        let rate = s.apply_outcome(false);
        assert_eq!(rate, 0.0);
        assert_eq!(s.trials, 7);
        assert_eq!(s.train_margin, 0.09);
        assert_eq!(s.val_margin, 0.09);
        assert!(s.head_choices.contains(&0.50) && s.head_choices.contains(&0.75));
        assert!(s.tail_choices.contains(&0.15) && s.tail_choices.contains(&0.35));
    }

    #[test]
    fn test_widening_does_not_duplicate_choices() {
        let mut s = MetaPolicyState::default();
        s.apply_outcome(false);
        s.apply_outcome(false);
        assert_eq!(s.head_choices.len(), 6);
        assert_eq!(s.tail_choices.len(), 5);
    }

    #[test]
    fn test_success_tightens() {
        let mut s = MetaPolicyState::default();
        s.apply_outcome(true);
        assert_eq!(s.trials, 4);
        assert_eq!(s.train_margin, 0.11);
        assert_eq!(s.normalize_prob, 0.52);
    }

    #[test]
    fn test_middling_rate_changes_nothing_but_counts() {
        let mut s = MetaPolicyState { attempts: 1, successes: 1, ..Default::default() };
        // rate after failure = 0.5
        s.apply_outcome(false);
        assert_eq!(s.trials, 5);
        assert_eq!(s.train_margin, 0.10);
        assert_eq!(s.attempts, 2);
    }

    #[test]
    fn test_switches_disable_adaptation() {
        let mut s = MetaPolicyState { widen_on_fail: false, tighten_on_win: false, ..Default::default() };
        s.apply_outcome(false);
        assert_eq!(s.trials, 5);
        let mut s = MetaPolicyState { widen_on_fail: false, tighten_on_win: false, ..Default::default() };
        s.apply_outcome(true);
        assert_eq!(s.trials, 5);
    }

    #[test]
    fn test_sanitize_repairs_hand_edits() {
        let mut s = MetaPolicyState {
            head_choices: vec![1.5, -0.2, f64::NAN],
            trials: 99,
            train_margin: 0.9,
            val_margin: 0.0,
            normalize_prob: 4.0,
            successes: 10,
            attempts: 2,
            ..Default::default()
        };
        s.sanitize();
        assert_eq!(s.head_choices, MetaPolicyState::default().head_choices);
        assert_eq!(s.trials, TRIALS_MAX);
        assert_eq!(s.train_margin, MARGIN_MAX);
        assert_eq!(s.val_margin, MARGIN_MIN);
        assert_eq!(s.normalize_prob, 1.0);
        assert_eq!(s.successes, 2);
    }

    #[test]
    fn test_update_persists_and_logs() {
        let (dir, mut c) = controller();
        let upd = c.update(false).unwrap();
        assert!(!upd.adopted);
        assert_eq!(upd.trials, 7);

        let reloaded = MetaPolicyController::load(Store::open(dir.path(), LockOptions::default()).unwrap());
        assert_eq!(reloaded.state().attempts, 1);
        assert_eq!(reloaded.state().trials, 7);

        let ledger = std::fs::read_to_string(dir.path().join(META_LEDGER)).unwrap();
        let rec: serde_json::Value = serde_json::from_str(ledger.lines().next().unwrap()).unwrap();
        assert_eq!(rec["event"], "meta.update");
        assert_eq!(rec["data"]["trials"], 7);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let (_d, mut c) = controller();
        c.update(false).unwrap();
        c.reset().unwrap();
        assert_eq!(c.state(), &MetaPolicyState::default());
        c.reload();
        assert_eq!(c.state().attempts, 0);
    }

    proptest! {
        #[test]
        fn prop_failures_move_monotonically_to_floors(n in 1usize..30) {
            let mut s = MetaPolicyState::default();
            let mut prev = s.clone();
            for _ in 0..n {
                s.apply_outcome(false);
                prop_assert!(s.trials >= prev.trials);
                prop_assert!(s.train_margin <= prev.train_margin);
                prop_assert!(s.val_margin <= prev.val_margin);
                prev = s.clone();
            }
            prop_assert!(s.trials <= TRIALS_MAX);
            prop_assert!(s.train_margin >= MARGIN_MIN);
            if n >= 10 {
                prop_assert_eq!(s.train_margin, MARGIN_MIN);
                prop_assert_eq!(s.trials, TRIALS_MAX);
            }
        }

        #[test]
        fn prop_successes_move_monotonically_to_ceilings(n in 1usize..30) {
            let mut s = MetaPolicyState::default();
            let mut prev = s.clone();
            for _ in 0..n {
                s.apply_outcome(true);
                prop_assert!(s.trials <= prev.trials);
                prop_assert!(s.train_margin >= prev.train_margin);
                prop_assert!(s.normalize_prob >= prev.normalize_prob);
                prev = s.clone();
            }
            prop_assert!(s.trials >= TRIALS_MIN);
            prop_assert!(s.val_margin <= MARGIN_MAX);
            prop_assert!(s.normalize_prob <= NORMALIZE_PROB_MAX);
            if n >= 10 {
                prop_assert_eq!(s.val_margin, MARGIN_MAX);
            }
        }

        #[test]
        fn prop_any_sequence_stays_in_bounds(outcomes in proptest::collection::vec(any::<bool>(), 0..60)) {
            let mut s = MetaPolicyState::default();
            for o in outcomes {
                s.apply_outcome(o);
                prop_assert!((TRIALS_MIN..=TRIALS_MAX).contains(&s.trials));
                prop_assert!((MARGIN_MIN..=MARGIN_MAX).contains(&s.train_margin));
                prop_assert!((MARGIN_MIN..=MARGIN_MAX).contains(&s.val_margin));
            }
        }
    }
}
