//! Meta-policy adaptation observed through meta-run episodes.

use rand::rngs::StdRng;
use rand::SeedableRng;
use skill_evolver::evolve::meta_policy::{MetaLedgerRecord, MARGIN_MIN, TRIALS_MAX};
use skill_evolver::evolve::{SynthParams, Synthesizer};
use skill_evolver::evolve::skills::{VariantsFile, SUMMARIZER};
use skill_evolver::store::{LockOptions, Store, META_LEDGER, META_POLICY_FILE, VARIANTS_FILE};
use skill_evolver::{Config, Engine};
use tempfile::TempDir;

struct Bloated;

impl Synthesizer for Bloated {
    fn generate(&self, function_name: &str, _params: &SynthParams) -> String {
        format!("fn {function_name}(text, max_len)\n  return text + \" \" + text\nend\n")
    }
}

fn failing_engine(dir: &TempDir) -> Engine {
    Engine::open(dir.path(), Config::default()).unwrap().with_synthesizer(Box::new(Bloated))
}

#[test]
fn test_failed_episodes_widen_the_search() {
    let dir = TempDir::new().unwrap();
    let engine = failing_engine(&dir);
    let run = engine.meta_run(5, &mut StdRng::seed_from_u64(3)).unwrap();

    assert!(!run.adopted_any);
    let trials: Vec<u32> = run.episodes.iter().map(|e| e.trials).collect();
    assert_eq!(trials, vec![5, 7, 9, 11, 12]);
    let margins: Vec<f64> = run.episodes.iter().map(|e| e.train_margin).collect();
    assert!(margins.windows(2).all(|w| w[1] <= w[0]));

    let policy = engine.meta_policy();
    assert_eq!(policy.trials, TRIALS_MAX);
    assert!(policy.head_choices.contains(&0.50) && policy.head_choices.contains(&0.75));
    assert!(policy.tail_choices.contains(&0.15) && policy.tail_choices.contains(&0.35));
    assert!(policy.train_margin >= MARGIN_MIN);
    assert_eq!(run.best_gain, 0.0, "no adoption, no headline gain");
    assert!(run.episodes.iter().all(|e| !e.adopted && e.gain < 0.0));
}

#[test]
fn test_meta_run_headline_counts_adopted_episodes_only() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), LockOptions::default()).unwrap();
    let mut file = VariantsFile::default();
    file.active.insert(
        SUMMARIZER.to_string(),
        "fn summarizer(text, max_len)\n  return take(text, 10)\nend\n".to_string(),
    );
    store.save_json(&store.path(VARIANTS_FILE), &file).unwrap();

    let engine = Engine::open(dir.path(), Config::default()).unwrap();
    let before = engine.eval_skill(SUMMARIZER).unwrap();
    let run = engine.meta_run(3, &mut StdRng::seed_from_u64(2)).unwrap();

    assert!(run.adopted_any);
    let first = &run.episodes[0];
    assert!(first.adopted, "a truncating baseline loses to any template candidate");
    let after_first = engine.history(Some(SUMMARIZER)).unwrap()[0].clone();
    let expected = (after_first.train_score - before.train) + (after_first.val_score - before.val);
    assert!((first.gain - expected).abs() < 1e-9, "gain is train delta plus holdout delta");

    let best_adopted = run.episodes.iter().filter(|e| e.adopted).map(|e| e.gain).fold(0.0, f64::max);
    assert_eq!(run.best_gain, best_adopted);
    assert!(run.best_gain > 0.0);
}

#[test]
fn test_every_update_is_ledgered() {
    let dir = TempDir::new().unwrap();
    let engine = failing_engine(&dir);
    engine.meta_run(3, &mut StdRng::seed_from_u64(0)).unwrap();
    let rows: Vec<MetaLedgerRecord> = engine.store().read_records(&engine.store().path(META_LEDGER)).unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.event == "meta.update" && !r.data.adopted));
    assert_eq!(rows.last().unwrap().data.trials, 11);
}

#[test]
fn test_reset_restores_defaults_and_persists() {
    let dir = TempDir::new().unwrap();
    let engine = failing_engine(&dir);
    engine.meta_run(2, &mut StdRng::seed_from_u64(0)).unwrap();
    let reset = engine.meta_reset().unwrap();
    assert_eq!(reset.trials, 5);
    assert_eq!(reset.attempts, 0);
    let reopened = Engine::open(dir.path(), Config::default()).unwrap();
    assert_eq!(reopened.meta_policy(), reset);
}

#[test]
fn test_hand_edited_policy_is_clamped() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join(META_POLICY_FILE),
        r#"{"schema": 1, "trials": 400, "train_margin": -3.0, "val_margin": 9.0, "head_choices": [2.0]}"#,
    )
    .unwrap();
    let engine = Engine::open(dir.path(), Config::default()).unwrap();
    let p = engine.meta_policy();
    assert_eq!(p.trials, TRIALS_MAX);
    assert_eq!(p.train_margin, MARGIN_MIN);
    assert_eq!(p.val_margin, 0.20);
    assert!(!p.head_choices.is_empty() && p.head_choices.iter().all(|h| *h < 1.0));
}

#[test]
fn test_seeded_meta_runs_replay() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    let ra = Engine::open(a.path(), Config::default()).unwrap().meta_run(3, &mut StdRng::seed_from_u64(11)).unwrap();
    let rb = Engine::open(b.path(), Config::default()).unwrap().meta_run(3, &mut StdRng::seed_from_u64(11)).unwrap();
    assert_eq!(ra, rb);
}
