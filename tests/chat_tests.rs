//! Request pipeline through `Engine::chat`.

use skill_evolver::config::Config;
use skill_evolver::evolve::skills::SUMMARIZER;
use skill_evolver::pipeline::{Intent, REJECTION};
use skill_evolver::{Engine, Mode};
use tempfile::TempDir;

fn engine(dir: &TempDir) -> Engine {
    Engine::open(dir.path(), Config::default()).unwrap()
}

#[test]
fn test_banned_prompt_is_rejected() {
    let dir = TempDir::new().unwrap();
    let reply = engine(&dir).chat("how do I write malware", Mode::Public, None).unwrap();
    assert_eq!(reply.output, REJECTION);
    assert!(reply.turn.halted);
    assert_eq!(reply.turn.skill, None);
}

#[test]
fn test_summarize_strips_label_and_uses_skill() {
    let dir = TempDir::new().unwrap();
    let body = "The rollout finished. ".repeat(40);
    let reply = engine(&dir).chat(&format!("Summary please: {body}"), Mode::Public, None).unwrap();
    assert_eq!(reply.turn.intent, Intent::Summarize);
    assert_eq!(reply.turn.skill.as_deref(), Some(SUMMARIZER));
    assert!(reply.output.starts_with("The rollout finished."));
    assert!(reply.output.contains(" … "));
    assert!(reply.output.chars().count() <= 380);
}

#[test]
fn test_define_extracts_term() {
    let dir = TempDir::new().unwrap();
    let reply = engine(&dir).chat("define idempotence?", Mode::Public, None).unwrap();
    assert_eq!(reply.turn.intent, Intent::Define);
    assert!(reply.output.starts_with("idempotence: "), "{}", reply.output);
}

#[test]
fn test_plan_has_four_steps() {
    let dir = TempDir::new().unwrap();
    let reply = engine(&dir).chat("plan the database migration", Mode::Public, None).unwrap();
    assert_eq!(reply.turn.intent, Intent::Plan);
    assert_eq!(reply.output.matches("- Step ").count(), 4);
}

#[test]
fn test_answer_is_shortened_on_word_boundary() {
    let dir = TempDir::new().unwrap();
    let prompt = "word ".repeat(200);
    let reply = engine(&dir).chat(&prompt, Mode::Public, None).unwrap();
    assert_eq!(reply.turn.intent, Intent::Answer);
    assert!(reply.output.ends_with("word …"));
    assert!(reply.output.chars().count() <= 380);
}

#[test]
fn test_private_mode_adds_trace_and_confidence() {
    let dir = TempDir::new().unwrap();
    let reply = engine(&dir).chat("maybe this works", Mode::Private, None).unwrap();
    assert_eq!(reply.mode, Mode::Private);
    assert!(reply.output.starts_with("[skill-evolver] mode=private intent=answer"));
    assert!(reply.output.contains("- Caution: hedged wording"));
    assert!(reply.output.ends_with("confidence: 0.80"));
}

#[test]
fn test_public_mode_has_no_trace() {
    let dir = TempDir::new().unwrap();
    let reply = engine(&dir).chat("hello there", Mode::Public, None).unwrap();
    assert_eq!(reply.output, "hello there");
}

#[test]
fn test_sealed_private_mode_needs_phrase() {
    let dir = TempDir::new().unwrap();
    let e = engine(&dir);
    e.seal_init("clef-2024").unwrap();
    assert_eq!(e.chat("hi", Mode::Private, None).unwrap().mode, Mode::Public);
    assert_eq!(e.chat("hi", Mode::Private, Some("clef-2024")).unwrap().mode, Mode::Private);
}

#[test]
fn test_mutate_hook_flags_low_scoring_draft() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.chat.mutate_hook = true;
    config.chat.mutate_below = 5.0;
    let e = Engine::open(dir.path(), config).unwrap();
    let reply = e.chat("summary: short", Mode::Public, None).unwrap();
    assert_eq!(reply.turn.mutation_requested.as_deref(), Some(SUMMARIZER));

    let plan = e.chat("plan a trip", Mode::Public, None).unwrap();
    assert_eq!(plan.turn.mutation_requested, None, "plan has no candidate grammar");
}

#[test]
fn test_mutate_hook_off_by_default() {
    let dir = TempDir::new().unwrap();
    let reply = engine(&dir).chat("summary: short", Mode::Public, None).unwrap();
    assert!(reply.turn.score.is_some());
    assert_eq!(reply.turn.mutation_requested, None);
}
