//! Skill evolution: the skill library, candidate synthesis, scoring, the
//! mutation trial loop and the meta-policy that tunes it.

pub mod evaluator;
pub mod meta_policy;
pub mod skills;
pub mod synth;
pub mod trial;

pub use evaluator::{Dimension, Evaluator, EvaluatorConfig, FeedbackLabel, Weights};
pub use meta_policy::{MetaPolicyController, MetaPolicyState, MetaUpdate};
pub use skills::{Sample, SampleSet, Skill, SkillRegistry, VariantRecord, VariantsFile};
pub use synth::{SynthParams, Synthesizer, TemplateSynthesizer};
pub use trial::{run_trials, MutationReport, TrialContext, TrialOutcome};
