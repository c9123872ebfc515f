use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use crate::evolve::FeedbackLabel;
use crate::pipeline::Mode;

pub const DEFAULT_WORKSPACE: &str = ".skill-evolver";

#[derive(Debug, Parser)]
#[command(name = "skill-evolver")]
#[command(version)]
#[command(about = "A local, self-tuning skill evolution engine with a sealed private mode")]
pub struct Args {
    /// Workspace directory holding variants, feedback, policy, seal and ledgers
    #[arg(long, global = true, env = "SKILL_EVOLVER_HOME", default_value = DEFAULT_WORKSPACE)]
    pub workspace: PathBuf,

    /// Configuration file (defaults to <workspace>/config.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// No log output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, PartialEq)]
pub enum Command {
    /// Run one mutation episode against a skill
    Mutate {
        #[arg(long)]
        skill: String,
        /// Candidate budget (defaults to the meta-policy's current budget)
        #[arg(long)]
        trials: Option<u32>,
        /// Seed the sampling RNG for a replayable run
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Score the active implementation on training and holdout samples
    EvalSkill {
        #[arg(long)]
        skill: String,
    },
    /// Nudge the evaluator weights
    Feedback {
        #[arg(long, value_enum)]
        label: FeedbackLabel,
    },
    /// Show the meta-policy state
    MetaPolicy,
    /// Run several mutation episodes, adapting the policy between them
    MetaRun {
        #[arg(long, default_value = "3")]
        episodes: u32,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Restore the default meta-policy
    MetaReset,
    /// Create or replace the seal
    SealInit {
        #[arg(long)]
        phrase: String,
    },
    /// Verify a phrase against the seal
    SealCheck {
        #[arg(long)]
        phrase: String,
    },
    /// Show seal and lockout state
    SealStatus,
    /// List skills with mutability and source hash
    Skills,
    /// List adopted variants
    History {
        #[arg(long)]
        skill: Option<String>,
    },
    /// Run a skill on a text
    RunSkill {
        #[arg(long)]
        skill: String,
        #[arg(long)]
        text: String,
        #[arg(long, default_value = "480")]
        max_len: i64,
    },
    /// Handle one chat prompt through the request pipeline
    Chat {
        #[arg(long)]
        prompt: String,
        #[arg(long, value_enum, default_value = "public")]
        mode: Mode,
        #[arg(long)]
        seal_phrase: Option<String>,
    },
}

/// Default `EnvFilter` directive for a verbosity level.
pub fn log_directive(verbose: u8, quiet: bool) -> &'static str {
    match (quiet, verbose) {
        (true, _) => "off",
        (false, 0) => "warn,skill_evolver=info",
        (false, 1) => "warn,skill_evolver=debug",
        (false, _) => "warn,skill_evolver=trace",
    }
}
