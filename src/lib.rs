//! skill-evolver: a local, network-free skill evolution engine.
//!
//! A small library of text skills, written in a sandboxed interpreted
//! language, is improved over time by synthesizing candidate
//! implementations, scoring them on training and holdout samples, and
//! adopting only those that beat the active implementation by a gated
//! margin. A meta-policy tunes the search from its own success rate, and a
//! sealed credential gate protects the private chat mode.
//!
//! Entry point for library users is [`engine::Engine`].

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod evolve;
pub mod pipeline;
pub mod sandbox;
pub mod seal;
pub mod store;

pub use config::Config;
pub use engine::{ChatReply, Engine, MetaRunReport, SkillEval, SkillInfo};
pub use error::{EvolveError, Result};
pub use evolve::{FeedbackLabel, MutationReport};
pub use pipeline::Mode;
