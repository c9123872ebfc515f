//! Runtime configuration.
//!
//! Resolution order: defaults, then `--config <file>` (or
//! `<workspace>/config.toml` when no file is given), then environment
//! overrides. Every section is optional in the file; missing keys keep their
//! defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EvolveError, Result};
use crate::evolve::meta_policy::TRIALS_MAX;
use crate::evolve::EvaluatorConfig;
use crate::sandbox::{Limits, SandboxConfig};
use crate::seal::{SealPolicy, MIN_ITERATIONS};
use crate::store::LockOptions;

pub const CONFIG_FILE: &str = "config.toml";

pub const ENV_LOCK_TIMEOUT_MS: &str = "SKILL_EVOLVER_LOCK_TIMEOUT_MS";
pub const ENV_SANDBOX_TIMEOUT_MS: &str = "SKILL_EVOLVER_SANDBOX_TIMEOUT_MS";
pub const ENV_SEAL_ITERATIONS: &str = "SKILL_EVOLVER_SEAL_ITERATIONS";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub lock_timeout_ms: u64,
    pub stale_after_secs: u64,
    pub poll_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self { lock_timeout_ms: 2_000, stale_after_secs: 120, poll_ms: 50 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub canary_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub max_steps: u64,
    /// Bytes one invocation may materialize.
    pub max_alloc_bytes: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            canary_timeout_ms: 250,
            call_timeout_ms: 200,
            max_steps: 1_000_000,
            max_alloc_bytes: Limits::default().max_alloc_bytes as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SealSection {
    pub iterations: u32,
    pub max_failures: u32,
    pub lockout_secs: u64,
}

impl Default for SealSection {
    fn default() -> Self {
        Self { iterations: 120_000, max_failures: 5, lockout_secs: 900 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorSection {
    pub min_len: usize,
    pub max_len: usize,
    pub max_lines: usize,
}

impl Default for EvaluatorSection {
    fn default() -> Self {
        let d = EvaluatorConfig::default();
        Self { min_len: d.min_len, max_len: d.max_len, max_lines: d.max_lines }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSection {
    pub public_max_chars: i64,
    pub private_max_chars: i64,
    /// Flag low-scoring drafts for a background mutation.
    pub mutate_hook: bool,
    pub mutate_below: f64,
}

impl Default for ChatSection {
    fn default() -> Self {
        Self { public_max_chars: 380, private_max_chars: 520, mutate_hook: false, mutate_below: 1.5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationSection {
    /// Ceiling for an explicit `--trials`.
    pub max_trials: u32,
}

impl Default for MutationSection {
    fn default() -> Self {
        Self { max_trials: TRIALS_MAX }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreSection,
    pub sandbox: SandboxSection,
    pub seal: SealSection,
    pub evaluator: EvaluatorSection,
    pub chat: ChatSection,
    pub mutation: MutationSection,
}

impl Config {
    /// Resolve configuration for `workspace`.
    pub fn load(explicit: Option<&Path>, workspace: &Path) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = workspace.join(CONFIG_FILE);
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| EvolveError::Config(format!("read config {}: {err}", path.display())))?;
        Self::from_toml(&raw)
            .map_err(|err| EvolveError::Config(format!("parse config {}: {err}", path.display())))
    }

    pub fn from_toml(raw: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(ms) = env_u64(ENV_LOCK_TIMEOUT_MS)? {
            self.store.lock_timeout_ms = ms;
        }
        if let Some(ms) = env_u64(ENV_SANDBOX_TIMEOUT_MS)? {
            self.sandbox.call_timeout_ms = ms;
        }
        if let Some(n) = env_u32(ENV_SEAL_ITERATIONS)? {
            self.seal.iterations = n;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("store.lock_timeout_ms", self.store.lock_timeout_ms),
            ("store.poll_ms", self.store.poll_ms),
            ("sandbox.canary_timeout_ms", self.sandbox.canary_timeout_ms),
            ("sandbox.call_timeout_ms", self.sandbox.call_timeout_ms),
            ("sandbox.max_steps", self.sandbox.max_steps),
            ("sandbox.max_alloc_bytes", self.sandbox.max_alloc_bytes),
            ("mutation.max_trials", u64::from(self.mutation.max_trials)),
            ("seal.lockout_secs", self.seal.lockout_secs),
        ];
        if let Some((key, _)) = zero.iter().find(|(_, v)| *v == 0) {
            return Err(EvolveError::Config(format!("{key} must be greater than zero")));
        }
        if self.seal.iterations < MIN_ITERATIONS {
            return Err(EvolveError::Config(format!(
                "seal.iterations must be at least {MIN_ITERATIONS}, got {}",
                self.seal.iterations
            )));
        }
        if self.seal.max_failures == 0 {
            return Err(EvolveError::Config("seal.max_failures must be greater than zero".into()));
        }
        if self.evaluator.min_len > self.evaluator.max_len {
            return Err(EvolveError::Config(format!(
                "evaluator window is inverted: min_len {} > max_len {}",
                self.evaluator.min_len, self.evaluator.max_len
            )));
        }
        if self.chat.public_max_chars <= 0 || self.chat.private_max_chars <= 0 {
            return Err(EvolveError::Config("chat max chars must be positive".into()));
        }
        Ok(())
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(self.store.lock_timeout_ms),
            stale_after: Duration::from_secs(self.store.stale_after_secs),
            poll: Duration::from_millis(self.store.poll_ms),
        }
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            canary_timeout: Duration::from_millis(self.sandbox.canary_timeout_ms),
            call_timeout: Duration::from_millis(self.sandbox.call_timeout_ms),
            limits: Limits {
                max_steps: self.sandbox.max_steps,
                max_alloc_bytes: usize::try_from(self.sandbox.max_alloc_bytes).unwrap_or(usize::MAX),
                ..Limits::default()
            },
        }
    }

    pub fn seal_policy(&self) -> SealPolicy {
        SealPolicy {
            iterations: self.seal.iterations,
            max_failures: self.seal.max_failures,
            lockout: Duration::from_secs(self.seal.lockout_secs),
        }
    }

    pub fn evaluator_config(&self) -> EvaluatorConfig {
        EvaluatorConfig {
            min_len: self.evaluator.min_len,
            max_len: self.evaluator.max_len,
            max_lines: self.evaluator.max_lines,
        }
    }
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|err| EvolveError::Config(format!("invalid {key} value {value}: {err}"))),
        Err(_) => Ok(None),
    }
}

fn env_u32(key: &str) -> Result<Option<u32>> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|err| EvolveError::Config(format!("invalid {key} value {value}: {err}"))),
        Err(_) => Ok(None),
    }
}
