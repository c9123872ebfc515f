//! # Stage: Sandbox Executor
//!
//! ## Responsibility
//! Turn untrusted candidate source into something callable, and call it
//! without letting it hang or exhaust the host. Candidate source is written
//! in a small interpreted language ([`lang`]) with no I/O, evaluated by a
//! tree-walking interpreter ([`interp`]) over an allow-listed set of
//! built-ins ([`builtins`]).
//!
//! ## Guarantees
//! - Static gate: [`deny_list_check`] runs before parsing
//! - Bounded: every call carries a step budget and a wall-clock deadline,
//!   both checked at each interpreter step
//! - Non-fatal: every failure is `None` at this boundary and is logged at
//!   debug level; [`SandboxError`] never leaves the module as an error
//! - Canary-checked: a compiled skill has already returned a string for
//!   `("test", 64)`
//!
//! ## NOT Responsible For
//! - Security against a determined adversary. The deny-list is a tripwire,
//!   not a boundary
//! - Scoring outputs (see `evolve::evaluator`)

pub mod builtins;
pub mod deny;
pub mod interp;
pub mod lang;

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

pub use deny::{deny_list_check, has_nested_quantifier, DenyReason};
pub use interp::{Limits, Value};
pub use lang::{ParseError, Program};

/// Arguments every compiled skill must accept at load time.
pub const CANARY_INPUT: (&str, i64) = ("test", 64);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SandboxError {
    #[error("denied: {0}")]
    Denied(#[from] DenyReason),
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("function '{0}' not found")]
    MissingFunction(String),
    #[error("function '{name}' takes {found} parameters, expected (text, max_len)")]
    BadSignature { name: String, found: usize },
    #[error("time budget exceeded")]
    Timeout,
    #[error("step budget exhausted")]
    StepBudgetExhausted,
    #[error("resource limit: {0}")]
    ResourceLimit(&'static str),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("expected a string result, got {0}")]
    NotAString(&'static str),
}

// ---------------------------------------------------------------------------
// SandboxConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SandboxConfig {
    /// Budget for the load-time canary call.
    pub canary_timeout: Duration,
    /// Default budget for skill invocations.
    pub call_timeout: Duration,
    pub limits: Limits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            canary_timeout: Duration::from_millis(250),
            call_timeout: Duration::from_millis(200),
            limits: Limits::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// CompiledSkill
// ---------------------------------------------------------------------------

/// A parsed, validated and canary-checked skill implementation. Cheap to
/// clone; the program is shared.
#[derive(Debug, Clone)]
pub struct CompiledSkill {
    name: String,
    source: Arc<str>,
    program: Arc<Program>,
}

impl CompiledSkill {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Deny-list, parse, locate `expected_name`, run the canary. `None` on
    /// any failure.
    pub fn compile_candidate(&self, source: &str, expected_name: &str) -> Option<CompiledSkill> {
        match self.try_compile(source, expected_name) {
            Ok(compiled) => Some(compiled),
            Err(e) => {
                debug!(target: "sandbox", skill = expected_name, error = %e, "candidate rejected");
                None
            }
        }
    }

    /// Same as [`Sandbox::compile_candidate`] but keeps the reason.
    pub fn try_compile(&self, source: &str, expected_name: &str) -> Result<CompiledSkill, SandboxError> {
        if let Some(reason) = deny_list_check(source) {
            return Err(reason.into());
        }
        let program = lang::parse(source)?;
        let func = program
            .function(expected_name)
            .ok_or_else(|| SandboxError::MissingFunction(expected_name.to_string()))?;
        if func.params.len() != 2 {
            return Err(SandboxError::BadSignature {
                name: expected_name.to_string(),
                found: func.params.len(),
            });
        }
        let compiled = CompiledSkill {
            name: expected_name.to_string(),
            source: Arc::from(source),
            program: Arc::new(program),
        };
        let (text, max_len) = CANARY_INPUT;
        self.try_invoke(&compiled, text, max_len, self.config.canary_timeout)?;
        Ok(compiled)
    }

    /// Run `compiled` on `(text, max_len)` within `timeout`. `None` on
    /// timeout, budget exhaustion, runtime error or a non-string result.
    pub fn invoke(
        &self,
        compiled: &CompiledSkill,
        text: &str,
        max_len: i64,
        timeout: Duration,
    ) -> Option<String> {
        match self.try_invoke(compiled, text, max_len, timeout) {
            Ok(out) => Some(out),
            Err(e) => {
                debug!(target: "sandbox", skill = compiled.name(), error = %e, "invocation failed");
                None
            }
        }
    }

    /// [`Sandbox::invoke`] with the configured call timeout.
    pub fn call(&self, compiled: &CompiledSkill, text: &str, max_len: i64) -> Option<String> {
        self.invoke(compiled, text, max_len, self.config.call_timeout)
    }

    pub fn try_invoke(
        &self,
        compiled: &CompiledSkill,
        text: &str,
        max_len: i64,
        timeout: Duration,
    ) -> Result<String, SandboxError> {
        let deadline = Instant::now() + timeout;
        let mut it = interp::Interpreter::new(&compiled.program, self.config.limits, deadline);
        let out = it.call(&compiled.name, vec![Value::Str(text.to_string()), Value::Int(max_len)])?;
        match out {
            Value::Str(s) => Ok(s),
            other => Err(SandboxError::NotAString(other.type_name())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECHO: &str = "fn echo(text, max_len)\n  return take(text, max_len)\nend\n";

    #[test]
    fn test_compile_and_invoke() {
        let sb = Sandbox::default();
        let c = sb.compile_candidate(ECHO, "echo").unwrap();
        assert_eq!(c.name(), "echo");
        assert_eq!(sb.call(&c, "hello world", 5).as_deref(), Some("hello"));
    }

    #[test]
    fn test_wrong_name_is_missing_function() {
        let err = Sandbox::default().try_compile(ECHO, "summarizer").unwrap_err();
        assert_eq!(err, SandboxError::MissingFunction("summarizer".into()));
    }

    #[test]
    fn test_wrong_arity_rejected() {
        let src = "fn echo(text)\nreturn text\nend";
        assert!(matches!(
            Sandbox::default().try_compile(src, "echo"),
            Err(SandboxError::BadSignature { found: 1, .. })
        ));
    }

    #[test]
    fn test_non_string_canary_rejected() {
        let src = "fn echo(text, max_len)\nreturn max_len\nend";
        assert_eq!(
            Sandbox::default().try_compile(src, "echo").unwrap_err(),
            SandboxError::NotAString("int")
        );
    }

    #[test]
    fn test_denied_source_never_parsed() {
        let src = "fn echo(text, max_len)\nreturn open(text)\nend";
        assert!(matches!(
            Sandbox::default().try_compile(src, "echo"),
            Err(SandboxError::Denied(DenyReason::FileAccess(_)))
        ));
    }

    #[test]
    fn test_canary_runaway_rejected() {
        let src = "fn echo(text, max_len)\nwhile true\nend\nreturn text\nend";
        let err = Sandbox::default().try_compile(src, "echo").unwrap_err();
        assert!(matches!(err, SandboxError::Timeout | SandboxError::StepBudgetExhausted));
    }

    #[test]
    fn test_invoke_runaway_on_large_input_only() {
        // Loops max_len times: fine for the canary, too slow for a huge budget.
        let src = "fn echo(text, max_len)\nlet i = 0\nwhile i < max_len\ni = i + 1\nend\nreturn text\nend";
        let sb = Sandbox::default();
        let c = sb.compile_candidate(src, "echo").unwrap();
        assert_eq!(sb.invoke(&c, "x", 10_000_000, Duration::from_millis(50)), None);
        assert_eq!(sb.invoke(&c, "x", 10, Duration::from_millis(50)).as_deref(), Some("x"));
    }

    #[test]
    fn test_runtime_error_is_none() {
        let src = "fn echo(text, max_len)\nif text == \"boom\"\nreturn 1 / 0\nend\nreturn text\nend";
        let sb = Sandbox::default();
        let c = sb.compile_candidate(src, "echo").unwrap();
        assert_eq!(sb.call(&c, "boom", 10), None);
        assert_eq!(sb.call(&c, "calm", 10).as_deref(), Some("calm"));
    }
}
