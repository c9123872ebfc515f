//! Crate-level error type.
//!
//! Only failures a caller can act on live here. Sandbox rejections and seal
//! mismatches are modelled as data (`Option` / `bool`) by their modules and
//! never become an [`EvolveError`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the skill-evolution core.
#[derive(Debug, Error)]
pub enum EvolveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    /// Another process held the lock for longer than the caller was willing
    /// to wait. Retryable.
    #[error("lock timeout on {} after {:?}", path.display(), waited)]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown skill: {0}")]
    UnknownSkill(String),

    #[error("skill '{0}' has no candidate grammar and cannot be mutated")]
    NotMutable(String),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    /// A background mutation task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl EvolveError {
    /// `true` when retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EvolveError::LockTimeout { .. })
    }

    /// Process exit code for the CLI: `2` for argument-class errors, `1`
    /// otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            EvolveError::InvalidArgument(_)
            | EvolveError::UnknownSkill(_)
            | EvolveError::NotMutable(_) => 2,
            _ => 1,
        }
    }
}

/// Crate result alias.
pub type Result<T> = std::result::Result<T, EvolveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_is_retryable() {
        let e = EvolveError::LockTimeout {
            path: PathBuf::from("variants.json"),
            waited: Duration::from_secs(2),
        };
        assert!(e.is_retryable());
        assert_eq!(e.exit_code(), 1);
    }

    #[test]
    fn test_argument_errors_exit_with_two() {
        assert_eq!(EvolveError::InvalidArgument("x".into()).exit_code(), 2);
        assert_eq!(EvolveError::UnknownSkill("x".into()).exit_code(), 2);
        assert_eq!(EvolveError::NotMutable("x".into()).exit_code(), 2);
    }

    #[test]
    fn test_io_error_not_retryable() {
        let e: EvolveError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(!e.is_retryable());
        assert!(e.to_string().contains("boom"));
    }

    #[test]
    fn test_lock_timeout_display_names_path() {
        let e = EvolveError::LockTimeout {
            path: PathBuf::from("/tmp/feedback.json"),
            waited: Duration::from_millis(50),
        };
        assert!(e.to_string().contains("feedback.json"));
    }
}
