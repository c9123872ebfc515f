//! # Stage: Sealed Credential Gate
//!
//! ## Responsibility
//! Verify a passphrase against a stored PBKDF2-HMAC-SHA256 derivation and
//! lock verification out after repeated failures. This is the only
//! authorization check guarding private mode.
//!
//! ## Guarantees
//! - Constant-time: derived keys are compared with [`subtle::ConstantTimeEq`]
//! - Lockout-first: while a lockout is active nothing is derived and every
//!   check fails, including the correct phrase
//! - Durable: record and failure state live in `seal.json` /
//!   `seal_state.json`, both written through the store's atomic primitives
//! - Deterministic in tests: time comes from an injected [`Clock`]
//!
//! ## NOT Responsible For
//! - Deciding what private mode unlocks (see `pipeline`)
//! - Rate limiting beyond the failure counter

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use ring::pbkdf2;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::error::{EvolveError, Result};
use crate::store::{Store, Versioned, SEAL_FILE, SEAL_STATE_FILE};

/// Name recorded in [`SealRecord::kdf`].
pub const KDF_NAME: &str = "pbkdf2_sha256";
/// Lowest iteration count accepted for new seals.
pub const MIN_ITERATIONS: u32 = 100_000;

const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of wall-clock time in unix seconds.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// A settable clock for lockout tests.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self(AtomicI64::new(start))
    }

    pub fn set(&self, t: i64) {
        self.0.store(t, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_secs() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// Stored derivation. An empty `hash` means no seal has been initialised.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SealRecord {
    #[serde(default)]
    pub schema: u32,
    pub kdf: String,
    /// Hex-encoded salt.
    pub salt: String,
    pub iterations: u32,
    /// Hex-encoded derived key.
    pub hash: String,
    pub created_at: String,
}

impl Versioned for SealRecord {
    const SCHEMA: u32 = 1;
}

impl SealRecord {
    pub fn is_present(&self) -> bool {
        !self.hash.is_empty()
    }
}

/// Consecutive failures and lockout expiry (unix seconds, `0` = none).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SealLockState {
    #[serde(default)]
    pub schema: u32,
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub lock_until: i64,
}

impl Versioned for SealLockState {
    const SCHEMA: u32 = 1;
}

/// Snapshot returned by [`SealGate::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SealStatus {
    pub sealed: bool,
    pub failures: u32,
    pub locked: bool,
    /// Unix seconds; `None` when no lockout is active.
    pub locked_until: Option<i64>,
}

// ---------------------------------------------------------------------------
// SealPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SealPolicy {
    pub iterations: u32,
    pub max_failures: u32,
    pub lockout: Duration,
}

impl Default for SealPolicy {
    fn default() -> Self {
        Self {
            iterations: 120_000,
            max_failures: 5,
            lockout: Duration::from_secs(15 * 60),
        }
    }
}

// ---------------------------------------------------------------------------
// SealGate
// ---------------------------------------------------------------------------

pub struct SealGate {
    store: Store,
    policy: SealPolicy,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SealGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealGate").field("policy", &self.policy).finish_non_exhaustive()
    }
}

impl SealGate {
    pub fn new(store: Store, policy: SealPolicy) -> Self {
        Self::with_clock(store, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Store, policy: SealPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { store, policy, clock }
    }

    fn record_path(&self) -> PathBuf {
        self.store.path(SEAL_FILE)
    }

    fn state_path(&self) -> PathBuf {
        self.store.path(SEAL_STATE_FILE)
    }

    /// `true` when a seal has been initialised in this workspace.
    pub fn exists(&self) -> bool {
        self.store.load_json_or_default::<SealRecord>(&self.record_path()).is_present()
    }

    /// Create (or replace) the seal and clear any failure state.
    pub fn init(&self, phrase: &str) -> Result<SealRecord> {
        if phrase.is_empty() {
            return Err(EvolveError::InvalidArgument("seal phrase must not be empty".into()));
        }
        if self.policy.iterations < MIN_ITERATIONS {
            return Err(EvolveError::InvalidArgument(format!(
                "seal iterations {} below minimum {MIN_ITERATIONS}",
                self.policy.iterations
            )));
        }
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let key = derive(phrase, &salt, self.policy.iterations)?;

        let now = self.clock.now_unix();
        let record = SealRecord {
            schema: SealRecord::SCHEMA,
            kdf: KDF_NAME.to_string(),
            salt: hex::encode(salt),
            iterations: self.policy.iterations,
            hash: hex::encode(key),
            created_at: chrono::DateTime::from_timestamp(now, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
        };
        self.store.save_json(&self.record_path(), &record)?;
        self.store.save_json(
            &self.state_path(),
            &SealLockState { schema: SealLockState::SCHEMA, ..Default::default() },
        )?;
        info!(target: "seal", iterations = record.iterations, "seal initialised");
        Ok(record)
    }

    /// Verify `phrase`. Mismatches, missing seals and active lockouts are all
    /// `Ok(false)`; only persistence failures are errors.
    pub fn check(&self, phrase: &str) -> Result<bool> {
        let now = self.clock.now_unix();
        let state: SealLockState = self.store.load_json_or_default(&self.state_path());
        if state.lock_until > now {
            info!(target: "seal", locked_until = state.lock_until, "seal check refused: locked out");
            return Ok(false);
        }

        let record: SealRecord = self.store.load_json_or_default(&self.record_path());
        if !record.is_present() {
            return Ok(false);
        }
        let (salt, expected) = match (hex::decode(&record.salt), hex::decode(&record.hash)) {
            (Ok(s), Ok(h)) => (s, h),
            _ => {
                warn!(target: "seal", "seal record is not valid hex, treating as absent");
                return Ok(false);
            }
        };
        if record.kdf != KDF_NAME {
            warn!(target: "seal", kdf = %record.kdf, "unsupported kdf in seal record");
            return Ok(false);
        }

        let derived = derive(phrase, &salt, record.iterations)?;
        let matched = expected.len() == KEY_LEN && bool::from(derived[..].ct_eq(&expected[..]));

        let max_failures = self.policy.max_failures.max(1);
        let lockout = self.policy.lockout.as_secs() as i64;
        // The lockout may have started while we were deriving; decide against
        // the state as it is under the lock.
        let verdict = self.store.update_json(&self.state_path(), |s: &mut SealLockState| {
            s.schema = SealLockState::SCHEMA;
            let now = self.clock.now_unix();
            if s.lock_until > now {
                return Verdict::LockedOut { until: s.lock_until };
            }
            if matched {
                s.failures = 0;
                s.lock_until = 0;
                return Verdict::Passed;
            }
            s.failures += 1;
            if s.failures >= max_failures {
                s.lock_until = now + lockout;
                s.failures = 0;
                return Verdict::LockedNow { until: s.lock_until };
            }
            Verdict::Failed { failures: s.failures }
        })?;

        match verdict {
            Verdict::Passed => info!(target: "seal", "seal check passed"),
            Verdict::Failed { failures } => info!(target: "seal", failures, "seal check failed"),
            Verdict::LockedNow { until } => {
                warn!(target: "seal", locked_until = until, "seal locked after repeated failures")
            }
            Verdict::LockedOut { until } => {
                info!(target: "seal", locked_until = until, "seal check refused: lockout began during check")
            }
        }
        Ok(verdict == Verdict::Passed)
    }

    pub fn status(&self) -> SealStatus {
        let now = self.clock.now_unix();
        let state: SealLockState = self.store.load_json_or_default(&self.state_path());
        let locked = state.lock_until > now;
        SealStatus {
            sealed: self.exists(),
            failures: state.failures,
            locked,
            locked_until: locked.then_some(state.lock_until),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Passed,
    Failed { failures: u32 },
    LockedNow { until: i64 },
    LockedOut { until: i64 },
}

fn derive(phrase: &str, salt: &[u8], iterations: u32) -> Result<[u8; KEY_LEN]> {
    let iterations = NonZeroU32::new(iterations)
        .ok_or_else(|| EvolveError::Kdf("iteration count must be non-zero".into()))?;
    let mut out = [0u8; KEY_LEN];
    pbkdf2::derive(pbkdf2::PBKDF2_HMAC_SHA256, iterations, salt, phrase.as_bytes(), &mut out);
    Ok(out)
}
