//! Compare-and-swap with bounded exponential-backoff retry.
//!
//! This crate implements the optimistic-lock runtime: a read-compute-write cycle
//! guarded by a version check, retried under exponential backoff with jitter when
//! a concurrent writer wins the race, and short-circuited via an `ALREADY_APPLIED`
//! sentinel when the requested change has already been committed by another
//! attempt (idempotent retry).
//!
//! # Example
//!
//! ```
//! use protoreg_retry::{RetryConfig, VersionedRead, ComputeOutcome, compare_and_swap};
//! use std::sync::Mutex;
//!
//! let store: Mutex<(u64, i32)> = Mutex::new((1, 0));
//! let outcome = compare_and_swap(
//!     "counter",
//!     &RetryConfig::default(),
//!     || {
//!         let guard = store.lock().unwrap();
//!         Ok::<_, &str>(VersionedRead { version: guard.0, state: guard.1 })
//!     },
//!     |state, _attempt| Ok::<_, &str>(ComputeOutcome::Apply(state + 1)),
//!     |version, state| {
//!         let mut guard = store.lock().unwrap();
//!         guard.0 = version;
//!         guard.1 = *state;
//!         Ok::<_, &str>(())
//!     },
//! );
//! assert!(outcome.is_ok());
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the CAS retry loop. Defaults match §4.2: 10ms base, 1s cap,
/// jitter factor 0.5, 5 attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    #[serde(default = "default_jitter")]
    pub jitter_factor: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> Duration {
    Duration::from_millis(10)
}

fn default_max_delay() -> Duration {
    Duration::from_millis(1000)
}

fn default_jitter() -> f64 {
    0.5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter_factor: default_jitter(),
        }
    }
}

/// `base * 2^(attempt-1)`, capped at `max_delay`, then jittered by `uniform(1-J, 1+J)`.
pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let pow = attempt.saturating_sub(1).min(16);
    let delay = config
        .base_delay
        .saturating_mul(2_u32.saturating_pow(pow))
        .min(config.max_delay);

    if config.jitter_factor > 0.0 {
        apply_jitter(delay, config.jitter_factor)
    } else {
        delay
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::RngExt;

    let jitter_range = 2.0 * jitter;
    let mut rng = rand::rng();
    let random_value: f64 = rng.random();
    let random_factor = 1.0 - jitter + (random_value * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
    Duration::from_millis(millis)
}

/// What `read()` returns: the current version and the state at that version.
#[derive(Debug, Clone)]
pub struct VersionedRead<S> {
    pub version: u64,
    pub state: S,
}

/// What `compute()` returns: either the new state to write, or the `ALREADY_APPLIED`
/// sentinel signalling that the requested change is already committed.
#[derive(Debug, Clone)]
pub enum ComputeOutcome<S> {
    AlreadyApplied,
    Apply(S),
}

/// What a successful `compare_and_swap` call returns.
#[derive(Debug, Clone)]
pub enum CasOutcome<S> {
    /// The write was performed; carries the new version and state.
    Applied { version: u64, state: S },
    /// `compute` reported `ALREADY_APPLIED`; no write was performed.
    AlreadyApplied { version: u64, state: S },
}

impl<S> CasOutcome<S> {
    pub fn version(&self) -> u64 {
        match self {
            CasOutcome::Applied { version, .. } => *version,
            CasOutcome::AlreadyApplied { version, .. } => *version,
        }
    }

    pub fn state(&self) -> &S {
        match self {
            CasOutcome::Applied { state, .. } => state,
            CasOutcome::AlreadyApplied { state, .. } => state,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied { .. })
    }
}

/// Errors from the CAS loop itself, distinct from errors the caller's `read`/
/// `compute`/`write` closures may raise (those are wrapped in [`OptimisticLockError::Operation`]).
#[derive(Debug, thiserror::Error)]
pub enum OptimisticLockError<E> {
    #[error("retry exhausted for resource {resource_id} after {attempts} attempts")]
    RetryExhausted { resource_id: String, attempts: u32 },
    #[error(transparent)]
    Operation(#[from] E),
}

/// Read-modify-write with a version check, exponential-backoff retry with jitter,
/// and at-most-once semantics via the `ALREADY_APPLIED` sentinel (§4.2).
///
/// `read` returns the current `{version, state}`. `compute` derives the candidate
/// new state from the current state and the 1-indexed attempt number, or reports
/// `ALREADY_APPLIED`. Between computing and writing, `read` is called again; if the
/// version has moved, this is a conflict and the loop retries after a jittered
/// sleep. On success, `write` is called with `current.version + 1` and the new
/// state.
pub fn compare_and_swap<S, E>(
    resource_id: &str,
    retry_cfg: &RetryConfig,
    mut read: impl FnMut() -> Result<VersionedRead<S>, E>,
    mut compute: impl FnMut(&S, u32) -> Result<ComputeOutcome<S>, E>,
    mut write: impl FnMut(u64, &S) -> Result<(), E>,
) -> Result<CasOutcome<S>, OptimisticLockError<E>> {
    let mut attempt = 1;
    loop {
        let current = read()?;

        match compute(&current.state, attempt)? {
            ComputeOutcome::AlreadyApplied => {
                return Ok(CasOutcome::AlreadyApplied {
                    version: current.version,
                    state: current.state,
                });
            }
            ComputeOutcome::Apply(new_state) => {
                let recheck = read()?;
                if recheck.version != current.version {
                    if attempt >= retry_cfg.max_attempts {
                        return Err(OptimisticLockError::RetryExhausted {
                            resource_id: resource_id.to_string(),
                            attempts: attempt,
                        });
                    }
                    std::thread::sleep(calculate_delay(retry_cfg, attempt));
                    attempt += 1;
                    continue;
                }

                write(current.version + 1, &new_state)?;
                return Ok(CasOutcome::Applied {
                    version: current.version + 1,
                    state: new_state,
                });
            }
        }
    }
}
