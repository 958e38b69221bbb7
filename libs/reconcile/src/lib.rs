//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge desired state to observed state. Key concepts:
//!
//! - **Error class**: every failure is either transient (retry with backoff)
//!   or terminal (surface it in status and stop).
//! - **Backoff**: retries wait `base * 2^attempt`, capped at a maximum.
//! - **Snapshot digest**: a canonical hash of a JSON snapshot, used to tell
//!   whether state actually changed.
//!
//! # Invariants
//!
//! - Backoff delays never decrease as the attempt number grows
//! - Digests are deterministic given the same JSON value, regardless of key order
//! - Failure counts only grow until explicitly cleared or the window expires

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand::Rng;
use sha2::{Digest, Sha256};

/// Default window after which a failure streak is forgotten.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes

// =============================================================================
// Error Classification
// =============================================================================

/// How a failure should be handled by a reconciliation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network, timeout, or version conflict: retry with backoff.
    Transient,

    /// Validation, not-found, or broken references: record it and stop.
    Terminal,
}

impl ErrorClass {
    /// Returns true if the failure should be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Returns true if retrying cannot help.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Terminal => f.write_str("terminal"),
        }
    }
}

/// Implemented by every error type a reconciliation loop can see.
pub trait Classify {
    /// The class of this failure.
    fn class(&self) -> ErrorClass;

    /// Shorthand for `self.class().is_transient()`.
    fn is_transient(&self) -> bool {
        self.class().is_transient()
    }
}

// =============================================================================
// Snapshot Digest
// =============================================================================

/// A digest of a JSON snapshot for deterministic comparison.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotDigest(String);

impl SnapshotDigest {
    /// Compute a digest from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Get the digest string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if `other` is the string form of this digest.
    pub fn matches(&self, other: Option<&str>) -> bool {
        other == Some(self.0.as_str())
    }
}

impl std::fmt::Display for SnapshotDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Capped exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound on any single delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0), only applied by `delay_with_jitter`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy without jitter.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Return a copy that spreads delays by `jitter` (clamped to 0.0..=1.0).
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// `base * 2^attempt`, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Like `delay`, spread uniformly by +/- `jitter` of the delay.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }

        let secs = delay.as_secs_f64();
        let spread = secs * self.jitter;
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((secs + offset).max(0.0))
    }
}

// =============================================================================
// Retry Tracker
// =============================================================================

/// Counts consecutive failures per key so callers can pick a backoff attempt.
#[derive(Debug, Clone)]
pub struct RetryTracker<K> {
    /// Failure streaks older than this are forgotten.
    window: Duration,

    /// Tracked failures: key -> (count, first_failure_time).
    failures: BTreeMap<K, (u32, Instant)>,
}

impl<K: Ord + Clone> RetryTracker<K> {
    /// Create a new retry tracker.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a key.
    ///
    /// Returns the length of the current failure streak, including this one.
    pub fn record_failure(&mut self, key: &K) -> u32 {
        let now = Instant::now();

        let (count, first) = self.failures.entry(key.clone()).or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count = count.saturating_add(1);
        *count
    }

    /// Current streak length for a key (0 if none or expired).
    pub fn failures(&self, key: &K) -> u32 {
        let Some((count, first)) = self.failures.get(key) else {
            return 0;
        };

        if Instant::now().duration_since(*first) > self.window {
            return 0;
        }

        *count
    }

    /// Clear failure tracking for a key (on success).
    pub fn clear(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }

    /// Number of keys with a tracked streak.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl<K: Ord + Clone> Default for RetryTracker<K> {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_WINDOW)
    }
}
