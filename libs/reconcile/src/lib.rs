//! Reconciliation primitives for role instance sets.
//!
//! Helpers shared by the lifecycle engine and the group aggregator:
//!
//! - **Convergence**: classify a role or group from its instance counts.
//! - **Revisions**: derive a monotonically increasing template revision from a
//!   canonical spec hash.
//! - **Drain selection**: order scale-down victims.
//! - **Retry budgets**: bound repeated failures of one resource in a window,
//!   with exponential backoff between attempts.
//!
//! # Invariants
//!
//! - All operations are deterministic given the same inputs
//! - Revisions never decrease for a key

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Convergence status for a role or group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Every desired instance is running and nothing is in flight.
    Converged,

    /// Instances are being created or deleted.
    Converging,

    /// Status is unknown (nothing desired and nothing observed).
    Unknown,
}

impl ConvergenceStatus {
    /// Classify from instance counts.
    pub fn from_counts(desired: u32, running: u32, creating: u32, deleting: u32) -> Self {
        if desired == 0 && running == 0 && creating == 0 && deleting == 0 {
            return Self::Unknown;
        }

        if running == desired && creating == 0 && deleting == 0 {
            Self::Converged
        } else {
            Self::Converging
        }
    }

    /// Returns true if the resource has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if the resource is still converging.
    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging)
    }
}

/// A spec hash for deterministic comparison.
///
/// Used to detect when a role template has changed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
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

/// Tracks the template revision of each key.
///
/// The first hash observed for a key is revision 1. Every later observation
/// of a *different* hash bumps the revision by one; re-observing the current
/// hash is a no-op. Switching back to an earlier hash still bumps, since
/// instances stamped with the old number may be from a different template.
#[derive(Debug, Clone)]
pub struct RevisionTracker<K: Ord> {
    entries: BTreeMap<K, (SpecHash, u64)>,
}

impl<K: Ord> Default for RevisionTracker<K> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: Ord> RevisionTracker<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `hash` for `key` and return the resulting revision.
    ///
    /// The boolean is true when the revision changed.
    pub fn observe(&mut self, key: K, hash: SpecHash) -> (u64, bool) {
        match self.entries.get_mut(&key) {
            Some((current, revision)) => {
                if *current == hash {
                    (*revision, false)
                } else {
                    *current = hash;
                    *revision += 1;
                    (*revision, true)
                }
            }
            None => {
                self.entries.insert(key, (hash, 1));
                (1, true)
            }
        }
    }
}

/// Drain selection priority for instances.
///
/// Lower priority values are drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DrainPriority {
    /// Instance has not become ready yet (drain first).
    NotReady = 0,

    /// Instance is ready and serving (drain last).
    Ready = 1,
}

/// Select instances to drain based on priority.
///
/// Returns instances sorted by drain priority (first to drain first). The sort
/// is stable, so callers control the order inside one priority class.
pub fn select_for_drain<T, F>(instances: Vec<T>, get_priority: F) -> Vec<T>
where
    F: Fn(&T) -> DrainPriority,
{
    let mut with_priority: Vec<_> = instances
        .into_iter()
        .map(|i| {
            let p = get_priority(&i);
            (p, i)
        })
        .collect();

    with_priority.sort_by_key(|(p, _)| *p);
    with_priority.into_iter().map(|(_, i)| i).collect()
}

/// Retry tracker for failed operations.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per resource.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Check if retries are exhausted for a resource.
    pub fn is_exhausted(&self, resource_key: &str) -> bool {
        let Some((count, first)) = self.failures.get(resource_key) else {
            return false;
        };

        let now = Instant::now();
        if now.duration_since(*first) > self.window {
            return false;
        }

        *count > self.max_retries
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }

    /// Number of resources with tracked failures.
    pub fn tracked(&self) -> usize {
        self.failures.len()
    }
}

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2.0_f64.powi(attempt.min(30) as i32);
        let delay = (self.base.as_millis() as f64 * exp).min(self.max.as_millis() as f64);

        let jitter = delay * self.jitter.clamp(0.0, 1.0) * unit_noise();
        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

/// Pseudo-random value in `[-1.0, 1.0]` from the clock's sub-second nanos.
fn unit_noise() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default() as u64;
    let mixed = nanos.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (mixed >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0
}

/// Default retry limit per instance inside the retry window.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes
