//! Reconciliation loop primitives.
//!
//! This library provides the pure half of the agent's control loop: given
//! what a container *should* be doing and what the runtime says it *is*
//! doing, decide which single corrective action to take.
//!
//! - **Desired status**: persisted per container by lifecycle calls.
//! - **Observed status**: derived from the runtime task on every tick.
//! - **State change**: the one command (start, stop or no-op) that moves
//!   observed toward desired.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - A converged container always produces a no-op
//! - State changes are never persisted; they are recomputed every tick

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A persisted status string could not be parsed.
    #[error("invalid status: {0}")]
    InvalidStatus(String),
}

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

// ============================================================================
// Statuses
// ============================================================================

/// What the supervisor wants a container to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredStatus {
    Running,
    Stopped,
}

impl DesiredStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for DesiredStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DesiredStatus {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            other => Err(ReconcileError::InvalidStatus(other.to_string())),
        }
    }
}

/// What the runtime reports a container is doing.
///
/// A paused task counts as running: pause is a transient guard around
/// mutations, not a state the loop should correct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedStatus {
    Running,
    Stopped,
}

impl ObservedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ObservedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// State changes
// ============================================================================

/// The single corrective action for one container in one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    Start,
    Stop,
    NoOp,
}

impl StateChange {
    /// Decide the action that moves `observed` toward `desired`.
    pub fn compute(desired: DesiredStatus, observed: ObservedStatus) -> Self {
        match (desired, observed) {
            (DesiredStatus::Running, ObservedStatus::Stopped) => Self::Start,
            (DesiredStatus::Stopped, ObservedStatus::Running) => Self::Stop,
            _ => Self::NoOp,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::NoOp => "noop",
        }
    }
}

impl fmt::Display for StateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change bound to the container it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    pub container_id: String,
    pub change: StateChange,
}

/// Compute the diffs for one tick.
///
/// The output preserves input order and contains exactly one entry per
/// container, including no-ops.
pub fn plan<I, S>(observations: I) -> Vec<Diff>
where
    I: IntoIterator<Item = (S, DesiredStatus, ObservedStatus)>,
    S: Into<String>,
{
    observations
        .into_iter()
        .map(|(id, desired, observed)| Diff {
            container_id: id.into(),
            change: StateChange::compute(desired, observed),
        })
        .collect()
}

// ============================================================================
// Spec hashing
// ============================================================================

/// A spec hash for deterministic comparison.
///
/// Used to detect when a container's declared configuration has changed.
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

    /// Compute a spec hash from any serializable value.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::from_json(&serde_json::to_value(value)?))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpecHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
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
