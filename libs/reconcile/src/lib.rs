//! Reconciliation primitives for worker fleets.
//!
//! This library holds the pieces of the reconciliation loop that need no I/O:
//!
//! - **Desired state**: the [`DesiredConfigDocument`] published on the config
//!   channel.
//! - **Current state**: the configs that running workers were started with.
//! - **Plan**: [`plan_actions`] diffs the two into starts, restarts and stops.
//!
//! # Invariants
//!
//! - Planning is deterministic given the same inputs
//! - Executing a plan and planning again yields a no-op plan
//! - A running worker whose config differs from its spec is always restarted

pub mod document;
pub mod plan;

use sha2::{Digest, Sha256};

pub use document::{
    DesiredConfigDocument, DocumentError, WorkerConfig, WorkerSpec, WORKER_CLASS_KEY,
    WORKER_ID_KEY,
};
pub use plan::{plan_actions, ReconcilePlan};

/// Convergence status of the running set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Running set matches the desired document.
    Converged,

    /// Actions remain to be executed.
    Converging,

    /// Some specs can never be satisfied (unknown worker class).
    Diverged,
}

impl ConvergenceStatus {
    /// Returns true if the running set has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

/// A config fingerprint for logs and status output.
///
/// Equal configs hash equal regardless of key order.
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

    /// Compute the hash of a worker config.
    pub fn of_config(config: &WorkerConfig) -> Self {
        Self::from_json(&serde_json::Value::Object(config.clone()))
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
                .map(|(k, v)| format!("{}:{}", quote(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => quote(s),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn quote(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}
