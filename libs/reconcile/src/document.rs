//! The desired-configuration document and its worker entries.
//!
//! Wire shape:
//!
//! ```json
//! { "workers": [ { "id": "w1", "worker_cls": "EchoWorker", "output": "o1" } ] }
//! ```
//!
//! Every field besides `id` and `worker_cls` is a *setting*. The config handed
//! to a worker is the entry without its `id`, so it carries `worker_cls` and
//! all settings.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Opaque worker configuration (a JSON object).
pub type WorkerConfig = serde_json::Map<String, Value>;

/// Wire key naming the worker class.
pub const WORKER_CLASS_KEY: &str = "worker_cls";

/// Wire key naming the worker id.
pub const WORKER_ID_KEY: &str = "id";

/// Errors raised while parsing or editing a document.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// Text is not a JSON document of the expected shape.
    #[error("malformed document: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Document parsed but carries no `workers` list.
    #[error("document has no `workers` list")]
    MissingWorkers,

    /// Two entries share an id.
    #[error("duplicate worker id: {0}")]
    DuplicateWorkerId(String),

    /// An entry has an empty id.
    #[error("worker id must not be empty")]
    EmptyWorkerId,

    /// A setting uses a key reserved for the entry itself.
    #[error("setting `{key}` on worker {id} is reserved")]
    ReservedField { id: String, key: String },
}

/// One entry in the desired configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Worker slot identity, unique within a document.
    pub id: String,

    /// Name resolved against the plugin registry.
    #[serde(rename = "worker_cls")]
    pub worker_class: String,

    /// Extra fields, passed through to the worker untouched.
    #[serde(flatten)]
    pub settings: WorkerConfig,
}

impl WorkerSpec {
    /// Build a spec, rejecting settings that collide with reserved keys.
    pub fn new(
        id: impl Into<String>,
        worker_class: impl Into<String>,
        settings: WorkerConfig,
    ) -> Result<Self, DocumentError> {
        let spec = Self {
            id: id.into(),
            worker_class: worker_class.into(),
            settings,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Check the entry on its own (id and reserved keys).
    pub fn validate(&self) -> Result<(), DocumentError> {
        if self.id.is_empty() {
            return Err(DocumentError::EmptyWorkerId);
        }
        for key in [WORKER_ID_KEY, WORKER_CLASS_KEY] {
            if self.settings.contains_key(key) {
                return Err(DocumentError::ReservedField {
                    id: self.id.clone(),
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }

    /// The config passed to the worker: the entry minus its `id`.
    pub fn config(&self) -> WorkerConfig {
        let mut config = self.settings.clone();
        config.insert(
            WORKER_CLASS_KEY.to_string(),
            Value::String(self.worker_class.clone()),
        );
        config
    }
}

#[derive(Deserialize)]
struct RawDocument {
    #[serde(default)]
    workers: Option<Vec<WorkerSpec>>,
}

/// The single value held by the config channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DesiredConfigDocument {
    pub workers: Vec<WorkerSpec>,
}

impl DesiredConfigDocument {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a document from entries, enforcing id uniqueness.
    pub fn from_workers(workers: Vec<WorkerSpec>) -> Result<Self, DocumentError> {
        let document = Self { workers };
        document.validate()?;
        Ok(document)
    }

    /// Parse document text.
    ///
    /// Absent `workers`, bad JSON and duplicate ids are all errors; callers
    /// decide whether an error means "no instruction".
    pub fn parse(text: &str) -> Result<Self, DocumentError> {
        let raw: RawDocument = serde_json::from_str(text)?;
        let workers = raw.workers.ok_or(DocumentError::MissingWorkers)?;
        Self::from_workers(workers)
    }

    /// Serialize to the wire form.
    pub fn to_json(&self) -> Result<String, DocumentError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Check every entry and id uniqueness.
    pub fn validate(&self) -> Result<(), DocumentError> {
        let mut seen = HashSet::with_capacity(self.workers.len());
        for spec in &self.workers {
            spec.validate()?;
            if !seen.insert(spec.id.as_str()) {
                return Err(DocumentError::DuplicateWorkerId(spec.id.clone()));
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&WorkerSpec> {
        self.workers.iter().find(|w| w.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut WorkerSpec> {
        self.workers.iter_mut().find(|w| w.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Append an entry. Fails on a duplicate id.
    pub fn insert(&mut self, spec: WorkerSpec) -> Result<(), DocumentError> {
        spec.validate()?;
        if self.contains(&spec.id) {
            return Err(DocumentError::DuplicateWorkerId(spec.id));
        }
        self.workers.push(spec);
        Ok(())
    }

    /// Remove an entry, preserving the order of the rest.
    pub fn remove(&mut self, id: &str) -> Option<WorkerSpec> {
        let index = self.workers.iter().position(|w| w.id == id)?;
        Some(self.workers.remove(index))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.workers.iter().map(|w| w.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
