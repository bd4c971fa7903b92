//! Plugin registry: worker class name -> entry point.
//!
//! Worker types are contributed by explicit registration. Anything that
//! implements [`WorkerRunner`] can be registered under a name; external
//! plugins are executables found in a plugin directory.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use flotilla_channel::ConnectionInfo;
use flotilla_reconcile::WorkerConfig;
use tracing::{debug, info, warn};

use crate::runners::{CommandRunner, EchoWorker};

/// A worker entry point.
///
/// `run` is the top-level function of a worker process and is not expected
/// to return while the worker is wanted.
#[async_trait]
pub trait WorkerRunner: Send + Sync {
    async fn run(&self, config: WorkerConfig, connection: ConnectionInfo) -> anyhow::Result<()>;
}

/// Known worker implementations keyed by class name.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    runners: HashMap<String, Arc<dyn WorkerRunner>>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding only the built-in worker classes.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtin(EchoWorker::NAME, EchoWorker);
        registry
    }

    /// Built-ins plus whatever `plugin_dir` contributes.
    pub fn bootstrap(plugin_dir: Option<&Path>) -> Self {
        let mut registry = Self::with_builtins();
        let discovered = registry.discover_external(plugin_dir);
        info!(
            builtin = registry.len() - discovered,
            discovered,
            "Plugin registry ready"
        );
        registry
    }

    /// Register a built-in worker class.
    pub fn register_builtin<R>(&mut self, name: &str, runner: R)
    where
        R: WorkerRunner + 'static,
    {
        debug!(worker_class = %name, "Registering built-in worker");
        self.register(name, Arc::new(runner));
    }

    /// Register a worker class, replacing any previous entry of that name.
    pub fn register(&mut self, name: &str, runner: Arc<dyn WorkerRunner>) {
        if self.runners.insert(name.to_string(), runner).is_some() {
            warn!(worker_class = %name, "Worker class registered twice, keeping the latest");
        }
    }

    /// Register every executable in `source` under its file name.
    ///
    /// Discovery is best effort: a missing or unreadable directory registers
    /// nothing. Names already taken (e.g. built-ins) are not overridden.
    /// Returns the number of plugins registered.
    pub fn discover_external(&mut self, source: Option<&Path>) -> usize {
        let Some(dir) = source else {
            return 0;
        };

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    plugin_dir = %dir.display(),
                    error = %e,
                    "Plugin directory unavailable, skipping discovery"
                );
                return 0;
            }
        };

        let mut discovered = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') || !is_executable(&path) {
                continue;
            }
            if self.runners.contains_key(name) {
                warn!(worker_class = %name, plugin = %path.display(), "Plugin name already registered, skipping");
                continue;
            }

            info!(worker_class = %name, plugin = %path.display(), "Discovered external plugin");
            self.runners
                .insert(name.to_string(), Arc::new(CommandRunner::new(path.clone())));
            discovered += 1;
        }
        discovered
    }

    /// Look up the entry point for a worker class.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn WorkerRunner>> {
        self.runners.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.runners.contains_key(name)
    }

    /// Registered class names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runners.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
