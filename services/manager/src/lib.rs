//! Flotilla Fleet Manager Library
//!
//! The fleet manager keeps a set of worker processes on one host converged
//! on a desired configuration document published through a config channel.
//! Each worker runs a named worker class in its own OS process.
//!
//! ## Architecture
//!
//! ```text
//! ConfigChannel ──notify──> ReconciliationEngine ──start/stop──> Launcher
//!                                  │                               │
//!                             PluginRegistry                 WorkerProcess(id)
//! ```
//!
//! ## Modules
//!
//! - `engine`: Reconciliation passes and ownership of running workers
//! - `registry`: Worker class name to entry point
//! - `launcher`: Launcher interface plus a mock for tests
//! - `process`: OS process launcher (process groups, SIGTERM then SIGKILL)
//! - `runners`: Built-in worker entry points
//! - `worker`: Entry of a launched worker process

pub mod config;
pub mod engine;
pub mod launcher;
pub mod process;
pub mod registry;
pub mod runners;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use engine::{
    EmptyDocumentPolicy, EngineConfig, EngineError, ReconcileReport, ReconciliationEngine,
    StartFailure, WorkerStatus,
};
pub use launcher::{LaunchError, LaunchEvent, LaunchRequest, Launcher, MockLauncher, WorkerProcess};
pub use process::ProcessLauncher;
pub use registry::{PluginRegistry, WorkerRunner};
