//! Diff planner: desired document vs. running workers.
//!
//! The planner is pure. It decides which workers to start, restart and stop;
//! executing the plan (and serializing passes) belongs to the caller.

use std::collections::{BTreeMap, HashSet};

use crate::document::{DesiredConfigDocument, WorkerConfig, WorkerSpec};
use crate::ConvergenceStatus;

/// Actions that bring the running set to the desired document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    /// New ids to start.
    pub start: Vec<WorkerSpec>,

    /// Running ids whose config changed: terminate, then start.
    pub restart: Vec<WorkerSpec>,

    /// Running ids to terminate and forget.
    pub stop: Vec<String>,

    /// Running ids already matching their spec.
    pub unchanged: Vec<String>,

    /// Specs whose class did not resolve. Never started.
    pub unresolved: Vec<WorkerSpec>,
}

impl ReconcilePlan {
    /// True when executing the plan would touch no process.
    pub fn is_noop(&self) -> bool {
        self.start.is_empty() && self.restart.is_empty() && self.stop.is_empty()
    }

    /// Convergence of the running set before the plan is executed.
    pub fn status(&self) -> ConvergenceStatus {
        if !self.unresolved.is_empty() {
            ConvergenceStatus::Diverged
        } else if self.is_noop() {
            ConvergenceStatus::Converged
        } else {
            ConvergenceStatus::Converging
        }
    }
}

/// Compute the plan for one reconciliation pass.
///
/// `current` yields `(id, config)` for every running worker, where `config`
/// is the value the worker was last started with. `is_resolvable` reports
/// whether a worker class has an entry point.
///
/// A running id whose spec no longer resolves is stopped: only resolvable
/// specs may keep a process.
pub fn plan_actions<'a, I, R>(
    desired: &DesiredConfigDocument,
    current: I,
    is_resolvable: R,
) -> ReconcilePlan
where
    I: IntoIterator<Item = (&'a str, &'a WorkerConfig)>,
    R: Fn(&str) -> bool,
{
    let current: BTreeMap<&str, &WorkerConfig> = current.into_iter().collect();
    let mut plan = ReconcilePlan::default();
    let mut keep: HashSet<&str> = HashSet::with_capacity(desired.len());

    for spec in &desired.workers {
        if !is_resolvable(&spec.worker_class) {
            plan.unresolved.push(spec.clone());
            continue;
        }
        keep.insert(spec.id.as_str());

        match current.get(spec.id.as_str()) {
            None => plan.start.push(spec.clone()),
            Some(running) if **running == spec.config() => {
                plan.unchanged.push(spec.id.clone());
            }
            Some(_) => plan.restart.push(spec.clone()),
        }
    }

    plan.stop = current
        .keys()
        .filter(|id| !keep.contains(*id))
        .map(|id| id.to_string())
        .collect();

    plan
}
