//! Module lifecycle: activation in dependency order, cascade-aware stops,
//! reloads, connector resolution and the modules tasks run on.

mod controller;
mod resolver;
mod users;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, ModuleRole, ModuleState};

pub use controller::LifecycleController;
pub use resolver::{ConnectorOwner, ModuleLookup, resolve_connectors};
pub use users::{BoxFuture, TaskHost, TaskStopper};

pub type LifecycleResult<T> = Result<T, CoreError>;

/// What `stop` does when the module still has active dependents.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadePolicy {
    #[default]
    Reject,
    Cascade,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub cascade: CascadePolicy,
}

impl ControllerConfig {
    pub fn cascading() -> Self {
        Self {
            cascade: CascadePolicy::Cascade,
        }
    }
}

/// Checked before each module's own hook begins; a hook that already
/// started always runs to completion.
#[derive(Clone, Debug, Default)]
pub struct LifecycleCancellationToken {
    flag: Arc<AtomicBool>,
}

impl LifecycleCancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModuleFailure {
    pub module: String,
    pub error: CoreError,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SkippedModule {
    pub module: String,
    /// Required dependencies that were not activated when this module's turn
    /// came.
    pub blocked_by: Vec<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StartReport {
    pub activated: Vec<String>,
    pub already_active: Vec<String>,
    pub skipped: Vec<SkippedModule>,
    pub errored: Vec<ModuleFailure>,
    pub cancelled: Vec<String>,
}

impl StartReport {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty() && self.errored.is_empty() && self.cancelled.is_empty()
    }

    pub fn skipped_names(&self) -> Vec<&str> {
        self.skipped
            .iter()
            .map(|skipped| skipped.module.as_str())
            .collect()
    }

    pub fn errored_names(&self) -> Vec<&str> {
        self.errored
            .iter()
            .map(|failure| failure.module.as_str())
            .collect()
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StopReport {
    pub stopped: Vec<String>,
    pub errored: Vec<ModuleFailure>,
    pub cancelled: Vec<String>,
}

impl StopReport {
    pub fn is_complete(&self) -> bool {
        self.errored.is_empty() && self.cancelled.is_empty()
    }

    fn merge(&mut self, other: StopReport) {
        self.stopped.extend(other.stopped);
        self.errored.extend(other.errored);
        self.cancelled.extend(other.cancelled);
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReloadReport {
    pub stop: StopReport,
    pub start: StartReport,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModuleSnapshot {
    pub name: String,
    pub role: ModuleRole,
    pub implementation: String,
    pub state: ModuleState,
    /// Connector name to bound target; `None` while inactive or absent.
    pub connectors: BTreeMap<String, Option<String>>,
    pub dependents: Vec<String>,
    /// Live tasks running on this module.
    pub task_users: Vec<String>,
    pub remote_access: bool,
    pub last_error: Option<CoreError>,
}
