use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::{ConnectorBinding, CoreError};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TaskId(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Starting,
    Running,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Stopped,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if next == Self::Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Self::Idle, Self::Starting)
                | (Self::Starting, Self::Running)
                | (Self::Starting, Self::Stopped)
                | (Self::Running, Self::Pausing)
                | (Self::Pausing, Self::Paused)
                | (Self::Pausing, Self::Running)
                | (Self::Paused, Self::Resuming)
                | (Self::Resuming, Self::Running)
                | (Self::Running, Self::Stopping)
                | (Self::Paused, Self::Stopping)
                | (Self::Stopping, Self::Stopped)
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub implementation: String,
    pub pausetasks: Vec<String>,
    pub needsmodules: Vec<ConnectorBinding>,
}

impl TaskSpec {
    pub fn pauses(&self, task: &str) -> bool {
        self.pausetasks.iter().any(|name| name == task)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub requested_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub modules: Vec<String>,
    pub error: Option<CoreError>,
}
