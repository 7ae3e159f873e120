use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::implementation::ResolvedConnectors;
use crate::models::{CoreResult, TaskDescriptor};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PauseDecision {
    Acknowledge,
    Decline,
}

/// Contract for task implementations.
///
/// Pausing is cooperative: `on_pause_checkpoint` returns once the task has
/// reached a point where it is safe to hold, or declines.
pub trait TaskImplementation: Send + Sync {
    fn on_start(&self, modules: &ResolvedConnectors) -> CoreResult<()>;

    fn on_pause_checkpoint(&self) -> PauseDecision;

    fn on_resume(&self) -> CoreResult<()>;

    fn on_stop(&self) -> CoreResult<()>;
}

pub type TaskBuilder = Arc<dyn Fn() -> CoreResult<Arc<dyn TaskImplementation>> + Send + Sync>;

#[derive(Clone)]
pub struct TaskFactory {
    descriptor: TaskDescriptor,
    build: TaskBuilder,
}

impl TaskFactory {
    pub fn new<F>(descriptor: TaskDescriptor, build: F) -> Self
    where
        F: Fn() -> CoreResult<Arc<dyn TaskImplementation>> + Send + Sync + 'static,
    {
        Self {
            descriptor,
            build: Arc::new(build),
        }
    }

    pub fn descriptor(&self) -> &TaskDescriptor {
        &self.descriptor
    }

    pub fn build(&self) -> CoreResult<Arc<dyn TaskImplementation>> {
        (self.build)()
    }
}

impl Debug for TaskFactory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFactory")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}
