use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use crate::lifecycle::{LifecycleResult, ModuleLookup};
use crate::models::CoreError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Stops tasks when a cascade reaches the modules they run on.
pub trait TaskStopper: Send + Sync {
    /// Stops every named task; returns the errors of those that did not
    /// stop cleanly.
    fn stop_tasks(self: Arc<Self>, names: Vec<String>) -> BoxFuture<'static, Vec<CoreError>>;
}

/// Module side of task execution.
///
/// A task retains the modules its `needsmodules` bound for as long as it is
/// live, so those modules count as in use when someone tries to stop them.
pub trait TaskHost: ModuleLookup {
    /// Records `task` as a user of every module in `modules`. Nothing is
    /// recorded when one of them is not activated or is being stopped.
    fn retain(&self, task: &str, modules: &[String]) -> LifecycleResult<()>;

    fn release(&self, task: &str);

    /// Lets cascades stop retaining tasks. Only a weak reference is kept.
    fn attach_tasks(&self, stopper: Weak<dyn TaskStopper>);
}
