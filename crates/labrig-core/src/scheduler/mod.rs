//! Pausable task scheduler.
//!
//! Tasks are started by name from the declaration store. A task's
//! `pausetasks` are paused (cooperatively, at a checkpoint of their choosing)
//! before it enters `Running`; its `needsmodules` are resolved against the
//! live modules like connectors and stay retained until the task ends.
//! Paused tasks are never resumed implicitly.

mod state;

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinError;
use tokio::time::timeout;

use crate::declaration::{DeclarationStore, DeclaredTask};
use crate::implementation::{PauseDecision, TaskImplementation};
use crate::lifecycle::{BoxFuture, ConnectorOwner, TaskHost, TaskStopper, resolve_connectors};
use crate::models::{CoreError, CoreErrorKind, CoreResult, TaskSnapshot, TaskStatus};

use state::{EntryGate, SchedulerState};

pub type SchedulerResult<T> = Result<T, CoreError>;

#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    declarations: RwLock<Arc<DeclarationStore>>,
    modules: Arc<dyn TaskHost>,
    state: Mutex<SchedulerState>,
    changed: Notify,
}

enum Step {
    Done(TaskSnapshot),
    Wait,
    Begin(Arc<dyn TaskImplementation>),
    Refused(CoreError),
}

enum StartStep {
    Proceed,
    Wait,
    Pause(String, Arc<dyn TaskImplementation>),
    Finished(CoreError),
}

impl TaskScheduler {
    /// Creates a scheduler running tasks on `modules`. The host gets a weak
    /// handle back so stopping a module can stop the tasks using it.
    pub fn new(declarations: Arc<DeclarationStore>, modules: Arc<dyn TaskHost>) -> Self {
        let inner = Arc::new(SchedulerInner {
            declarations: RwLock::new(declarations),
            modules,
            state: Mutex::new(SchedulerState::default()),
            changed: Notify::new(),
        });
        let stopper: Weak<dyn TaskStopper> = Arc::downgrade(&inner) as Weak<SchedulerInner>;
        inner.modules.attach_tasks(stopper);
        Self { inner }
    }

    /// Starts a task and returns once it is `Running` or has failed.
    ///
    /// Blocks while conflicting tasks are paused or, for a concurrent mutual
    /// contender that was requested first, until that contender is paused
    /// or finished.
    pub async fn start(&self, name: &str) -> SchedulerResult<TaskSnapshot> {
        let declared = self.declared(name)?;
        let id = self.inner.with_state(|state| state.admit(&declared.spec))??;
        self.inner.changed.notify_waiters();
        tracing::info!(task = %name, id = id.0, "task start requested");

        let factory = declared.factory.clone();
        let built = tokio::task::spawn_blocking(move || factory.build()).await;
        let implementation = match settle_hook(built, name, "load") {
            Ok(implementation) => implementation,
            Err(error) => return Err(self.inner.fail(name, error)),
        };
        let modules = match resolve_connectors(
            ConnectorOwner::Task(name),
            &declared.spec.needsmodules,
            self.inner.modules.as_ref(),
        ) {
            Ok(modules) => modules,
            Err(error) => return Err(self.inner.fail(name, error)),
        };
        let retained = modules.bound_targets();
        if let Err(error) = self.inner.modules.retain(name, &retained) {
            return Err(self.inner.fail(name, error));
        }
        self.inner.with_state(|state| {
            if let Some(instance) = state.instance_mut(name) {
                instance.implementation = Some(implementation.clone());
                instance.snapshot.modules = retained;
            }
        })?;

        loop {
            let notified = self.inner.changed.notified();
            let step = self.inner.with_state(|state| match state.start_gate(name) {
                EntryGate::Proceed => {
                    state.set_status(name, TaskStatus::Running);
                    if let Some(instance) = state.instance_mut(name) {
                        instance.busy = true;
                    }
                    StartStep::Proceed
                }
                EntryGate::Wait => StartStep::Wait,
                EntryGate::Pause(target) => {
                    let paused = state
                        .instance(&target)
                        .and_then(|instance| instance.implementation.clone());
                    match paused {
                        Some(paused) => {
                            state.set_status(&target, TaskStatus::Pausing);
                            StartStep::Pause(target, paused)
                        }
                        None => StartStep::Wait,
                    }
                }
                EntryGate::Conflict(error) => {
                    state.finish(name, TaskStatus::Failed, Some(error.clone()));
                    StartStep::Finished(error)
                }
                EntryGate::Cancelled => {
                    let error = CoreError::for_task(
                        name,
                        CoreErrorKind::Cancelled,
                        "start cancelled by a stop request",
                    );
                    state.finish(name, TaskStatus::Stopped, Some(error.clone()));
                    StartStep::Finished(error)
                }
            })?;

            match step {
                StartStep::Proceed => {
                    self.inner.changed.notify_waiters();
                    break;
                }
                StartStep::Wait => notified.await,
                StartStep::Pause(target, paused) => {
                    self.inner.changed.notify_waiters();
                    tracing::info!(task = %name, paused = %target, "pausing conflicting task");
                    if let Err(error) = self.inner.checkpoint(&target, paused).await {
                        let error = CoreError::for_task(
                            name,
                            CoreErrorKind::PauseDependencyFailed,
                            format!("task '{target}' did not pause: {}", error.message),
                        )
                        .with_related([target.as_str()]);
                        return Err(self.inner.fail(name, error));
                    }
                }
                StartStep::Finished(error) => {
                    self.inner.modules.release(name);
                    self.inner.changed.notify_waiters();
                    tracing::warn!(task = %name, kind = ?error.kind, error = %error.message, "task did not start");
                    return Err(error);
                }
            }
        }

        let hook = implementation.clone();
        let started = tokio::task::spawn_blocking(move || hook.on_start(&modules)).await;
        if let Err(error) = settle_hook(started, name, "start") {
            return Err(self.inner.fail(name, error));
        }
        let snapshot = self.inner.with_state(|state| {
            let instance = state.instance_mut(name)?;
            instance.busy = false;
            Some(instance.snapshot.clone())
        })?;
        self.inner.changed.notify_waiters();
        tracing::info!(task = %name, "task running");
        snapshot.ok_or_else(|| not_started(name))
    }

    /// Asks a running task to pause at its next checkpoint.
    pub async fn pause(&self, name: &str) -> SchedulerResult<TaskSnapshot> {
        loop {
            let notified = self.inner.changed.notified();
            let step = self.inner.with_state(|state| {
                let Some(instance) = state.instance(name) else {
                    return Step::Refused(not_started(name));
                };
                if instance.busy {
                    return Step::Wait;
                }
                match (instance.status(), instance.implementation.clone()) {
                    (TaskStatus::Paused, _) => Step::Done(instance.snapshot.clone()),
                    (TaskStatus::Pausing | TaskStatus::Resuming, _) => Step::Wait,
                    (TaskStatus::Running, Some(implementation)) => {
                        state.set_status(name, TaskStatus::Pausing);
                        Step::Begin(implementation)
                    }
                    (status, _) => Step::Refused(invalid_transition(name, "pause", status)),
                }
            })?;

            match step {
                Step::Done(snapshot) => return Ok(snapshot),
                Step::Wait => notified.await,
                Step::Refused(error) => return Err(error),
                Step::Begin(implementation) => {
                    self.inner.changed.notify_waiters();
                    self.inner.checkpoint(name, implementation).await?;
                    return self.snapshot(name);
                }
            }
        }
    }

    /// Resumes a paused task. Refused while any task it conflicts with is
    /// still active and not paused.
    pub async fn resume(&self, name: &str) -> SchedulerResult<TaskSnapshot> {
        let implementation = loop {
            let notified = self.inner.changed.notified();
            let step = self.inner.with_state(|state| {
                let Some(instance) = state.instance(name) else {
                    return Step::Refused(not_started(name));
                };
                if instance.busy {
                    return Step::Wait;
                }
                match (instance.status(), instance.implementation.clone()) {
                    (TaskStatus::Running, _) => Step::Done(instance.snapshot.clone()),
                    (TaskStatus::Pausing | TaskStatus::Resuming, _) => Step::Wait,
                    (TaskStatus::Paused, Some(implementation)) => {
                        if let Some(conflict) = state.resume_conflict(name) {
                            return Step::Refused(conflict);
                        }
                        state.set_status(name, TaskStatus::Resuming);
                        Step::Begin(implementation)
                    }
                    (status, _) => Step::Refused(invalid_transition(name, "resume", status)),
                }
            })?;

            match step {
                Step::Done(snapshot) => return Ok(snapshot),
                Step::Wait => notified.await,
                Step::Refused(error) => return Err(error),
                Step::Begin(implementation) => break implementation,
            }
        };
        self.inner.changed.notify_waiters();

        let resumed = tokio::task::spawn_blocking(move || implementation.on_resume()).await;
        if let Err(error) = settle_hook(resumed, name, "resume") {
            return Err(self.inner.fail(name, error));
        }
        self.inner
            .with_state(|state| state.set_status(name, TaskStatus::Running))?;
        self.inner.changed.notify_waiters();
        tracing::info!(task = %name, "task resumed");
        self.snapshot(name)
    }

    /// Stops a running or paused task. A task still starting has its start
    /// cancelled and ends `Stopped`.
    pub async fn stop(&self, name: &str) -> SchedulerResult<TaskSnapshot> {
        let implementation = loop {
            let notified = self.inner.changed.notified();
            let mut cancelled_start = false;
            let step = self.inner.with_state(|state| {
                let Some(instance) = state.instance_mut(name) else {
                    return Step::Refused(not_started(name));
                };
                if !instance.is_live() {
                    return Step::Done(instance.snapshot.clone());
                }
                if instance.status() == TaskStatus::Starting {
                    if !instance.cancel_requested {
                        instance.cancel_requested = true;
                        cancelled_start = true;
                    }
                    return Step::Wait;
                }
                if instance.busy {
                    return Step::Wait;
                }
                match (instance.status(), instance.implementation.clone()) {
                    (TaskStatus::Running | TaskStatus::Paused, Some(implementation)) => {
                        state.set_status(name, TaskStatus::Stopping);
                        Step::Begin(implementation)
                    }
                    (TaskStatus::Running | TaskStatus::Paused, None) => Step::Refused(
                        CoreError::for_task(name, CoreErrorKind::Internal, "live task has no implementation"),
                    ),
                    _ => Step::Wait,
                }
            })?;

            match step {
                Step::Done(snapshot) => return Ok(snapshot),
                Step::Refused(error) => return Err(error),
                Step::Wait => {
                    if cancelled_start {
                        tracing::info!(task = %name, "cancelling task start");
                        self.inner.changed.notify_waiters();
                    }
                    notified.await;
                }
                Step::Begin(implementation) => break implementation,
            }
        };
        self.inner.changed.notify_waiters();

        let stopped = tokio::task::spawn_blocking(move || implementation.on_stop()).await;
        if let Err(error) = settle_hook(stopped, name, "stop") {
            return Err(self.inner.fail(name, error));
        }
        self.inner
            .with_state(|state| state.finish(name, TaskStatus::Stopped, None))?;
        self.inner.modules.release(name);
        self.inner.changed.notify_waiters();
        tracing::info!(task = %name, "task stopped");
        self.snapshot(name)
    }

    pub fn snapshot(&self, name: &str) -> SchedulerResult<TaskSnapshot> {
        self.inner
            .with_state(|state| state.instance(name).map(|instance| instance.snapshot.clone()))?
            .ok_or_else(|| not_started(name))
    }

    /// `Idle` for declared tasks that were never started.
    pub fn status(&self, name: &str) -> SchedulerResult<TaskStatus> {
        let current = self
            .inner
            .with_state(|state| state.instance(name).map(|instance| instance.status()))?;
        match current {
            Some(status) => Ok(status),
            None => {
                self.declared(name)?;
                Ok(TaskStatus::Idle)
            }
        }
    }

    /// Latest snapshot of every task that was started, sorted by name.
    pub fn snapshots(&self) -> SchedulerResult<Vec<TaskSnapshot>> {
        self.inner.with_state(|state| state.snapshots())
    }

    pub async fn wait_for_status(
        &self,
        name: &str,
        status: TaskStatus,
        timeout_duration: Option<Duration>,
    ) -> SchedulerResult<TaskSnapshot> {
        loop {
            let notified = self.inner.changed.notified();
            let current = self.status(name)?;
            if current == status {
                return self.snapshot(name);
            }

            match timeout_duration {
                Some(duration) => timeout(duration, notified).await.map_err(|_| {
                    CoreError::for_task(
                        name,
                        CoreErrorKind::Timeout,
                        format!("timed out waiting for {status:?}, task is {current:?}"),
                    )
                })?,
                None => notified.await,
            }
        }
    }

    /// Swaps the task declarations. Refused while any task is live.
    pub fn replace_declarations(&self, declarations: Arc<DeclarationStore>) -> SchedulerResult<()> {
        if self.inner.with_state(|state| state.has_live())? {
            return Err(CoreError::new(
                CoreErrorKind::InvalidTransition,
                "task declarations cannot change while tasks are live",
            ));
        }
        let mut current = self
            .inner
            .declarations
            .write()
            .map_err(|_| CoreError::poisoned("task declarations"))?;
        *current = declarations;
        Ok(())
    }

    fn declared(&self, name: &str) -> SchedulerResult<DeclaredTask> {
        let declarations = self
            .inner
            .declarations
            .read()
            .map_err(|_| CoreError::poisoned("task declarations"))?;
        declarations.task(name).cloned().ok_or_else(|| {
            CoreError::for_task(
                name,
                CoreErrorKind::InvalidInput,
                format!("task '{name}' is not declared"),
            )
        })
    }
}

impl SchedulerInner {
    fn with_state<R>(&self, change: impl FnOnce(&mut SchedulerState) -> R) -> SchedulerResult<R> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| CoreError::poisoned("task scheduler"))?;
        Ok(change(&mut state))
    }

    fn fail(&self, name: &str, error: CoreError) -> CoreError {
        let error = error.attribute_task(name);
        tracing::error!(task = %name, kind = ?error.kind, error = %error.message, "task failed");
        if let Err(lock_error) =
            self.with_state(|state| state.finish(name, TaskStatus::Failed, Some(error.clone())))
        {
            return lock_error;
        }
        self.modules.release(name);
        self.changed.notify_waiters();
        error
    }

    /// Runs the pause checkpoint of a task already moved to `Pausing`.
    async fn checkpoint(
        &self,
        name: &str,
        implementation: Arc<dyn TaskImplementation>,
    ) -> SchedulerResult<()> {
        let decision =
            tokio::task::spawn_blocking(move || implementation.on_pause_checkpoint()).await;
        let outcome = match decision {
            Ok(PauseDecision::Acknowledge) => {
                self.with_state(|state| state.set_status(name, TaskStatus::Paused))?;
                tracing::info!(task = %name, "task paused");
                Ok(())
            }
            Ok(PauseDecision::Decline) => {
                self.with_state(|state| state.set_status(name, TaskStatus::Running))?;
                tracing::warn!(task = %name, "task declined to pause");
                Err(CoreError::for_task(
                    name,
                    CoreErrorKind::PauseDeclined,
                    "task declined the pause request",
                ))
            }
            Err(join_error) => {
                let error = CoreError::for_task(
                    name,
                    CoreErrorKind::TaskHookFailure,
                    format!("pause checkpoint did not complete: {join_error}"),
                );
                return Err(self.fail(name, error));
            }
        };
        self.changed.notify_waiters();
        outcome
    }
}

impl TaskStopper for SchedulerInner {
    fn stop_tasks(self: Arc<Self>, names: Vec<String>) -> BoxFuture<'static, Vec<CoreError>> {
        let scheduler = TaskScheduler { inner: self };
        Box::pin(async move {
            let mut errors = Vec::new();
            for name in names {
                if let Err(error) = scheduler.stop(&name).await {
                    errors.push(error);
                }
            }
            errors
        })
    }
}

fn settle_hook<T>(
    joined: Result<CoreResult<T>, JoinError>,
    task: &str,
    stage: &str,
) -> SchedulerResult<T> {
    match joined {
        Ok(result) => result.map_err(|error| error.attribute_task(task)),
        Err(join_error) => Err(CoreError::for_task(
            task,
            CoreErrorKind::TaskHookFailure,
            format!("{stage} hook did not complete: {join_error}"),
        )),
    }
}

fn not_started(name: &str) -> CoreError {
    CoreError::for_task(
        name,
        CoreErrorKind::InvalidInput,
        format!("task '{name}' has not been started"),
    )
}

fn invalid_transition(name: &str, operation: &str, status: TaskStatus) -> CoreError {
    CoreError::for_task(
        name,
        CoreErrorKind::InvalidTransition,
        format!("cannot {operation} a task that is {status:?}"),
    )
}
