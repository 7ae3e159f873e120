use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    UnknownModuleReference,
    IllegalRoleDependency,
    CyclicDependency,
    UnresolvedRequiredConnector,
    IncompatibleCapability,
    DependentsStillActive,
    PauseDependencyFailed,
    InvalidInput,
    UnknownImplementation,
    InvalidTransition,
    TaskAlreadyActive,
    ConflictingTaskRunning,
    PauseDeclined,
    LoadFailure,
    ActivationFailure,
    DeactivationFailure,
    TaskHookFailure,
    Cancelled,
    Timeout,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub module: Option<String>,
    pub task: Option<String>,
    pub kind: CoreErrorKind,
    pub message: String,
    pub related: Vec<String>,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            module: None,
            task: None,
            kind,
            message: message.into(),
            related: Vec::new(),
        }
    }

    pub fn for_module(
        module: impl Into<String>,
        kind: CoreErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            module: Some(module.into()),
            ..Self::new(kind, message)
        }
    }

    pub fn for_task(task: impl Into<String>, kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: Some(task.into()),
            ..Self::new(kind, message)
        }
    }

    pub fn with_related(mut self, related: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.related = related.into_iter().map(Into::into).collect();
        self
    }

    /// Fills in attribution the error does not already carry.
    pub fn attribute_module(mut self, module: &str) -> Self {
        if self.module.is_none() {
            self.module = Some(module.to_string());
        }
        self
    }

    pub fn attribute_task(mut self, task: &str) -> Self {
        if self.task.is_none() {
            self.task = Some(task.to_string());
        }
        self
    }

    /// A std lock whose holder panicked.
    pub fn poisoned(what: &str) -> Self {
        Self::new(CoreErrorKind::Internal, format!("{what} lock poisoned"))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
