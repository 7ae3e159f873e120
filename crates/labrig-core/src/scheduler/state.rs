use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use crate::implementation::TaskImplementation;
use crate::models::{CoreError, CoreErrorKind, TaskId, TaskSnapshot, TaskSpec, TaskStatus};
use crate::scheduler::SchedulerResult;

pub(super) struct TaskInstance {
    pub snapshot: TaskSnapshot,
    pub spec: TaskSpec,
    pub implementation: Option<Arc<dyn TaskImplementation>>,
    pub request: u64,
    // mutually conflicting tasks that were still starting when this one was
    // requested
    pub contenders: BTreeSet<String>,
    pub cancel_requested: bool,
    pub busy: bool,
}

impl TaskInstance {
    pub fn status(&self) -> TaskStatus {
        self.snapshot.status
    }

    pub fn is_live(&self) -> bool {
        !self.snapshot.status.is_terminal()
    }
}

/// What a starting task does next.
#[derive(Debug, PartialEq)]
pub(super) enum EntryGate {
    Proceed,
    Wait,
    Pause(String),
    Conflict(CoreError),
    Cancelled,
}

/// Latest instance per task name; at most one of them is live.
#[derive(Default)]
pub(super) struct SchedulerState {
    next_task_id: u64,
    next_request: u64,
    tasks: HashMap<String, TaskInstance>,
}

impl SchedulerState {
    pub fn instance(&self, name: &str) -> Option<&TaskInstance> {
        self.tasks.get(name)
    }

    pub fn instance_mut(&mut self, name: &str) -> Option<&mut TaskInstance> {
        self.tasks.get_mut(name)
    }

    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        let mut snapshots: Vec<TaskSnapshot> = self
            .tasks
            .values()
            .map(|instance| instance.snapshot.clone())
            .collect();
        snapshots.sort_by(|left, right| left.name.cmp(&right.name));
        snapshots
    }

    pub fn has_live(&self) -> bool {
        self.tasks.values().any(TaskInstance::is_live)
    }

    /// Creates a new instance in `Starting`, or rejects a second live one.
    pub fn admit(&mut self, spec: &TaskSpec) -> SchedulerResult<TaskId> {
        if let Some(existing) = self.tasks.get(&spec.name)
            && existing.is_live()
        {
            return Err(CoreError::for_task(
                spec.name.as_str(),
                CoreErrorKind::TaskAlreadyActive,
                format!("task is already {:?}", existing.status()),
            ));
        }

        let id = TaskId(self.next_task_id);
        self.next_task_id = self.next_task_id.saturating_add(1);
        let request = self.next_request;
        self.next_request = self.next_request.saturating_add(1);

        let contenders = self
            .tasks
            .values()
            .filter(|other| {
                other.status() == TaskStatus::Starting
                    && spec.pauses(&other.spec.name)
                    && other.spec.pauses(&spec.name)
            })
            .map(|other| other.spec.name.clone())
            .collect();

        let mut snapshot = TaskSnapshot {
            id,
            name: spec.name.clone(),
            status: TaskStatus::Idle,
            requested_at: SystemTime::now(),
            started_at: None,
            finished_at: None,
            modules: Vec::new(),
            error: None,
        };
        transition(&mut snapshot, TaskStatus::Starting);

        self.tasks.insert(
            spec.name.clone(),
            TaskInstance {
                snapshot,
                spec: spec.clone(),
                implementation: None,
                request,
                contenders,
                cancel_requested: false,
                busy: false,
            },
        );
        Ok(id)
    }

    /// Decides whether the starting task `name` may enter `Running`.
    ///
    /// Conflicts are tasks either side lists in its pausetasks. A starting
    /// conflict requested earlier is waited for; a running one this task
    /// lists gets paused unless it won the request-order tie-break; a running
    /// one that lists this task without being listed back is a conflict.
    pub fn start_gate(&self, name: &str) -> EntryGate {
        let Some(starter) = self.tasks.get(name) else {
            return EntryGate::Conflict(CoreError::for_task(
                name,
                CoreErrorKind::Internal,
                "starting task has no instance",
            ));
        };
        if starter.cancel_requested {
            return EntryGate::Cancelled;
        }

        let mut wait = false;
        let mut pause: Option<&str> = None;
        for other in self.related(starter) {
            let starter_pauses_other = starter.spec.pauses(&other.spec.name);
            match other.status() {
                TaskStatus::Starting => {
                    if other.request < starter.request {
                        wait = true;
                    }
                }
                TaskStatus::Pausing | TaskStatus::Resuming | TaskStatus::Stopping => wait = true,
                TaskStatus::Running if other.busy => wait = true,
                TaskStatus::Running => {
                    if !starter_pauses_other {
                        return EntryGate::Conflict(
                            CoreError::for_task(
                                name,
                                CoreErrorKind::ConflictingTaskRunning,
                                format!(
                                    "task '{}' is running and requires this task paused",
                                    other.spec.name
                                ),
                            )
                            .with_related([other.spec.name.as_str()]),
                        );
                    }
                    if starter.contenders.contains(&other.spec.name) {
                        wait = true;
                    } else if pause.is_none_or(|current| other.spec.name.as_str() < current) {
                        pause = Some(other.spec.name.as_str());
                    }
                }
                TaskStatus::Idle | TaskStatus::Paused | TaskStatus::Stopped | TaskStatus::Failed => {}
            }
        }

        if wait {
            EntryGate::Wait
        } else if let Some(target) = pause {
            EntryGate::Pause(target.to_string())
        } else {
            EntryGate::Proceed
        }
    }

    /// A paused task may only resume while every task it conflicts with is
    /// paused or finished.
    pub fn resume_conflict(&self, name: &str) -> Option<CoreError> {
        let task = self.tasks.get(name)?;
        let blocking: Vec<String> = self
            .related(task)
            .filter(|other| other.status() != TaskStatus::Paused)
            .map(|other| other.spec.name.clone())
            .collect();
        if blocking.is_empty() {
            return None;
        }
        Some(
            CoreError::for_task(
                name,
                CoreErrorKind::ConflictingTaskRunning,
                format!("conflicting tasks still active: {}", blocking.join(", ")),
            )
            .with_related(blocking),
        )
    }

    pub fn set_status(&mut self, name: &str, next: TaskStatus) {
        if let Some(instance) = self.tasks.get_mut(name) {
            transition(&mut instance.snapshot, next);
        }
    }

    /// Moves a live instance to a terminal state and drops its implementation.
    pub fn finish(&mut self, name: &str, status: TaskStatus, error: Option<CoreError>) {
        if let Some(instance) = self.tasks.get_mut(name) {
            transition(&mut instance.snapshot, status);
            instance.snapshot.finished_at = Some(SystemTime::now());
            instance.snapshot.error = error;
            instance.implementation = None;
            instance.busy = false;
        }
    }

    fn related<'a>(&'a self, task: &'a TaskInstance) -> impl Iterator<Item = &'a TaskInstance> {
        self.tasks.values().filter(move |other| {
            other.spec.name != task.spec.name
                && other.is_live()
                && (task.spec.pauses(&other.spec.name) || other.spec.pauses(&task.spec.name))
        })
    }
}

fn transition(snapshot: &mut TaskSnapshot, next: TaskStatus) {
    if !snapshot.status.can_transition_to(next) {
        tracing::error!(
            task = %snapshot.name,
            from = ?snapshot.status,
            to = ?next,
            "unexpected task transition"
        );
    }
    tracing::debug!(task = %snapshot.name, from = ?snapshot.status, to = ?next, "task state transition");
    snapshot.status = next;
    if next == TaskStatus::Running && snapshot.started_at.is_none() {
        snapshot.started_at = Some(SystemTime::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, pauses: &[&str]) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            implementation: "test".to_string(),
            pausetasks: pauses.iter().map(|task| task.to_string()).collect(),
            needsmodules: Vec::new(),
        }
    }

    #[test]
    fn second_live_instance_is_rejected() {
        let mut state = SchedulerState::default();
        state.admit(&spec("scan", &[])).unwrap();
        let error = state.admit(&spec("scan", &[])).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::TaskAlreadyActive);
    }

    #[test]
    fn running_task_listed_in_pausetasks_is_paused() {
        let mut state = SchedulerState::default();
        state.admit(&spec("logging", &[])).unwrap();
        state.set_status("logging", TaskStatus::Running);
        state.admit(&spec("refill", &["logging"])).unwrap();

        assert_eq!(state.start_gate("refill"), EntryGate::Pause("logging".to_string()));
    }

    #[test]
    fn later_mutual_contender_waits_instead_of_pausing() {
        let mut state = SchedulerState::default();
        state.admit(&spec("x", &["y"])).unwrap();
        state.admit(&spec("y", &["x"])).unwrap();

        assert_eq!(state.start_gate("y"), EntryGate::Wait);
        assert_eq!(state.start_gate("x"), EntryGate::Proceed);

        state.set_status("x", TaskStatus::Running);
        assert_eq!(state.start_gate("y"), EntryGate::Wait);

        state.set_status("x", TaskStatus::Pausing);
        state.set_status("x", TaskStatus::Paused);
        assert_eq!(state.start_gate("y"), EntryGate::Proceed);
    }

    #[test]
    fn running_task_that_requires_starter_paused_is_a_conflict() {
        let mut state = SchedulerState::default();
        state.admit(&spec("refill", &["logging"])).unwrap();
        state.set_status("refill", TaskStatus::Running);
        state.admit(&spec("logging", &[])).unwrap();

        match state.start_gate("logging") {
            EntryGate::Conflict(error) => {
                assert_eq!(error.kind, CoreErrorKind::ConflictingTaskRunning);
                assert_eq!(error.related, vec!["refill".to_string()]);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn resume_is_refused_while_a_conflict_is_running() {
        let mut state = SchedulerState::default();
        state.admit(&spec("logging", &[])).unwrap();
        state.set_status("logging", TaskStatus::Running);
        state.set_status("logging", TaskStatus::Pausing);
        state.set_status("logging", TaskStatus::Paused);
        state.admit(&spec("refill", &["logging"])).unwrap();
        state.set_status("refill", TaskStatus::Running);

        let error = state.resume_conflict("logging").unwrap();
        assert_eq!(error.kind, CoreErrorKind::ConflictingTaskRunning);

        state.finish("refill", TaskStatus::Stopped, None);
        assert!(state.resume_conflict("logging").is_none());
    }
}
