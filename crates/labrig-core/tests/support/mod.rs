#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use labrig_core::declaration::{DeclarationStore, DeclarationTree, ModuleEntry, TaskEntry};
use labrig_core::implementation::{
    LoadedModule, Module, ModuleFactory, PauseDecision, ResolvedConnectors, TaskFactory,
    TaskImplementation,
};
use labrig_core::models::{
    CoreError, CoreErrorKind, CoreResult, ModuleDescriptor, ModuleRole, TaskDescriptor,
};
use labrig_core::registry::ImplementationRegistry;

#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| event.strip_prefix(prefix).map(str::to_string))
            .collect()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Behavior {
    pub fail_load: bool,
    pub fail_activate: bool,
    pub fail_deactivate: bool,
    pub activate_delay: Option<Duration>,
}

impl Behavior {
    pub fn failing_activation() -> Self {
        Self {
            fail_activate: true,
            ..Self::default()
        }
    }

    pub fn slow_activation(delay: Duration) -> Self {
        Self {
            activate_delay: Some(delay),
            ..Self::default()
        }
    }
}

pub struct FakeModule {
    label: String,
    recorder: Arc<Recorder>,
    behavior: Behavior,
    pub bound: Mutex<Vec<String>>,
}

impl Module for FakeModule {
    fn on_activate(&self, connectors: &ResolvedConnectors) -> CoreResult<()> {
        self.recorder.record(format!("activate:{}", self.label));
        if let Some(delay) = self.behavior.activate_delay {
            std::thread::sleep(delay);
        }
        if self.behavior.fail_activate {
            return Err(CoreError::new(
                CoreErrorKind::ActivationFailure,
                "injected activation failure",
            ));
        }
        *self.bound.lock().unwrap() = connectors.bound_targets();
        Ok(())
    }

    fn on_deactivate(&self) -> CoreResult<()> {
        self.recorder.record(format!("deactivate:{}", self.label));
        if self.behavior.fail_deactivate {
            return Err(CoreError::new(
                CoreErrorKind::DeactivationFailure,
                "injected deactivation failure",
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct Exclusive {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Exclusive {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max_concurrent(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub struct TaskBehavior {
    pub decline_pause: bool,
    pub fail_start: bool,
    pub checkpoint_delay: Option<Duration>,
    pub exclusive: Option<Arc<Exclusive>>,
    pub panic_on_build: bool,
}

pub struct FakeTask {
    label: String,
    recorder: Arc<Recorder>,
    behavior: TaskBehavior,
    inside: AtomicBool,
}

impl FakeTask {
    fn enter(&self) {
        if let Some(exclusive) = &self.behavior.exclusive
            && !self.inside.swap(true, Ordering::SeqCst)
        {
            exclusive.enter();
        }
    }

    fn leave(&self) {
        if let Some(exclusive) = &self.behavior.exclusive
            && self.inside.swap(false, Ordering::SeqCst)
        {
            exclusive.leave();
        }
    }
}

impl TaskImplementation for FakeTask {
    fn on_start(&self, modules: &ResolvedConnectors) -> CoreResult<()> {
        self.recorder.record(format!(
            "start:{}:{}",
            self.label,
            modules.bound_targets().join(",")
        ));
        if self.behavior.fail_start {
            return Err(CoreError::new(CoreErrorKind::TaskHookFailure, "injected start failure"));
        }
        self.enter();
        Ok(())
    }

    fn on_pause_checkpoint(&self) -> PauseDecision {
        if let Some(delay) = self.behavior.checkpoint_delay {
            std::thread::sleep(delay);
        }
        if self.behavior.decline_pause {
            self.recorder.record(format!("decline:{}", self.label));
            return PauseDecision::Decline;
        }
        self.leave();
        self.recorder.record(format!("pause:{}", self.label));
        PauseDecision::Acknowledge
    }

    fn on_resume(&self) -> CoreResult<()> {
        self.enter();
        self.recorder.record(format!("resume:{}", self.label));
        Ok(())
    }

    fn on_stop(&self) -> CoreResult<()> {
        self.leave();
        self.recorder.record(format!("stop:{}", self.label));
        Ok(())
    }
}

/// Registry plus a shared event recorder for fake implementations.
pub struct Rig {
    pub registry: ImplementationRegistry,
    pub recorder: Arc<Recorder>,
}

impl Rig {
    pub fn new() -> Self {
        Self {
            registry: ImplementationRegistry::new(),
            recorder: Arc::new(Recorder::default()),
        }
    }

    pub fn module(self, descriptor: ModuleDescriptor) -> Self {
        self.module_with(descriptor, Behavior::default())
    }

    pub fn module_with(mut self, descriptor: ModuleDescriptor, behavior: Behavior) -> Self {
        let recorder = self.recorder.clone();
        let token = descriptor.implementation.clone();
        let factory = ModuleFactory::new(descriptor, move |options| {
            if behavior.fail_load {
                return Err(CoreError::new(CoreErrorKind::LoadFailure, "injected load failure"));
            }
            let label = options
                .get("label")
                .and_then(|value| value.as_str())
                .unwrap_or(token.as_str())
                .to_string();
            Ok(LoadedModule::new(FakeModule {
                label,
                recorder: recorder.clone(),
                behavior,
                bound: Mutex::new(Vec::new()),
            }))
        });
        self.registry.register_module(factory).unwrap();
        self
    }

    pub fn task(self, descriptor: TaskDescriptor) -> Self {
        self.task_with(descriptor, TaskBehavior::default())
    }

    pub fn task_with(mut self, descriptor: TaskDescriptor, behavior: TaskBehavior) -> Self {
        let recorder = self.recorder.clone();
        let label = descriptor.implementation.clone();
        let factory = TaskFactory::new(descriptor, move || {
            if behavior.panic_on_build {
                panic!("task factory blew up");
            }
            let task: Arc<dyn TaskImplementation> = Arc::new(FakeTask {
                label: label.clone(),
                recorder: recorder.clone(),
                behavior: behavior.clone(),
                inside: AtomicBool::new(false),
            });
            Ok(task)
        });
        self.registry.register_task(factory).unwrap();
        self
    }

    pub fn store(&self, tree: &DeclarationTree) -> Arc<DeclarationStore> {
        Arc::new(DeclarationStore::load(tree, &self.registry).unwrap())
    }
}

pub fn entry(name: &str, token: &str) -> ModuleEntry {
    ModuleEntry::new(name, token).option("label", name)
}

pub fn device(token: &str) -> ModuleDescriptor {
    ModuleDescriptor::new(token, ModuleRole::Hardware).provides("Device")
}

/// `A` hardware, `B` logic bound to `A` through `dev`, `C` gui bound to `B`
/// through `logic`.
pub fn abc_rig(behavior: impl Fn(&str) -> Behavior) -> (Rig, DeclarationTree) {
    let rig = Rig::new()
        .module_with(device("fake.a"), behavior("A"))
        .module_with(
            ModuleDescriptor::new("fake.b", ModuleRole::Logic)
                .provides("Logic")
                .connector("dev", "Device"),
            behavior("B"),
        )
        .module_with(
            ModuleDescriptor::new("fake.c", ModuleRole::Gui).connector("logic", "Logic"),
            behavior("C"),
        );
    let tree = DeclarationTree::new()
        .hardware(entry("A", "fake.a"))
        .logic(entry("B", "fake.b").connect("dev", "A"))
        .gui(entry("C", "fake.c").connect("logic", "B"));
    (rig, tree)
}

pub fn task_entry(name: &str, token: &str) -> TaskEntry {
    TaskEntry::new(name, token)
}
