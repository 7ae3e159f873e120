use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tokio::task::JoinError;
use tokio::time::timeout;

use crate::declaration::{DeclarationStore, DeclaredModule};
use crate::graph::DependencyGraph;
use crate::implementation::{LoadedModule, ModuleHandle, ResolvedConnectors};
use crate::lifecycle::{
    CascadePolicy, ConnectorOwner, ControllerConfig, LifecycleCancellationToken, LifecycleResult,
    ModuleFailure, ModuleLookup, ModuleSnapshot, ReloadReport, SkippedModule, StartReport,
    StopReport, TaskHost, TaskStopper, resolve_connectors,
};
use crate::models::{Capability, CoreError, CoreErrorKind, ModuleState};
use crate::remote::RemoteExposure;

/// Owns every module instance of the running configuration.
///
/// Lifecycle operations on one module are serialized through a per-module
/// operation lock; state queries only take a short read lock and never wait
/// on hooks. Live tasks retaining a module count as its dependents.
#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: ControllerConfig,
    current: RwLock<Arc<Configuration>>,
    remote: Option<Arc<dyn RemoteExposure>>,
    tasks: RwLock<Option<Weak<dyn TaskStopper>>>,
    state_changed: Notify,
    // operations hold it shared, reconfiguration exclusively
    gate: tokio::sync::RwLock<()>,
}

struct Configuration {
    store: Arc<DeclarationStore>,
    graph: DependencyGraph,
    slots: HashMap<String, Arc<ModuleSlot>>,
}

struct ModuleSlot {
    declared: DeclaredModule,
    provides: Arc<[Capability]>,
    op_lock: Arc<Mutex<()>>,
    runtime: RwLock<ModuleRuntime>,
}

struct ModuleRuntime {
    state: ModuleState,
    instance: Option<LoadedModule>,
    connectors: Option<ResolvedConnectors>,
    dependents: BTreeSet<String>,
    task_users: BTreeSet<String>,
    // set while a stop is deciding on or tearing down this module
    retiring: bool,
    last_error: Option<CoreError>,
}

enum ActivationOutcome {
    Activated,
    AlreadyActive,
    Cancelled,
}

impl LifecycleController {
    pub fn new(store: Arc<DeclarationStore>, config: ControllerConfig) -> LifecycleResult<Self> {
        Self::build(store, config, None)
    }

    pub fn with_remote_exposure(
        store: Arc<DeclarationStore>,
        config: ControllerConfig,
        remote: Arc<dyn RemoteExposure>,
    ) -> LifecycleResult<Self> {
        Self::build(store, config, Some(remote))
    }

    fn build(
        store: Arc<DeclarationStore>,
        config: ControllerConfig,
        remote: Option<Arc<dyn RemoteExposure>>,
    ) -> LifecycleResult<Self> {
        let graph = DependencyGraph::from_store(&store)?;
        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                current: RwLock::new(Arc::new(Configuration::new(store, graph))),
                remote,
                tasks: RwLock::new(None),
                state_changed: Notify::new(),
                gate: tokio::sync::RwLock::new(()),
            }),
        })
    }

    pub fn config(&self) -> ControllerConfig {
        self.inner.config
    }

    pub fn store(&self) -> LifecycleResult<Arc<DeclarationStore>> {
        Ok(self.inner.current()?.store.clone())
    }

    pub fn graph(&self) -> LifecycleResult<DependencyGraph> {
        Ok(self.inner.current()?.graph.clone())
    }

    pub async fn start_all(&self) -> LifecycleResult<StartReport> {
        self.start_all_with(&LifecycleCancellationToken::new()).await
    }

    /// Activates every module in dependency order. A failed module blocks
    /// only the modules that require it; the rest keep starting.
    pub async fn start_all_with(
        &self,
        token: &LifecycleCancellationToken,
    ) -> LifecycleResult<StartReport> {
        let _gate = self.inner.gate.read().await;
        let config = self.inner.current()?;
        let order = config.graph.start_order();
        Ok(self.inner.start_sequence(&config, &order, token).await)
    }

    /// Activates `name` after everything it depends on.
    pub async fn start(&self, name: &str) -> LifecycleResult<StartReport> {
        let _gate = self.inner.gate.read().await;
        let config = self.inner.current()?;
        config.slot(name)?;
        let order = config.graph.dependency_closure(name);
        Ok(self
            .inner
            .start_sequence(&config, &order, &LifecycleCancellationToken::new())
            .await)
    }

    pub async fn stop(&self, name: &str) -> LifecycleResult<StopReport> {
        self.stop_with(name, &LifecycleCancellationToken::new()).await
    }

    pub async fn stop_with(
        &self,
        name: &str,
        token: &LifecycleCancellationToken,
    ) -> LifecycleResult<StopReport> {
        let _gate = self.inner.gate.read().await;
        let config = self.inner.current()?;
        self.inner
            .stop_module(&config, name, self.inner.config.cascade, token)
            .await
    }

    pub async fn reload(&self, name: &str) -> LifecycleResult<ReloadReport> {
        self.reload_with(name, &LifecycleCancellationToken::new())
            .await
    }

    /// Stops `name` (cascading per policy) and starts it again together with
    /// every module the stop took down, in their original order.
    pub async fn reload_with(
        &self,
        name: &str,
        token: &LifecycleCancellationToken,
    ) -> LifecycleResult<ReloadReport> {
        let _gate = self.inner.gate.read().await;
        let config = self.inner.current()?;
        let stop = self
            .inner
            .stop_module(&config, name, self.inner.config.cascade, token)
            .await?;

        if !stop.cancelled.is_empty() {
            return Ok(ReloadReport {
                stop,
                start: StartReport::default(),
            });
        }

        let order = config.graph.restrict_order(
            std::iter::once(name).chain(stop.stopped.iter().map(String::as_str)),
        );
        let start = self.inner.start_sequence(&config, &order, token).await;
        tracing::info!(
            module = %name,
            restarted = start.activated.len(),
            "module reloaded"
        );
        Ok(ReloadReport { stop, start })
    }

    pub async fn stop_all(&self) -> LifecycleResult<StopReport> {
        self.stop_all_with(&LifecycleCancellationToken::new()).await
    }

    pub async fn stop_all_with(
        &self,
        token: &LifecycleCancellationToken,
    ) -> LifecycleResult<StopReport> {
        let _gate = self.inner.gate.read().await;
        let config = self.inner.current()?;
        Ok(self.inner.stop_everything(&config, token).await)
    }

    /// The only way out of `Error`.
    pub async fn reset(&self, name: &str) -> LifecycleResult<()> {
        let _gate = self.inner.gate.read().await;
        let config = self.inner.current()?;
        let slot = config.slot(name)?.clone();
        let _guard = slot.op_lock.clone().lock_owned().await;

        match slot.state()? {
            ModuleState::Unloaded => Ok(()),
            ModuleState::Error => {
                self.inner.update(&slot, |runtime| {
                    runtime.state = ModuleState::Unloaded;
                    runtime.last_error = None;
                })?;
                tracing::info!(module = %name, "module reset");
                Ok(())
            }
            state => Err(CoreError::for_module(
                name,
                CoreErrorKind::InvalidTransition,
                format!("only modules in Error can be reset, module is {state:?}"),
            )),
        }
    }

    /// Swaps in a new declaration store. The new graph is validated first; a
    /// rejected configuration leaves the running one untouched. Otherwise
    /// every module of the old configuration is stopped before the swap.
    pub async fn reconfigure(&self, store: Arc<DeclarationStore>) -> LifecycleResult<StopReport> {
        let graph = DependencyGraph::from_store(&store)?;
        let _gate = self.inner.gate.write().await;
        let previous = self.inner.current()?;
        let report = self
            .inner
            .stop_everything(&previous, &LifecycleCancellationToken::new())
            .await;

        let next = Arc::new(Configuration::new(store, graph));
        {
            let mut current = self
                .inner
                .current
                .write()
                .map_err(|_| CoreError::poisoned("lifecycle configuration"))?;
            *current = next;
        }
        self.inner.state_changed.notify_waiters();
        tracing::info!(
            stopped = report.stopped.len(),
            errored = report.errored.len(),
            "configuration replaced"
        );
        Ok(report)
    }

    pub fn status(&self, name: &str) -> LifecycleResult<ModuleState> {
        let config = self.inner.current()?;
        config.slot(name)?.state()
    }

    pub fn snapshot(&self, name: &str) -> LifecycleResult<ModuleSnapshot> {
        let config = self.inner.current()?;
        config.slot(name)?.snapshot()
    }

    /// Snapshots of every module, in start order.
    pub fn snapshots(&self) -> LifecycleResult<Vec<ModuleSnapshot>> {
        let config = self.inner.current()?;
        config
            .graph
            .start_order()
            .iter()
            .map(|name| config.slot(name)?.snapshot())
            .collect()
    }

    pub async fn wait_for_state(
        &self,
        name: &str,
        state: ModuleState,
        timeout_duration: Option<Duration>,
    ) -> LifecycleResult<()> {
        loop {
            let notified = self.inner.state_changed.notified();
            let current = self.status(name)?;
            if current == state {
                return Ok(());
            }

            match timeout_duration {
                Some(duration) => timeout(duration, notified).await.map_err(|_| {
                    CoreError::for_module(
                        name,
                        CoreErrorKind::Timeout,
                        format!("timed out waiting for {state:?}, module is {current:?}"),
                    )
                })?,
                None => notified.await,
            }
        }
    }
}

impl ModuleLookup for LifecycleController {
    fn lookup(&self, name: &str) -> Option<ModuleHandle> {
        self.inner.current().ok()?.lookup(name)
    }

    fn state_of(&self, name: &str) -> Option<ModuleState> {
        self.inner.current().ok()?.state_of(name)
    }
}

impl TaskHost for LifecycleController {
    fn retain(&self, task: &str, modules: &[String]) -> LifecycleResult<()> {
        self.inner.current()?.retain(task, modules)?;
        if !modules.is_empty() {
            tracing::debug!(task = %task, modules = ?modules, "task retained modules");
        }
        Ok(())
    }

    fn release(&self, task: &str) {
        match self.inner.current() {
            Ok(config) => config.release_task(task, config.slots.keys()),
            Err(error) => {
                tracing::error!(task = %task, error = %error, "failed to release task modules")
            }
        }
    }

    fn attach_tasks(&self, stopper: Weak<dyn TaskStopper>) {
        let mut tasks = self
            .inner
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *tasks = Some(stopper);
    }
}

impl ControllerInner {
    fn current(&self) -> LifecycleResult<Arc<Configuration>> {
        self.current
            .read()
            .map(|current| current.clone())
            .map_err(|_| CoreError::poisoned("lifecycle configuration"))
    }

    fn update<R>(
        &self,
        slot: &ModuleSlot,
        change: impl FnOnce(&mut ModuleRuntime) -> R,
    ) -> LifecycleResult<R> {
        let result = {
            let mut runtime = slot.write()?;
            let before = runtime.state;
            let result = change(&mut runtime);
            if runtime.state != before {
                if !before.can_transition_to(runtime.state) {
                    tracing::error!(
                        module = %slot.name(),
                        from = ?before,
                        to = ?runtime.state,
                        "unexpected module transition"
                    );
                }
                tracing::debug!(
                    module = %slot.name(),
                    from = ?before,
                    to = ?runtime.state,
                    "module state transition"
                );
            }
            result
        };
        self.state_changed.notify_waiters();
        Ok(result)
    }

    /// Puts the module into `Error`, dropping its instance and connectors.
    fn fail(&self, config: &Configuration, slot: &ModuleSlot, error: CoreError) -> CoreError {
        let error = error.attribute_module(slot.name());
        tracing::error!(
            module = %slot.name(),
            kind = ?error.kind,
            error = %error.message,
            "module failed"
        );
        let released = self.update(slot, |runtime| {
            runtime.state = ModuleState::Error;
            runtime.instance = None;
            runtime.last_error = Some(error.clone());
            runtime.connectors.take()
        });
        match released {
            Ok(connectors) => {
                self.release(config, slot.name(), connectors);
                error
            }
            Err(lock_error) => lock_error,
        }
    }

    fn release(&self, config: &Configuration, name: &str, connectors: Option<ResolvedConnectors>) {
        let Some(connectors) = connectors else {
            return;
        };
        for target in connectors.bound_targets() {
            if let Some(target_slot) = config.slots.get(&target)
                && let Err(error) = self.update(target_slot, |runtime| {
                    runtime.dependents.remove(name);
                })
            {
                tracing::error!(module = %name, target = %target, error = %error, "failed to release connector");
            }
        }
    }

    async fn start_sequence(
        &self,
        config: &Configuration,
        order: &[String],
        token: &LifecycleCancellationToken,
    ) -> StartReport {
        let mut report = StartReport::default();

        for (position, name) in order.iter().enumerate() {
            if token.is_cancelled() {
                report.cancelled.extend(order[position..].iter().cloned());
                break;
            }

            let blocked_by: Vec<String> = config
                .graph
                .required_dependencies(name)
                .into_iter()
                .filter(|dependency| config.state_of(dependency) != Some(ModuleState::Activated))
                .map(str::to_string)
                .collect();
            if !blocked_by.is_empty() {
                tracing::warn!(module = %name, blocked_by = ?blocked_by, "skipping module");
                report.skipped.push(SkippedModule {
                    module: name.clone(),
                    blocked_by,
                });
                continue;
            }

            match self.activate(config, name, token).await {
                Ok(ActivationOutcome::Activated) => report.activated.push(name.clone()),
                Ok(ActivationOutcome::AlreadyActive) => report.already_active.push(name.clone()),
                Ok(ActivationOutcome::Cancelled) => report.cancelled.push(name.clone()),
                Err(error) => report.errored.push(ModuleFailure {
                    module: name.clone(),
                    error,
                }),
            }
        }

        tracing::info!(
            activated = report.activated.len(),
            already_active = report.already_active.len(),
            skipped = report.skipped.len(),
            errored = report.errored.len(),
            cancelled = report.cancelled.len(),
            "module startup finished"
        );
        report
    }

    async fn activate(
        &self,
        config: &Configuration,
        name: &str,
        token: &LifecycleCancellationToken,
    ) -> LifecycleResult<ActivationOutcome> {
        let slot = config.slot(name)?.clone();
        let spec = &slot.declared.spec;
        let _guards = config
            .lock_modules(
                std::iter::once(name.to_string())
                    .chain(spec.connectors.iter().map(|binding| binding.target.clone())),
            )
            .await?;

        match slot.state()? {
            ModuleState::Unloaded => {}
            ModuleState::Activated => return Ok(ActivationOutcome::AlreadyActive),
            state => {
                return Err(CoreError::for_module(
                    name,
                    CoreErrorKind::InvalidTransition,
                    format!("cannot activate a module in {state:?}; reset it first"),
                ));
            }
        }
        if token.is_cancelled() {
            return Ok(ActivationOutcome::Cancelled);
        }

        self.update(&slot, |runtime| runtime.state = ModuleState::Loaded)?;
        let factory = slot.declared.factory.clone();
        let options = spec.options.clone();
        let built = tokio::task::spawn_blocking(move || factory.build(&options)).await;
        let instance = match settle_hook(built, name, CoreErrorKind::LoadFailure, "load") {
            Ok(instance) => instance,
            Err(error) => return Err(self.fail(config, &slot, error)),
        };
        self.update(&slot, |runtime| runtime.instance = Some(instance.clone()))?;

        let connectors =
            match resolve_connectors(ConnectorOwner::Module(name), &spec.connectors, config) {
                Ok(connectors) => connectors,
                Err(error) => return Err(self.fail(config, &slot, error)),
            };

        if token.is_cancelled() {
            self.update(&slot, |runtime| {
                runtime.state = ModuleState::Unloaded;
                runtime.instance = None;
            })?;
            return Ok(ActivationOutcome::Cancelled);
        }

        let module = instance.module().clone();
        let hook_connectors = connectors.clone();
        let activated =
            tokio::task::spawn_blocking(move || module.on_activate(&hook_connectors)).await;
        if let Err(error) = settle_hook(activated, name, CoreErrorKind::ActivationFailure, "activation")
        {
            return Err(self.fail(config, &slot, error));
        }

        let targets = connectors.bound_targets();
        self.update(&slot, |runtime| {
            runtime.state = ModuleState::Activated;
            runtime.connectors = Some(connectors);
            runtime.last_error = None;
        })?;
        for target in &targets {
            let target_slot = config.slot(target)?;
            self.update(target_slot, |runtime| {
                runtime.dependents.insert(name.to_string());
            })?;
        }

        if spec.remote_access
            && let Some(remote) = &self.remote
        {
            let handle = slot.handle(instance);
            if let Err(error) = remote.register(name, handle) {
                tracing::warn!(module = %name, error = %error, "remote registration failed");
            }
        }

        tracing::info!(module = %name, connectors = targets.len(), "module activated");
        Ok(ActivationOutcome::Activated)
    }

    /// Runs the deactivation hook of an activated module. The caller holds
    /// the operation locks of the module and its dependents.
    async fn deactivate(&self, config: &Configuration, name: &str) -> LifecycleResult<()> {
        let slot = config.slot(name)?.clone();
        let instance = {
            let runtime = slot.read()?;
            match (runtime.state, runtime.instance.clone()) {
                (ModuleState::Unloaded, _) => return Ok(()),
                (ModuleState::Activated, Some(instance)) => instance,
                (state, _) => {
                    return Err(CoreError::for_module(
                        name,
                        CoreErrorKind::InvalidTransition,
                        format!("cannot deactivate a module in {state:?}"),
                    ));
                }
            }
        };

        if slot.declared.spec.remote_access
            && let Some(remote) = &self.remote
            && let Err(error) = remote.unregister(name)
        {
            tracing::warn!(module = %name, error = %error, "remote unregistration failed");
        }

        let module = instance.module().clone();
        let deactivated = tokio::task::spawn_blocking(move || module.on_deactivate()).await;
        if let Err(error) =
            settle_hook(deactivated, name, CoreErrorKind::DeactivationFailure, "deactivation")
        {
            return Err(self.fail(config, &slot, error));
        }

        let connectors = self.update(&slot, |runtime| {
            runtime.state = ModuleState::Deactivated;
            runtime.connectors.take()
        })?;
        self.release(config, name, connectors);
        self.update(&slot, |runtime| {
            runtime.state = ModuleState::Unloaded;
            runtime.instance = None;
        })?;

        tracing::info!(module = %name, "module deactivated");
        Ok(())
    }

    async fn stop_module(
        &self,
        config: &Configuration,
        name: &str,
        policy: CascadePolicy,
        token: &LifecycleCancellationToken,
    ) -> LifecycleResult<StopReport> {
        let slot = config.slot(name)?.clone();
        let _guards = config
            .lock_modules(
                std::iter::once(name.to_string())
                    .chain(config.graph.transitive_dependents(name)),
            )
            .await?;

        match slot.state()? {
            ModuleState::Unloaded => return Ok(StopReport::default()),
            ModuleState::Activated => {}
            state => {
                return Err(CoreError::for_module(
                    name,
                    CoreErrorKind::InvalidTransition,
                    format!("cannot stop a module in {state:?}"),
                ));
            }
        }

        let active = config.active_dependents(name)?;
        let active = config
            .graph
            .restrict_order(active.iter().map(String::as_str));
        let mut sequence: Vec<String> = active.iter().rev().cloned().collect();
        sequence.push(name.to_string());

        let users = config.mark_retiring(&sequence, true)?;
        let outcome = if policy == CascadePolicy::Reject && !(active.is_empty() && users.is_empty())
        {
            let related: Vec<String> = active.into_iter().chain(users).collect();
            Err(CoreError::for_module(
                name,
                CoreErrorKind::DependentsStillActive,
                format!("dependents still active: {}", related.join(", ")),
            )
            .with_related(related))
        } else {
            self.retire(config, name, &sequence, users, token).await
        };
        config.mark_retiring(&sequence, false)?;
        outcome
    }

    /// Stops the tasks running on `sequence`, then deactivates its modules
    /// in order.
    async fn retire(
        &self,
        config: &Configuration,
        name: &str,
        sequence: &[String],
        users: BTreeSet<String>,
        token: &LifecycleCancellationToken,
    ) -> LifecycleResult<StopReport> {
        if !users.is_empty() {
            self.stop_task_users(config, name, sequence, users).await?;
        }

        let mut report = StopReport::default();
        for (position, module) in sequence.iter().enumerate() {
            if token.is_cancelled() {
                report.cancelled.extend(sequence[position..].iter().cloned());
                break;
            }
            match self.deactivate(config, module).await {
                Ok(()) => report.stopped.push(module.clone()),
                Err(error) => report.errored.push(ModuleFailure {
                    module: module.clone(),
                    error,
                }),
            }
        }
        Ok(report)
    }

    async fn stop_task_users(
        &self,
        config: &Configuration,
        name: &str,
        sequence: &[String],
        users: BTreeSet<String>,
    ) -> LifecycleResult<()> {
        let stopper = self
            .tasks
            .read()
            .map_err(|_| CoreError::poisoned("task stopper"))?
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(stopper) = stopper {
            tracing::info!(module = %name, tasks = ?users, "stopping tasks that run on the module");
            for error in stopper.stop_tasks(users.into_iter().collect()).await {
                tracing::warn!(
                    module = %name,
                    task = ?error.task,
                    kind = ?error.kind,
                    error = %error.message,
                    "task did not stop cleanly"
                );
            }
        }

        let remaining: Vec<String> = config.task_users(sequence)?.into_iter().collect();
        if remaining.is_empty() {
            return Ok(());
        }
        Err(CoreError::for_module(
            name,
            CoreErrorKind::DependentsStillActive,
            format!("tasks still running: {}", remaining.join(", ")),
        )
        .with_related(remaining))
    }

    async fn stop_everything(
        &self,
        config: &Configuration,
        token: &LifecycleCancellationToken,
    ) -> StopReport {
        let mut report = StopReport::default();
        for name in config.graph.stop_order() {
            if config.state_of(&name) != Some(ModuleState::Activated) {
                continue;
            }
            if token.is_cancelled() {
                report.cancelled.push(name);
                continue;
            }
            match self
                .stop_module(config, &name, CascadePolicy::Cascade, token)
                .await
            {
                Ok(part) => report.merge(part),
                Err(error) => report.errored.push(ModuleFailure {
                    module: name.clone(),
                    error,
                }),
            }
        }
        tracing::info!(
            stopped = report.stopped.len(),
            errored = report.errored.len(),
            cancelled = report.cancelled.len(),
            "module shutdown finished"
        );
        report
    }
}

impl Configuration {
    fn new(store: Arc<DeclarationStore>, graph: DependencyGraph) -> Self {
        let slots = store
            .modules()
            .iter()
            .map(|declared| {
                let slot = ModuleSlot {
                    declared: declared.clone(),
                    provides: declared.factory.descriptor().provides.clone().into(),
                    op_lock: Arc::new(Mutex::new(())),
                    runtime: RwLock::new(ModuleRuntime {
                        state: ModuleState::Unloaded,
                        instance: None,
                        connectors: None,
                        dependents: BTreeSet::new(),
                        task_users: BTreeSet::new(),
                        retiring: false,
                        last_error: None,
                    }),
                };
                (declared.spec.name.clone(), Arc::new(slot))
            })
            .collect();
        Self { store, graph, slots }
    }

    fn slot(&self, name: &str) -> LifecycleResult<&Arc<ModuleSlot>> {
        self.slots.get(name).ok_or_else(|| {
            CoreError::for_module(
                name,
                CoreErrorKind::InvalidInput,
                format!("module '{name}' is not declared"),
            )
        })
    }

    /// Acquires operation locks in name order so overlapping lock sets never
    /// wait on each other in a cycle.
    async fn lock_modules(
        &self,
        names: impl IntoIterator<Item = String>,
    ) -> LifecycleResult<Vec<OwnedMutexGuard<()>>> {
        let names: BTreeSet<String> = names.into_iter().collect();
        let mut guards = Vec::with_capacity(names.len());
        for name in &names {
            let slot = self.slot(name)?;
            guards.push(slot.op_lock.clone().lock_owned().await);
        }
        Ok(guards)
    }

    /// Modules currently bound to `name`, directly or through other
    /// dependents.
    fn active_dependents(&self, name: &str) -> LifecycleResult<BTreeSet<String>> {
        let mut found = BTreeSet::new();
        let mut pending = VecDeque::from([name.to_string()]);
        while let Some(current) = pending.pop_front() {
            let dependents = self.slot(&current)?.read()?.dependents.clone();
            for dependent in dependents {
                if dependent != name && found.insert(dependent.clone()) {
                    pending.push_back(dependent);
                }
            }
        }
        Ok(found)
    }

    /// Flags the modules as being stopped, or clears the flag, and returns
    /// the tasks currently retaining any of them.
    fn mark_retiring(&self, names: &[String], retiring: bool) -> LifecycleResult<BTreeSet<String>> {
        let mut users = BTreeSet::new();
        for name in names {
            let mut runtime = self.slot(name)?.write()?;
            runtime.retiring = retiring;
            users.extend(runtime.task_users.iter().cloned());
        }
        Ok(users)
    }

    fn task_users(&self, names: &[String]) -> LifecycleResult<BTreeSet<String>> {
        let mut users = BTreeSet::new();
        for name in names {
            users.extend(self.slot(name)?.read()?.task_users.iter().cloned());
        }
        Ok(users)
    }

    fn retain(&self, task: &str, modules: &[String]) -> LifecycleResult<()> {
        for (position, module) in modules.iter().enumerate() {
            let refused = match self.slots.get(module) {
                None => Some(format!("module '{module}' is not declared")),
                Some(slot) => {
                    let mut runtime = slot.write()?;
                    if runtime.retiring {
                        Some(format!("module '{module}' is being stopped"))
                    } else if runtime.state != ModuleState::Activated {
                        Some(format!("module '{module}' is {:?}", runtime.state))
                    } else {
                        runtime.task_users.insert(task.to_string());
                        None
                    }
                }
            };
            if let Some(message) = refused {
                self.release_task(task, &modules[..position]);
                return Err(CoreError::for_task(
                    task,
                    CoreErrorKind::UnresolvedRequiredConnector,
                    message,
                )
                .with_related([module.as_str()]));
            }
        }
        Ok(())
    }

    fn release_task<'a>(&self, task: &str, modules: impl IntoIterator<Item = &'a String>) {
        for module in modules {
            let Some(slot) = self.slots.get(module) else {
                continue;
            };
            match slot.write() {
                Ok(mut runtime) => {
                    runtime.task_users.remove(task);
                }
                Err(error) => {
                    tracing::error!(task = %task, module = %module, error = %error, "failed to release module")
                }
            }
        }
    }
}

impl ModuleLookup for Configuration {
    fn lookup(&self, name: &str) -> Option<ModuleHandle> {
        let slot = self.slots.get(name)?;
        let runtime = slot.runtime.read().ok()?;
        if runtime.state != ModuleState::Activated {
            return None;
        }
        let instance = runtime.instance.clone()?;
        Some(slot.handle(instance))
    }

    fn state_of(&self, name: &str) -> Option<ModuleState> {
        let slot = self.slots.get(name)?;
        let runtime = slot.runtime.read().ok()?;
        Some(runtime.state)
    }
}

impl ModuleSlot {
    fn name(&self) -> &str {
        &self.declared.spec.name
    }

    fn read(&self) -> LifecycleResult<std::sync::RwLockReadGuard<'_, ModuleRuntime>> {
        self.runtime
            .read()
            .map_err(|_| CoreError::poisoned("module runtime"))
    }

    fn write(&self) -> LifecycleResult<std::sync::RwLockWriteGuard<'_, ModuleRuntime>> {
        self.runtime
            .write()
            .map_err(|_| CoreError::poisoned("module runtime"))
    }

    fn state(&self) -> LifecycleResult<ModuleState> {
        Ok(self.read()?.state)
    }

    fn handle(&self, instance: LoadedModule) -> ModuleHandle {
        ModuleHandle::new(
            self.name(),
            self.declared.spec.role,
            self.provides.clone(),
            instance,
        )
    }

    fn snapshot(&self) -> LifecycleResult<ModuleSnapshot> {
        let runtime = self.read()?;
        let spec = &self.declared.spec;
        let connectors = spec
            .connectors
            .iter()
            .map(|binding| {
                let bound = runtime
                    .connectors
                    .as_ref()
                    .and_then(|connectors| connectors.get(&binding.name))
                    .map(|handle| handle.name().to_string());
                (binding.name.clone(), bound)
            })
            .collect();
        Ok(ModuleSnapshot {
            name: spec.name.clone(),
            role: spec.role,
            implementation: spec.implementation.clone(),
            state: runtime.state,
            connectors,
            dependents: runtime.dependents.iter().cloned().collect(),
            task_users: runtime.task_users.iter().cloned().collect(),
            remote_access: spec.remote_access,
            last_error: runtime.last_error.clone(),
        })
    }
}

/// Flattens a hook run on the blocking pool; a panicking hook counts as a
/// failure of `kind`.
fn settle_hook<T>(
    joined: Result<Result<T, CoreError>, JoinError>,
    module: &str,
    kind: CoreErrorKind,
    stage: &str,
) -> LifecycleResult<T> {
    match joined {
        Ok(result) => result.map_err(|error| error.attribute_module(module)),
        Err(join_error) => Err(CoreError::for_module(
            module,
            kind,
            format!("{stage} hook did not complete: {join_error}"),
        )),
    }
}
