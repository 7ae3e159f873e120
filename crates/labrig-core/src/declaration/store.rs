use std::collections::{HashMap, HashSet};

use crate::declaration::options::apply_option_descriptors;
use crate::declaration::{DeclarationResult, DeclarationTree, ModuleEntry, TaskEntry};
use crate::implementation::{ModuleFactory, TaskFactory};
use crate::models::{
    ConnectorBinding, CoreError, CoreErrorKind, ModuleRole, ModuleSpec, TaskSpec,
};
use crate::registry::ImplementationRegistry;

#[derive(Clone, Debug)]
pub struct DeclaredModule {
    pub spec: ModuleSpec,
    pub factory: ModuleFactory,
}

#[derive(Clone, Debug)]
pub struct DeclaredTask {
    pub spec: TaskSpec,
    pub factory: TaskFactory,
}

/// Validated, immutable set of module and task declarations.
#[derive(Clone, Debug, Default)]
pub struct DeclarationStore {
    modules: Vec<DeclaredModule>,
    module_index: HashMap<String, usize>,
    tasks: Vec<DeclaredTask>,
    task_index: HashMap<String, usize>,
}

impl DeclarationStore {
    pub fn load(
        tree: &DeclarationTree,
        registry: &ImplementationRegistry,
    ) -> DeclarationResult<Self> {
        let mut store = Self::default();

        for (role, entry) in tree.modules_in_order() {
            let declared = declare_module(role, entry, registry)?;
            if store.module_index.contains_key(&declared.spec.name) {
                return Err(CoreError::for_module(
                    declared.spec.name.as_str(),
                    CoreErrorKind::InvalidInput,
                    format!("module name '{}' is declared more than once", declared.spec.name),
                ));
            }
            store
                .module_index
                .insert(declared.spec.name.clone(), store.modules.len());
            store.modules.push(declared);
        }

        let task_names: HashSet<&str> = tree.tasks.iter().map(|task| task.name.as_str()).collect();
        for entry in &tree.tasks {
            let declared = declare_task(entry, registry, &store, &task_names)?;
            if store.task_index.contains_key(&declared.spec.name) {
                return Err(CoreError::for_task(
                    declared.spec.name.as_str(),
                    CoreErrorKind::InvalidInput,
                    format!("task name '{}' is declared more than once", declared.spec.name),
                ));
            }
            store
                .task_index
                .insert(declared.spec.name.clone(), store.tasks.len());
            store.tasks.push(declared);
        }

        tracing::debug!(
            modules = store.modules.len(),
            tasks = store.tasks.len(),
            "declaration store loaded"
        );
        Ok(store)
    }

    pub fn modules(&self) -> &[DeclaredModule] {
        &self.modules
    }

    pub fn specs(&self) -> impl Iterator<Item = &ModuleSpec> {
        self.modules.iter().map(|declared| &declared.spec)
    }

    pub fn module(&self, name: &str) -> Option<&DeclaredModule> {
        self.module_index
            .get(name)
            .and_then(|index| self.modules.get(*index))
    }

    pub fn spec(&self, name: &str) -> Option<&ModuleSpec> {
        self.module(name).map(|declared| &declared.spec)
    }

    pub fn contains_module(&self, name: &str) -> bool {
        self.module_index.contains_key(name)
    }

    pub fn tasks(&self) -> &[DeclaredTask] {
        &self.tasks
    }

    pub fn task(&self, name: &str) -> Option<&DeclaredTask> {
        self.task_index
            .get(name)
            .and_then(|index| self.tasks.get(*index))
    }

    pub fn module_names(&self) -> Vec<&str> {
        self.specs().map(|spec| spec.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

fn declare_module(
    role: ModuleRole,
    entry: &ModuleEntry,
    registry: &ImplementationRegistry,
) -> DeclarationResult<DeclaredModule> {
    let name = entry.name.as_str();
    validate_name(name).map_err(|message| {
        CoreError::for_module(name, CoreErrorKind::InvalidInput, message)
    })?;

    let factory = registry.module(&entry.implementation).ok_or_else(|| {
        CoreError::for_module(
            name,
            CoreErrorKind::UnknownImplementation,
            format!("no module implementation is registered as '{}'", entry.implementation),
        )
    })?;
    let descriptor = factory.descriptor();

    if descriptor.role != role {
        return Err(CoreError::for_module(
            name,
            CoreErrorKind::InvalidInput,
            format!(
                "'{}' is a {} implementation but is declared under {}",
                entry.implementation, descriptor.role, role
            ),
        ));
    }

    let options = apply_option_descriptors(name, &descriptor.options, &entry.options)?;

    let mut connectors: Vec<ConnectorBinding> = Vec::with_capacity(entry.connect.len());
    for (connector, target) in &entry.connect {
        let Some(declared) = descriptor.connector_named(connector) else {
            return Err(CoreError::for_module(
                name,
                CoreErrorKind::InvalidInput,
                format!(
                    "'{}' declares no connector named '{connector}'",
                    entry.implementation
                ),
            ));
        };
        if connectors.iter().any(|binding| &binding.name == connector) {
            return Err(CoreError::for_module(
                name,
                CoreErrorKind::InvalidInput,
                format!("connector '{connector}' is bound more than once"),
            ));
        }
        connectors.push(ConnectorBinding {
            name: connector.clone(),
            target: target.clone(),
            required: !declared.optional,
            interface: declared.interface.clone(),
        });
    }

    if let Some(unbound) = descriptor
        .connectors
        .iter()
        .find(|declared| !declared.optional && !connectors.iter().any(|b| b.name == declared.name))
    {
        return Err(CoreError::for_module(
            name,
            CoreErrorKind::UnresolvedRequiredConnector,
            format!("required connector '{}' is not bound in the configuration", unbound.name),
        ));
    }

    Ok(DeclaredModule {
        spec: ModuleSpec {
            name: name.to_string(),
            role,
            implementation: entry.implementation.clone(),
            options,
            connectors,
            remote_access: entry.remote_access,
        },
        factory: factory.clone(),
    })
}

fn declare_task(
    entry: &TaskEntry,
    registry: &ImplementationRegistry,
    store: &DeclarationStore,
    task_names: &HashSet<&str>,
) -> DeclarationResult<DeclaredTask> {
    let name = entry.name.as_str();
    validate_name(name)
        .map_err(|message| CoreError::for_task(name, CoreErrorKind::InvalidInput, message))?;

    let factory = registry.task(&entry.implementation).ok_or_else(|| {
        CoreError::for_task(
            name,
            CoreErrorKind::UnknownImplementation,
            format!("no task implementation is registered as '{}'", entry.implementation),
        )
    })?;
    let descriptor = factory.descriptor();

    let mut pausetasks = Vec::with_capacity(entry.pausetasks.len());
    for paused in &entry.pausetasks {
        if paused == name {
            return Err(CoreError::for_task(
                name,
                CoreErrorKind::InvalidInput,
                "a task cannot list itself in pausetasks",
            ));
        }
        if !task_names.contains(paused.as_str()) {
            return Err(CoreError::for_task(
                name,
                CoreErrorKind::InvalidInput,
                format!("pausetasks names unknown task '{paused}'"),
            )
            .with_related([paused.as_str()]));
        }
        if !pausetasks.contains(paused) {
            pausetasks.push(paused.clone());
        }
    }

    let mut needsmodules: Vec<ConnectorBinding> = Vec::with_capacity(entry.needsmodules.len());
    for (role, module) in &entry.needsmodules {
        let Some(declared) = descriptor.need_named(role) else {
            return Err(CoreError::for_task(
                name,
                CoreErrorKind::InvalidInput,
                format!("'{}' declares no module role named '{role}'", entry.implementation),
            ));
        };
        if !store.contains_module(module) {
            return Err(CoreError::for_task(
                name,
                CoreErrorKind::UnknownModuleReference,
                format!("needsmodules role '{role}' names unknown module '{module}'"),
            )
            .with_related([module.as_str()]));
        }
        if needsmodules.iter().any(|binding| &binding.name == role) {
            return Err(CoreError::for_task(
                name,
                CoreErrorKind::InvalidInput,
                format!("module role '{role}' is bound more than once"),
            ));
        }
        needsmodules.push(ConnectorBinding {
            name: role.clone(),
            target: module.clone(),
            required: !declared.optional,
            interface: declared.interface.clone(),
        });
    }

    if let Some(unbound) = descriptor
        .needs
        .iter()
        .find(|need| !need.optional && !needsmodules.iter().any(|b| b.name == need.name))
    {
        return Err(CoreError::for_task(
            name,
            CoreErrorKind::UnresolvedRequiredConnector,
            format!("required module role '{}' is not bound in the configuration", unbound.name),
        ));
    }

    Ok(DeclaredTask {
        spec: TaskSpec {
            name: name.to_string(),
            implementation: entry.implementation.clone(),
            pausetasks,
            needsmodules,
        },
        factory: factory.clone(),
    })
}

fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("names must not be empty".to_string());
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!("name '{name}' must not contain whitespace"));
    }
    Ok(())
}
