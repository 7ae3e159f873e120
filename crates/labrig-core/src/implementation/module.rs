use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::models::{
    Capability, CoreError, CoreErrorKind, CoreResult, ModuleDescriptor, ModuleOptions, ModuleRole,
};

/// Contract every module implementation serves to the lifecycle controller.
///
/// Hooks run on the blocking pool; implementations keep their own interior
/// mutability.
pub trait Module: Any + Send + Sync {
    fn on_activate(&self, connectors: &ResolvedConnectors) -> CoreResult<()>;

    fn on_deactivate(&self) -> CoreResult<()>;
}

/// An instantiated implementation object, kept both as the lifecycle trait
/// object and as `Any` so dependents can reach the concrete type.
#[derive(Clone)]
pub struct LoadedModule {
    module: Arc<dyn Module>,
    any: Arc<dyn Any + Send + Sync>,
}

impl LoadedModule {
    pub fn new<T: Module>(module: T) -> Self {
        Self::from_arc(Arc::new(module))
    }

    pub fn from_arc<T: Module>(module: Arc<T>) -> Self {
        Self {
            module: module.clone(),
            any: module,
        }
    }

    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    pub fn downcast<T: Module>(&self) -> Option<Arc<T>> {
        self.any.clone().downcast::<T>().ok()
    }
}

impl Debug for LoadedModule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule").finish_non_exhaustive()
    }
}

/// Narrow view of an activated module handed to dependents, tasks and the
/// remote exposure layer. The lifecycle controller keeps ownership of the
/// instance itself.
#[derive(Clone, Debug)]
pub struct ModuleHandle {
    name: String,
    role: ModuleRole,
    provides: Arc<[Capability]>,
    instance: LoadedModule,
}

impl ModuleHandle {
    pub fn new(
        name: impl Into<String>,
        role: ModuleRole,
        provides: Arc<[Capability]>,
        instance: LoadedModule,
    ) -> Self {
        Self {
            name: name.into(),
            role,
            provides,
            instance,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ModuleRole {
        self.role
    }

    pub fn provides(&self) -> &[Capability] {
        &self.provides
    }

    pub fn supports(&self, capability: &Capability) -> bool {
        self.provides.contains(capability)
    }

    pub fn downcast<T: Module>(&self) -> Option<Arc<T>> {
        self.instance.downcast::<T>()
    }
}

#[derive(Clone, Debug)]
pub enum Connection {
    Bound(ModuleHandle),
    Absent,
}

impl Connection {
    pub fn handle(&self) -> Option<&ModuleHandle> {
        match self {
            Self::Bound(handle) => Some(handle),
            Self::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ResolvedConnectors {
    entries: BTreeMap<String, Connection>,
}

impl ResolvedConnectors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, connector: impl Into<String>, connection: Connection) {
        self.entries.insert(connector.into(), connection);
    }

    pub fn connection(&self, connector: &str) -> Option<&Connection> {
        self.entries.get(connector)
    }

    /// Bound handle for `connector`; `None` for absent optional connectors.
    pub fn get(&self, connector: &str) -> Option<&ModuleHandle> {
        self.entries.get(connector).and_then(Connection::handle)
    }

    pub fn require(&self, connector: &str) -> CoreResult<&ModuleHandle> {
        self.get(connector).ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::UnresolvedRequiredConnector,
                format!("connector '{connector}' is not bound"),
            )
        })
    }

    /// Downcasts the bound module to its concrete implementation type.
    pub fn require_as<T: Module>(&self, connector: &str) -> CoreResult<Arc<T>> {
        let handle = self.require(connector)?;
        handle.downcast::<T>().ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::IncompatibleCapability,
                format!(
                    "connector '{connector}' is bound to '{}' which is not the expected implementation",
                    handle.name()
                ),
            )
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Connection)> {
        self.entries
            .iter()
            .map(|(name, connection)| (name.as_str(), connection))
    }

    /// Names of the modules this set holds live references to.
    pub fn bound_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self
            .entries
            .values()
            .filter_map(Connection::handle)
            .map(|handle| handle.name().to_string())
            .collect();
        targets.sort();
        targets.dedup();
        targets
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type ModuleBuilder = Arc<dyn Fn(&ModuleOptions) -> CoreResult<LoadedModule> + Send + Sync>;

#[derive(Clone)]
pub struct ModuleFactory {
    descriptor: ModuleDescriptor,
    build: ModuleBuilder,
}

impl ModuleFactory {
    pub fn new<F>(descriptor: ModuleDescriptor, build: F) -> Self
    where
        F: Fn(&ModuleOptions) -> CoreResult<LoadedModule> + Send + Sync + 'static,
    {
        Self {
            descriptor,
            build: Arc::new(build),
        }
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn build(&self, options: &ModuleOptions) -> CoreResult<LoadedModule> {
        (self.build)(options)
    }
}

impl Debug for ModuleFactory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleFactory")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}
