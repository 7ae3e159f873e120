use std::collections::HashMap;

use crate::implementation::{ModuleFactory, TaskFactory};
use crate::models::{CoreError, CoreErrorKind, CoreResult, ModuleDescriptor, TaskDescriptor};

/// Maps implementation tokens from the declaration tree to factories.
///
/// Tokens are resolved once, when a declaration store is built; nothing
/// after that looks implementations up by string.
#[derive(Clone, Debug, Default)]
pub struct ImplementationRegistry {
    modules: HashMap<String, ModuleFactory>,
    tasks: HashMap<String, TaskFactory>,
}

impl ImplementationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_module(&mut self, factory: ModuleFactory) -> CoreResult<()> {
        let token = factory.descriptor().implementation.clone();
        if self.modules.contains_key(&token) {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("duplicate module implementation registration for '{token}'"),
            ));
        }
        self.modules.insert(token, factory);
        Ok(())
    }

    pub fn register_task(&mut self, factory: TaskFactory) -> CoreResult<()> {
        let token = factory.descriptor().implementation.clone();
        if self.tasks.contains_key(&token) {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("duplicate task implementation registration for '{token}'"),
            ));
        }
        self.tasks.insert(token, factory);
        Ok(())
    }

    pub fn with_module(mut self, factory: ModuleFactory) -> CoreResult<Self> {
        self.register_module(factory)?;
        Ok(self)
    }

    pub fn with_task(mut self, factory: TaskFactory) -> CoreResult<Self> {
        self.register_task(factory)?;
        Ok(self)
    }

    pub fn module(&self, token: &str) -> Option<&ModuleFactory> {
        self.modules.get(token)
    }

    pub fn task(&self, token: &str) -> Option<&TaskFactory> {
        self.tasks.get(token)
    }

    pub fn module_descriptors(&self) -> Vec<&ModuleDescriptor> {
        let mut descriptors: Vec<&ModuleDescriptor> = self
            .modules
            .values()
            .map(ModuleFactory::descriptor)
            .collect();
        descriptors.sort_by(|left, right| left.implementation.cmp(&right.implementation));
        descriptors
    }

    pub fn task_descriptors(&self) -> Vec<&TaskDescriptor> {
        let mut descriptors: Vec<&TaskDescriptor> =
            self.tasks.values().map(TaskFactory::descriptor).collect();
        descriptors.sort_by(|left, right| left.implementation.cmp(&right.implementation));
        descriptors
    }
}
