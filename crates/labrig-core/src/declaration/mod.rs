//! In-memory declaration tree and the validated store built from it.
//!
//! The tree is what a configuration loader hands over: role-grouped module
//! entries plus task entries, in declaration order. [`DeclarationStore`]
//! validates it against an [`ImplementationRegistry`](crate::registry::ImplementationRegistry)
//! and is immutable afterwards; reconfiguration builds a new store.

pub mod options;
pub mod store;

pub use store::{DeclarationStore, DeclaredModule, DeclaredTask};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{CoreError, ModuleOptions, ModuleRole};

pub type DeclarationResult<T> = Result<T, CoreError>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeclarationTree {
    pub hardware: Vec<ModuleEntry>,
    pub logic: Vec<ModuleEntry>,
    pub gui: Vec<ModuleEntry>,
    pub tasks: Vec<TaskEntry>,
}

impl DeclarationTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn module(mut self, role: ModuleRole, entry: ModuleEntry) -> Self {
        self.entries_mut(role).push(entry);
        self
    }

    pub fn hardware(self, entry: ModuleEntry) -> Self {
        self.module(ModuleRole::Hardware, entry)
    }

    pub fn logic(self, entry: ModuleEntry) -> Self {
        self.module(ModuleRole::Logic, entry)
    }

    pub fn gui(self, entry: ModuleEntry) -> Self {
        self.module(ModuleRole::Gui, entry)
    }

    pub fn task(mut self, entry: TaskEntry) -> Self {
        self.tasks.push(entry);
        self
    }

    pub fn entries(&self, role: ModuleRole) -> &[ModuleEntry] {
        match role {
            ModuleRole::Hardware => &self.hardware,
            ModuleRole::Logic => &self.logic,
            ModuleRole::Gui => &self.gui,
        }
    }

    pub fn entries_mut(&mut self, role: ModuleRole) -> &mut Vec<ModuleEntry> {
        match role {
            ModuleRole::Hardware => &mut self.hardware,
            ModuleRole::Logic => &mut self.logic,
            ModuleRole::Gui => &mut self.gui,
        }
    }

    /// Every module entry with its role; hardware first, then logic, then
    /// gui, each group in file order. This is the declaration order.
    pub fn modules_in_order(&self) -> impl Iterator<Item = (ModuleRole, &ModuleEntry)> {
        [ModuleRole::Hardware, ModuleRole::Logic, ModuleRole::Gui]
            .into_iter()
            .flat_map(move |role| self.entries(role).iter().map(move |entry| (role, entry)))
    }

    pub fn module_count(&self) -> usize {
        self.hardware.len() + self.logic.len() + self.gui.len()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub name: String,
    pub implementation: String,
    #[serde(default)]
    pub options: ModuleOptions,
    #[serde(default)]
    pub connect: Vec<(String, String)>,
    #[serde(default)]
    pub remote_access: bool,
}

impl ModuleEntry {
    pub fn new(name: impl Into<String>, implementation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            implementation: implementation.into(),
            options: ModuleOptions::new(),
            connect: Vec::new(),
            remote_access: false,
        }
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn connect(mut self, connector: impl Into<String>, target: impl Into<String>) -> Self {
        self.connect.push((connector.into(), target.into()));
        self
    }

    pub fn remote(mut self) -> Self {
        self.remote_access = true;
        self
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub name: String,
    pub implementation: String,
    #[serde(default)]
    pub pausetasks: Vec<String>,
    #[serde(default)]
    pub needsmodules: Vec<(String, String)>,
}

impl TaskEntry {
    pub fn new(name: impl Into<String>, implementation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            implementation: implementation.into(),
            pausetasks: Vec::new(),
            needsmodules: Vec::new(),
        }
    }

    pub fn pauses(mut self, task: impl Into<String>) -> Self {
        self.pausetasks.push(task.into());
        self
    }

    pub fn needs(mut self, role: impl Into<String>, module: impl Into<String>) -> Self {
        self.needsmodules.push((role.into(), module.into()));
        self
    }
}
