pub mod module;
pub mod task;

pub use module::{
    Connection, LoadedModule, Module, ModuleBuilder, ModuleFactory, ModuleHandle,
    ResolvedConnectors,
};
pub use task::{PauseDecision, TaskBuilder, TaskFactory, TaskImplementation};
