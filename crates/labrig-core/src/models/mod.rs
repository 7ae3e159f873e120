pub mod descriptor;
pub mod error;
pub mod module;
pub mod task;

pub use descriptor::{
    ConnectorDescriptor, MissingPolicy, ModuleDescriptor, OptionDescriptor, TaskDescriptor,
};
pub use error::{CoreError, CoreErrorKind, CoreResult};
pub use module::{
    Capability, ConnectorBinding, ModuleOptions, ModuleRole, ModuleSpec, ModuleState,
};
pub use task::{TaskId, TaskSnapshot, TaskSpec, TaskStatus};
