use crate::implementation::{Connection, ModuleHandle, ResolvedConnectors};
use crate::lifecycle::LifecycleResult;
use crate::models::{ConnectorBinding, CoreError, CoreErrorKind, ModuleState};

/// Read-only view of live modules. Only activated modules yield handles.
pub trait ModuleLookup: Send + Sync {
    fn lookup(&self, name: &str) -> Option<ModuleHandle>;

    fn state_of(&self, name: &str) -> Option<ModuleState>;
}

/// Who a connector set belongs to; decides error attribution.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectorOwner<'a> {
    Module(&'a str),
    Task(&'a str),
}

impl ConnectorOwner<'_> {
    fn error(self, kind: CoreErrorKind, message: String) -> CoreError {
        match self {
            Self::Module(name) => CoreError::for_module(name, kind, message),
            Self::Task(name) => CoreError::for_task(name, kind, message),
        }
    }
}

/// Binds every connector to a live module handle.
///
/// Required connectors need an activated target; optional ones resolve to
/// `Connection::Absent` instead. Any bound target must serve the connector's
/// interface.
pub fn resolve_connectors(
    owner: ConnectorOwner<'_>,
    bindings: &[ConnectorBinding],
    lookup: &(impl ModuleLookup + ?Sized),
) -> LifecycleResult<ResolvedConnectors> {
    let mut resolved = ResolvedConnectors::new();

    for binding in bindings {
        let Some(handle) = lookup.lookup(&binding.target) else {
            if binding.required {
                let state = lookup.state_of(&binding.target);
                return Err(owner
                    .error(
                        CoreErrorKind::UnresolvedRequiredConnector,
                        format!(
                            "connector '{}' needs module '{}' activated, found {:?}",
                            binding.name, binding.target, state
                        ),
                    )
                    .with_related([binding.target.as_str()]));
            }
            tracing::debug!(
                owner = ?owner,
                connector = %binding.name,
                target = %binding.target,
                "optional connector target inactive, binding as absent"
            );
            resolved.insert(binding.name.clone(), Connection::Absent);
            continue;
        };

        if !handle.supports(&binding.interface) {
            return Err(owner
                .error(
                    CoreErrorKind::IncompatibleCapability,
                    format!(
                        "connector '{}' expects interface '{}' but module '{}' provides [{}]",
                        binding.name,
                        binding.interface,
                        binding.target,
                        handle
                            .provides()
                            .iter()
                            .map(|capability| capability.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                )
                .with_related([binding.target.as_str()]));
        }

        resolved.insert(binding.name.clone(), Connection::Bound(handle));
    }

    Ok(resolved)
}
