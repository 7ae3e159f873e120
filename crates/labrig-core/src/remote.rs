//! Contract for the layer that exposes activated modules to remote clients.
//!
//! The lifecycle controller calls `register` right after a module flagged
//! for remote access becomes activated and `unregister` right before it
//! leaves that state. Failures are logged by the controller and never change
//! the module's state.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::implementation::ModuleHandle;
use crate::models::{CoreError, CoreErrorKind, CoreResult};

pub trait RemoteExposure: Send + Sync {
    fn register(&self, module: &str, handle: ModuleHandle) -> CoreResult<()>;

    fn unregister(&self, module: &str) -> CoreResult<()>;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RemoteEvent {
    Registered(String),
    Unregistered(String),
}

/// Process-local exposure registry.
#[derive(Debug, Default)]
pub struct InMemoryRemoteRegistry {
    state: Mutex<RemoteState>,
}

#[derive(Debug, Default)]
struct RemoteState {
    exposed: BTreeMap<String, ModuleHandle>,
    events: Vec<RemoteEvent>,
}

impl InMemoryRemoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exposed(&self) -> CoreResult<Vec<String>> {
        let state = self.lock()?;
        Ok(state.exposed.keys().cloned().collect())
    }

    pub fn handle(&self, module: &str) -> CoreResult<Option<ModuleHandle>> {
        let state = self.lock()?;
        Ok(state.exposed.get(module).cloned())
    }

    pub fn events(&self) -> CoreResult<Vec<RemoteEvent>> {
        let state = self.lock()?;
        Ok(state.events.clone())
    }

    fn lock(&self) -> CoreResult<std::sync::MutexGuard<'_, RemoteState>> {
        self.state
            .lock()
            .map_err(|_| CoreError::poisoned("remote registry"))
    }
}

impl RemoteExposure for InMemoryRemoteRegistry {
    fn register(&self, module: &str, handle: ModuleHandle) -> CoreResult<()> {
        let mut state = self.lock()?;
        if state.exposed.contains_key(module) {
            return Err(CoreError::for_module(
                module,
                CoreErrorKind::InvalidInput,
                "module is already exposed",
            ));
        }
        state.exposed.insert(module.to_string(), handle);
        state.events.push(RemoteEvent::Registered(module.to_string()));
        tracing::debug!(module, "module exposed for remote access");
        Ok(())
    }

    fn unregister(&self, module: &str) -> CoreResult<()> {
        let mut state = self.lock()?;
        if state.exposed.remove(module).is_none() {
            return Err(CoreError::for_module(
                module,
                CoreErrorKind::InvalidInput,
                "module is not exposed",
            ));
        }
        state.events.push(RemoteEvent::Unregistered(module.to_string()));
        tracing::debug!(module, "module withdrawn from remote access");
        Ok(())
    }
}
