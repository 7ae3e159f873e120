use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub type ModuleOptions = serde_json::Map<String, serde_json::Value>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleRole {
    Hardware,
    Logic,
    Gui,
}

impl ModuleRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hardware => "hardware",
            Self::Logic => "logic",
            Self::Gui => "gui",
        }
    }

    /// Gui may use any tier, logic may use logic or hardware, hardware only
    /// other hardware.
    pub fn may_depend_on(self, target: ModuleRole) -> bool {
        match self {
            Self::Gui => true,
            Self::Logic => matches!(target, Self::Logic | Self::Hardware),
            Self::Hardware => target == Self::Hardware,
        }
    }
}

impl Display for ModuleRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Unloaded,
    Loaded,
    Activated,
    Deactivated,
    Error,
}

impl ModuleState {
    /// Failures may move a module holding an implementation to `Error`;
    /// `reset` is the only way back out.
    pub fn can_transition_to(self, next: ModuleState) -> bool {
        matches!(
            (self, next),
            (Self::Unloaded, Self::Loaded)
                | (Self::Loaded, Self::Activated)
                | (Self::Loaded, Self::Unloaded)
                | (Self::Activated, Self::Deactivated)
                | (Self::Deactivated, Self::Unloaded)
                | (Self::Loaded, Self::Error)
                | (Self::Activated, Self::Error)
                | (Self::Deactivated, Self::Error)
                | (Self::Error, Self::Unloaded)
        )
    }
}

/// Named interface contract a module implementation can serve.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(pub String);

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConnectorBinding {
    pub name: String,
    pub target: String,
    pub required: bool,
    pub interface: Capability,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub name: String,
    pub role: ModuleRole,
    pub implementation: String,
    pub options: ModuleOptions,
    pub connectors: Vec<ConnectorBinding>,
    pub remote_access: bool,
}

impl ModuleSpec {
    pub fn new(name: impl Into<String>, role: ModuleRole, implementation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role,
            implementation: implementation.into(),
            options: ModuleOptions::new(),
            connectors: Vec::new(),
            remote_access: false,
        }
    }

    pub fn connect(
        mut self,
        connector: impl Into<String>,
        target: impl Into<String>,
        interface: impl Into<Capability>,
    ) -> Self {
        self.connectors.push(ConnectorBinding {
            name: connector.into(),
            target: target.into(),
            required: true,
            interface: interface.into(),
        });
        self
    }

    pub fn connect_optional(
        mut self,
        connector: impl Into<String>,
        target: impl Into<String>,
        interface: impl Into<Capability>,
    ) -> Self {
        self.connectors.push(ConnectorBinding {
            name: connector.into(),
            target: target.into(),
            required: false,
            interface: interface.into(),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_lifecycle_follows_the_state_machine() {
        let path = [
            ModuleState::Unloaded,
            ModuleState::Loaded,
            ModuleState::Activated,
            ModuleState::Deactivated,
            ModuleState::Unloaded,
        ];
        for step in path.windows(2) {
            assert!(step[0].can_transition_to(step[1]), "{:?} -> {:?}", step[0], step[1]);
        }

        assert!(ModuleState::Activated.can_transition_to(ModuleState::Error));
        assert!(ModuleState::Error.can_transition_to(ModuleState::Unloaded));
        assert!(!ModuleState::Error.can_transition_to(ModuleState::Activated));
        assert!(!ModuleState::Unloaded.can_transition_to(ModuleState::Activated));
        assert!(!ModuleState::Unloaded.can_transition_to(ModuleState::Error));
    }
}
