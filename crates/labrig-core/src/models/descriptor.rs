use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Capability, ModuleRole};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingPolicy {
    Error,
    Warn,
    Silent,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptionDescriptor {
    pub name: String,
    pub default: Option<Value>,
    pub missing: MissingPolicy,
}

impl OptionDescriptor {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            missing: MissingPolicy::Error,
        }
    }

    pub fn with_default(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            default: Some(default.into()),
            missing: MissingPolicy::Silent,
        }
    }

    pub fn warn_if_missing(mut self) -> Self {
        self.missing = MissingPolicy::Warn;
        self
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConnectorDescriptor {
    pub name: String,
    pub interface: Capability,
    pub optional: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub implementation: String,
    pub role: ModuleRole,
    pub provides: Vec<Capability>,
    pub connectors: Vec<ConnectorDescriptor>,
    pub options: Vec<OptionDescriptor>,
}

impl ModuleDescriptor {
    pub fn new(implementation: impl Into<String>, role: ModuleRole) -> Self {
        Self {
            implementation: implementation.into(),
            role,
            provides: Vec::new(),
            connectors: Vec::new(),
            options: Vec::new(),
        }
    }

    pub fn provides(mut self, capability: impl Into<Capability>) -> Self {
        self.provides.push(capability.into());
        self
    }

    pub fn connector(mut self, name: impl Into<String>, interface: impl Into<Capability>) -> Self {
        self.connectors.push(ConnectorDescriptor {
            name: name.into(),
            interface: interface.into(),
            optional: false,
        });
        self
    }

    pub fn optional_connector(
        mut self,
        name: impl Into<String>,
        interface: impl Into<Capability>,
    ) -> Self {
        self.connectors.push(ConnectorDescriptor {
            name: name.into(),
            interface: interface.into(),
            optional: true,
        });
        self
    }

    pub fn option(mut self, option: OptionDescriptor) -> Self {
        self.options.push(option);
        self
    }

    pub fn supports(&self, capability: &Capability) -> bool {
        self.provides.contains(capability)
    }

    pub fn connector_named(&self, name: &str) -> Option<&ConnectorDescriptor> {
        self.connectors.iter().find(|connector| connector.name == name)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub implementation: String,
    pub needs: Vec<ConnectorDescriptor>,
}

impl TaskDescriptor {
    pub fn new(implementation: impl Into<String>) -> Self {
        Self {
            implementation: implementation.into(),
            needs: Vec::new(),
        }
    }

    pub fn needs(mut self, role: impl Into<String>, interface: impl Into<Capability>) -> Self {
        self.needs.push(ConnectorDescriptor {
            name: role.into(),
            interface: interface.into(),
            optional: false,
        });
        self
    }

    pub fn optionally_needs(
        mut self,
        role: impl Into<String>,
        interface: impl Into<Capability>,
    ) -> Self {
        self.needs.push(ConnectorDescriptor {
            name: role.into(),
            interface: interface.into(),
            optional: true,
        });
        self
    }

    pub fn need_named(&self, role: &str) -> Option<&ConnectorDescriptor> {
        self.needs.iter().find(|need| need.name == role)
    }
}
