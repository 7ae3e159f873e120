//! JSON declaration file loader.
//!
//! ```json
//! { "global":   { "startup": ["console"], "cascade": "cascade" },
//!   "hardware": { "levelmeter": { "module.Class": "dummy.levelmeter",
//!                                 "options": { "channel": 1 },
//!                                 "remoteaccess": true } },
//!   "logic":    { "monitor": { "module.Class": "cryo.monitor",
//!                              "connect": { "levelmeter": "levelmeter" } } },
//!   "tasks":    { "refill": { "module": "tasks.refill",
//!                             "pausetasks": ["logging"],
//!                             "needsmodules": { "meter": "levelmeter" } } } }
//! ```
//!
//! Sections are read as order-preserving maps so declaration order follows
//! the file.

use std::path::Path;

use labrig_core::declaration::{DeclarationTree, ModuleEntry, TaskEntry};
use labrig_core::lifecycle::{CascadePolicy, ControllerConfig};
use labrig_core::models::{CoreError, CoreErrorKind, CoreResult, ModuleOptions, ModuleRole};
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Clone, Debug, PartialEq)]
pub struct LoadedConfig {
    pub tree: DeclarationTree,
    pub controller: ControllerConfig,
    /// Modules to start on `run`; empty means all of them.
    pub startup: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeclarationFile {
    #[serde(default)]
    global: GlobalSection,
    #[serde(default)]
    hardware: Map<String, Value>,
    #[serde(default)]
    logic: Map<String, Value>,
    #[serde(default)]
    gui: Map<String, Value>,
    #[serde(default)]
    tasks: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GlobalSection {
    #[serde(default)]
    startup: Vec<String>,
    #[serde(default)]
    cascade: CascadePolicy,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModuleSection {
    #[serde(rename = "module.Class")]
    class: String,
    #[serde(default)]
    options: ModuleOptions,
    #[serde(default)]
    connect: Map<String, Value>,
    #[serde(default, rename = "remoteaccess")]
    remote_access: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskSection {
    module: String,
    #[serde(default)]
    pausetasks: Vec<String>,
    #[serde(default)]
    needsmodules: Map<String, Value>,
}

pub fn load(path: &Path) -> CoreResult<LoadedConfig> {
    let text = std::fs::read_to_string(path).map_err(|error| {
        CoreError::new(
            CoreErrorKind::InvalidInput,
            format!("cannot read {}: {error}", path.display()),
        )
    })?;
    let loaded = parse(&text)?;
    tracing::debug!(
        path = %path.display(),
        modules = loaded.tree.module_count(),
        tasks = loaded.tree.tasks.len(),
        "declaration file loaded"
    );
    Ok(loaded)
}

pub fn parse(text: &str) -> CoreResult<LoadedConfig> {
    let file: DeclarationFile = serde_json::from_str(text).map_err(|error| {
        CoreError::new(
            CoreErrorKind::InvalidInput,
            format!("malformed declaration file: {error}"),
        )
    })?;

    let mut tree = DeclarationTree::new();
    for (role, section) in [
        (ModuleRole::Hardware, &file.hardware),
        (ModuleRole::Logic, &file.logic),
        (ModuleRole::Gui, &file.gui),
    ] {
        for (name, value) in section {
            tree = tree.module(role, module_entry(name, value)?);
        }
    }
    for (name, value) in &file.tasks {
        tree = tree.task(task_entry(name, value)?);
    }

    Ok(LoadedConfig {
        tree,
        controller: ControllerConfig {
            cascade: file.global.cascade,
        },
        startup: file.global.startup,
    })
}

fn module_entry(name: &str, value: &Value) -> CoreResult<ModuleEntry> {
    let section: ModuleSection = serde_json::from_value(value.clone()).map_err(|error| {
        CoreError::for_module(
            name,
            CoreErrorKind::InvalidInput,
            format!("malformed module declaration: {error}"),
        )
    })?;

    let mut entry = ModuleEntry::new(name, section.class);
    entry.options = section.options;
    for (connector, target) in &section.connect {
        let target = target_name(target).ok_or_else(|| {
            CoreError::for_module(
                name,
                CoreErrorKind::InvalidInput,
                format!("connector '{connector}' must name a module"),
            )
        })?;
        entry = entry.connect(connector.as_str(), target);
    }
    if section.remote_access {
        entry = entry.remote();
    }
    Ok(entry)
}

fn task_entry(name: &str, value: &Value) -> CoreResult<TaskEntry> {
    let section: TaskSection = serde_json::from_value(value.clone()).map_err(|error| {
        CoreError::for_task(
            name,
            CoreErrorKind::InvalidInput,
            format!("malformed task declaration: {error}"),
        )
    })?;

    let mut entry = TaskEntry::new(name, section.module);
    for paused in section.pausetasks {
        entry = entry.pauses(paused);
    }
    for (role, target) in &section.needsmodules {
        let target = target_name(target).ok_or_else(|| {
            CoreError::for_task(
                name,
                CoreErrorKind::InvalidInput,
                format!("needed module '{role}' must name a module"),
            )
        })?;
        entry = entry.needs(role.as_str(), target);
    }
    Ok(entry)
}

fn target_name(value: &Value) -> Option<&str> {
    value.as_str().filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn sections_become_a_declaration_tree_in_file_order() {
        let loaded = parse(
            r#"{
                "global": { "startup": ["console"], "cascade": "cascade" },
                "hardware": {
                    "tempcontroller": { "module.Class": "dummy.tempcontroller" },
                    "levelmeter": {
                        "module.Class": "dummy.levelmeter",
                        "options": { "channel": 2 },
                        "remoteaccess": true
                    }
                },
                "logic": {
                    "monitor": {
                        "module.Class": "cryo.monitor",
                        "connect": { "levelmeter": "levelmeter", "tempcontroller": "tempcontroller" }
                    }
                },
                "gui": {
                    "console": { "module.Class": "cryo.console", "connect": { "monitor": "monitor" } }
                },
                "tasks": {
                    "refill": {
                        "module": "tasks.refill",
                        "pausetasks": ["logging"],
                        "needsmodules": { "meter": "levelmeter" }
                    },
                    "logging": { "module": "tasks.logging" }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(loaded.controller.cascade, CascadePolicy::Cascade);
        assert_eq!(loaded.startup, vec!["console"]);

        let names: Vec<&str> = loaded
            .tree
            .modules_in_order()
            .map(|(_, entry)| entry.name.as_str())
            .collect();
        assert_eq!(names, vec!["tempcontroller", "levelmeter", "monitor", "console"]);

        let meter = &loaded.tree.hardware[1];
        assert!(meter.remote_access);
        assert_eq!(meter.options["channel"], json!(2));

        let monitor = &loaded.tree.logic[0];
        assert_eq!(
            monitor.connect,
            vec![
                ("levelmeter".to_string(), "levelmeter".to_string()),
                ("tempcontroller".to_string(), "tempcontroller".to_string()),
            ]
        );

        let refill = &loaded.tree.tasks[0];
        assert_eq!(refill.implementation, "tasks.refill");
        assert_eq!(refill.pausetasks, vec!["logging"]);
        assert_eq!(
            refill.needsmodules,
            vec![("meter".to_string(), "levelmeter".to_string())]
        );
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let loaded = parse("{}").unwrap();
        assert_eq!(loaded.tree, DeclarationTree::new());
        assert_eq!(loaded.controller, ControllerConfig::default());
        assert!(loaded.startup.is_empty());
    }

    #[test]
    fn non_string_connector_target_is_rejected() {
        let error = parse(
            r#"{ "logic": { "monitor": { "module.Class": "cryo.monitor", "connect": { "levelmeter": 3 } } } }"#,
        )
        .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidInput);
        assert_eq!(error.module.as_deref(), Some("monitor"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let error = parse(
            r#"{ "hardware": { "levelmeter": { "module.Class": "dummy.levelmeter", "remote": true } } }"#,
        )
        .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidInput);

        let error = parse(r#"{ "instruments": {} }"#).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidInput);
    }

    #[test]
    fn task_without_module_token_is_rejected() {
        let error = parse(r#"{ "tasks": { "refill": { "pausetasks": [] } } }"#).unwrap_err();
        assert_eq!(error.task.as_deref(), Some("refill"));
    }
}
