mod support;

use std::collections::HashMap;
use std::sync::Arc;

use labrig_core::declaration::DeclarationTree;
use labrig_core::implementation::{LoadedModule, Module, ModuleHandle, ResolvedConnectors};
use labrig_core::lifecycle::{
    ConnectorOwner, ControllerConfig, LifecycleController, ModuleLookup, resolve_connectors,
};
use labrig_core::models::{
    Capability, ConnectorBinding, CoreErrorKind, CoreResult, ModuleDescriptor, ModuleRole,
    ModuleState,
};

use support::{Rig, device, entry};

#[derive(Debug)]
struct Sensor;

impl Module for Sensor {
    fn on_activate(&self, _connectors: &ResolvedConnectors) -> CoreResult<()> {
        Ok(())
    }

    fn on_deactivate(&self) -> CoreResult<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct Other;

impl Module for Other {
    fn on_activate(&self, _connectors: &ResolvedConnectors) -> CoreResult<()> {
        Ok(())
    }

    fn on_deactivate(&self) -> CoreResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeLookup {
    modules: HashMap<String, (ModuleState, Option<ModuleHandle>)>,
}

impl FakeLookup {
    fn activated(mut self, name: &str, provides: &[&str]) -> Self {
        let provides: Arc<[Capability]> = provides.iter().map(|c| Capability::from(*c)).collect();
        let handle = ModuleHandle::new(
            name,
            ModuleRole::Hardware,
            provides,
            LoadedModule::new(Sensor),
        );
        self.modules
            .insert(name.to_string(), (ModuleState::Activated, Some(handle)));
        self
    }

    fn in_state(mut self, name: &str, state: ModuleState) -> Self {
        self.modules.insert(name.to_string(), (state, None));
        self
    }
}

impl ModuleLookup for FakeLookup {
    fn lookup(&self, name: &str) -> Option<ModuleHandle> {
        match self.modules.get(name) {
            Some((ModuleState::Activated, handle)) => handle.clone(),
            _ => None,
        }
    }

    fn state_of(&self, name: &str) -> Option<ModuleState> {
        self.modules.get(name).map(|(state, _)| *state)
    }
}

fn binding(name: &str, target: &str, interface: &str, required: bool) -> ConnectorBinding {
    ConnectorBinding {
        name: name.to_string(),
        target: target.to_string(),
        required,
        interface: Capability::from(interface),
    }
}

#[test]
fn bound_connectors_expose_the_target_handle() {
    let lookup = FakeLookup::default().activated("counter", &["Counter", "Clock"]);

    let resolved = resolve_connectors(
        ConnectorOwner::Module("confocal"),
        &[binding("counter", "counter", "Counter", true)],
        &lookup,
    )
    .unwrap();

    let handle = resolved.require("counter").unwrap();
    assert_eq!(handle.name(), "counter");
    assert!(resolved.require_as::<Sensor>("counter").is_ok());
    assert_eq!(
        resolved.require_as::<Other>("counter").unwrap_err().kind,
        CoreErrorKind::IncompatibleCapability
    );
    assert_eq!(resolved.bound_targets(), vec!["counter"]);
}

#[test]
fn required_connector_to_inactive_module_is_unresolved() {
    let lookup = FakeLookup::default().in_state("counter", ModuleState::Error);

    let error = resolve_connectors(
        ConnectorOwner::Module("confocal"),
        &[binding("counter", "counter", "Counter", true)],
        &lookup,
    )
    .unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::UnresolvedRequiredConnector);
    assert_eq!(error.module.as_deref(), Some("confocal"));
    assert_eq!(error.related, vec!["counter"]);
}

#[test]
fn optional_connector_to_inactive_module_is_explicitly_absent() {
    let lookup = FakeLookup::default().in_state("shutter", ModuleState::Unloaded);

    let resolved = resolve_connectors(
        ConnectorOwner::Module("odmr"),
        &[binding("shutter", "shutter", "Shutter", false)],
        &lookup,
    )
    .unwrap();

    assert!(resolved.connection("shutter").unwrap().is_absent());
    assert!(resolved.get("shutter").is_none());
    assert_eq!(
        resolved.require("shutter").unwrap_err().kind,
        CoreErrorKind::UnresolvedRequiredConnector
    );
    assert!(resolved.bound_targets().is_empty());
}

#[test]
fn target_without_the_connector_interface_is_incompatible() {
    let lookup = FakeLookup::default().activated("camera", &["Camera"]);

    let error = resolve_connectors(
        ConnectorOwner::Module("odmr"),
        &[binding("counter", "camera", "Counter", false)],
        &lookup,
    )
    .unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::IncompatibleCapability);
    assert_eq!(error.related, vec!["camera"]);
}

#[test]
fn task_owned_bindings_are_attributed_to_the_task() {
    let lookup = FakeLookup::default();

    let error = resolve_connectors(
        ConnectorOwner::Task("refill"),
        &[binding("meter", "levelmeter", "CryoLevelMeter", true)],
        &lookup,
    )
    .unwrap_err();

    assert_eq!(error.task.as_deref(), Some("refill"));
    assert!(error.module.is_none());
}

#[tokio::test]
async fn controller_rejects_activation_against_an_incompatible_target() {
    let rig = Rig::new().module(device("fake.stage")).module(
        ModuleDescriptor::new("fake.imaging", ModuleRole::Logic).connector("camera", "Camera"),
    );
    let tree = DeclarationTree::new()
        .hardware(entry("stage", "fake.stage"))
        .logic(entry("imaging", "fake.imaging").connect("camera", "stage"));
    let controller = LifecycleController::new(rig.store(&tree), ControllerConfig::default()).unwrap();

    let report = controller.start_all().await.unwrap();

    assert_eq!(report.activated, vec!["stage"]);
    assert_eq!(report.errored[0].error.kind, CoreErrorKind::IncompatibleCapability);
    assert_eq!(controller.status("imaging").unwrap(), ModuleState::Error);
    assert!(rig.recorder.with_prefix("activate:").contains(&"stage".to_string()));
    assert!(!rig.recorder.with_prefix("activate:").contains(&"imaging".to_string()));
}
