mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use labrig_core::declaration::DeclarationTree;
use labrig_core::implementation::ModuleHandle;
use labrig_core::lifecycle::{CascadePolicy, ControllerConfig, LifecycleController};
use labrig_core::models::{CoreError, CoreErrorKind, CoreResult, ModuleState};
use labrig_core::remote::{InMemoryRemoteRegistry, RemoteEvent, RemoteExposure};

use support::{Rig, abc_rig, device, entry};

#[derive(Default)]
struct RefusingRemote {
    attempts: AtomicUsize,
}

impl RemoteExposure for RefusingRemote {
    fn register(&self, module: &str, _handle: ModuleHandle) -> CoreResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(CoreError::for_module(
            module,
            CoreErrorKind::Internal,
            "transport unavailable",
        ))
    }

    fn unregister(&self, module: &str) -> CoreResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(CoreError::for_module(
            module,
            CoreErrorKind::Internal,
            "transport unavailable",
        ))
    }
}

#[tokio::test]
async fn flagged_modules_are_exposed_while_activated() {
    let rig = Rig::new().module(device("fake.camera")).module(device("fake.stage"));
    let tree = DeclarationTree::new()
        .hardware(entry("camera", "fake.camera").remote())
        .hardware(entry("stage", "fake.stage"));
    let remote = Arc::new(InMemoryRemoteRegistry::new());
    let controller = LifecycleController::with_remote_exposure(
        rig.store(&tree),
        ControllerConfig::default(),
        remote.clone(),
    )
    .unwrap();

    controller.start_all().await.unwrap();

    assert_eq!(remote.exposed().unwrap(), vec!["camera"]);
    let handle = remote.handle("camera").unwrap().unwrap();
    assert_eq!(handle.name(), "camera");
    assert!(controller.snapshot("camera").unwrap().remote_access);
    assert!(!controller.snapshot("stage").unwrap().remote_access);

    controller.stop("camera").await.unwrap();

    assert!(remote.exposed().unwrap().is_empty());
    assert_eq!(
        remote.events().unwrap(),
        vec![
            RemoteEvent::Registered("camera".into()),
            RemoteEvent::Unregistered("camera".into()),
        ]
    );
}

#[tokio::test]
async fn cascaded_stop_withdraws_dependents_before_their_dependencies() {
    let (rig, _) = abc_rig(|_| Default::default());
    let tree = DeclarationTree::new()
        .hardware(entry("A", "fake.a").remote())
        .logic(entry("B", "fake.b").connect("dev", "A").remote())
        .gui(entry("C", "fake.c").connect("logic", "B"));
    let remote = Arc::new(InMemoryRemoteRegistry::new());
    let controller = LifecycleController::with_remote_exposure(
        rig.store(&tree),
        ControllerConfig::cascading(),
        remote.clone(),
    )
    .unwrap();
    assert_eq!(controller.config().cascade, CascadePolicy::Cascade);

    controller.start_all().await.unwrap();
    controller.stop("A").await.unwrap();

    assert_eq!(
        remote.events().unwrap(),
        vec![
            RemoteEvent::Registered("A".into()),
            RemoteEvent::Registered("B".into()),
            RemoteEvent::Unregistered("B".into()),
            RemoteEvent::Unregistered("A".into()),
        ]
    );
}

#[tokio::test]
async fn exposure_failures_do_not_change_module_state() {
    let rig = Rig::new().module(device("fake.camera"));
    let tree = DeclarationTree::new().hardware(entry("camera", "fake.camera").remote());
    let remote = Arc::new(RefusingRemote::default());
    let controller = LifecycleController::with_remote_exposure(
        rig.store(&tree),
        ControllerConfig::default(),
        remote.clone(),
    )
    .unwrap();

    let report = controller.start_all().await.unwrap();
    assert_eq!(report.activated, vec!["camera"]);
    assert_eq!(controller.status("camera").unwrap(), ModuleState::Activated);

    let stopped = controller.stop("camera").await.unwrap();
    assert_eq!(stopped.stopped, vec!["camera"]);
    assert_eq!(controller.status("camera").unwrap(), ModuleState::Unloaded);
    assert_eq!(remote.attempts.load(Ordering::SeqCst), 2);
}
