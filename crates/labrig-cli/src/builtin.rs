//! Simulated cryostat instruments and tasks shipped with the binary.

use std::sync::Arc;
use std::sync::Mutex;

use labrig_core::implementation::{
    LoadedModule, Module, ModuleFactory, PauseDecision, ResolvedConnectors, TaskFactory,
    TaskImplementation,
};
use labrig_core::models::{
    CoreError, CoreErrorKind, CoreResult, ModuleDescriptor, ModuleOptions, ModuleRole,
    OptionDescriptor, TaskDescriptor,
};
use labrig_core::registry::ImplementationRegistry;

pub const LEVEL_METER: &str = "CryoLevelMeter";
pub const TEMP_CONTROLLER: &str = "TempController";
pub const MONITORING: &str = "CryoMonitoring";

pub fn registry() -> CoreResult<ImplementationRegistry> {
    ImplementationRegistry::new()
        .with_module(level_meter_factory())?
        .with_module(temp_controller_factory())?
        .with_module(monitor_factory())?
        .with_module(console_factory())?
        .with_task(refill_factory())?
        .with_task(logging_factory())
}

fn number(options: &ModuleOptions, key: &str) -> CoreResult<f64> {
    options.get(key).and_then(|value| value.as_f64()).ok_or_else(|| {
        CoreError::new(
            CoreErrorKind::LoadFailure,
            format!("option '{key}' must be a number"),
        )
    })
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> CoreResult<std::sync::MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| CoreError::poisoned(what))
}

/// Helium level meter reporting a fill level in percent.
pub struct DummyLevelMeter {
    channel: u64,
    level: Mutex<f64>,
}

impl DummyLevelMeter {
    pub fn level(&self) -> CoreResult<f64> {
        Ok(*lock(&self.level, "level meter")?)
    }

    pub fn set_level(&self, percent: f64) -> CoreResult<()> {
        *lock(&self.level, "level meter")? = percent.clamp(0.0, 100.0);
        Ok(())
    }
}

impl Module for DummyLevelMeter {
    fn on_activate(&self, _connectors: &ResolvedConnectors) -> CoreResult<()> {
        tracing::info!(channel = self.channel, level = self.level()?, "level meter online");
        Ok(())
    }

    fn on_deactivate(&self) -> CoreResult<()> {
        Ok(())
    }
}

fn level_meter_factory() -> ModuleFactory {
    let descriptor = ModuleDescriptor::new("dummy.levelmeter", ModuleRole::Hardware)
        .provides(LEVEL_METER)
        .option(OptionDescriptor::with_default("channel", 1))
        .option(OptionDescriptor::with_default("initial_level", 64.0).warn_if_missing());
    ModuleFactory::new(descriptor, |options| {
        let channel = options
            .get("channel")
            .and_then(|value| value.as_u64())
            .ok_or_else(|| {
                CoreError::new(CoreErrorKind::LoadFailure, "option 'channel' must be a channel number")
            })?;
        Ok(LoadedModule::new(DummyLevelMeter {
            channel,
            level: Mutex::new(number(options, "initial_level")?),
        }))
    })
}

pub struct DummyTempController {
    setpoint: f64,
}

impl DummyTempController {
    pub fn temperature(&self) -> f64 {
        self.setpoint
    }
}

impl Module for DummyTempController {
    fn on_activate(&self, _connectors: &ResolvedConnectors) -> CoreResult<()> {
        tracing::info!(setpoint_k = self.setpoint, "temperature controller online");
        Ok(())
    }

    fn on_deactivate(&self) -> CoreResult<()> {
        Ok(())
    }
}

fn temp_controller_factory() -> ModuleFactory {
    let descriptor = ModuleDescriptor::new("dummy.tempcontroller", ModuleRole::Hardware)
        .provides(TEMP_CONTROLLER)
        .option(OptionDescriptor::with_default("setpoint_k", 4.2));
    ModuleFactory::new(descriptor, |options| {
        Ok(LoadedModule::new(DummyTempController {
            setpoint: number(options, "setpoint_k")?,
        }))
    })
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CryoReading {
    pub level_percent: f64,
    pub temperature_k: Option<f64>,
}

/// Combines the level meter with an optional temperature controller.
pub struct CryoMonitor {
    refill_below: f64,
    meter: Mutex<Option<Arc<DummyLevelMeter>>>,
    thermometer: Mutex<Option<Arc<DummyTempController>>>,
}

impl CryoMonitor {
    pub fn reading(&self) -> CoreResult<CryoReading> {
        let meter = lock(&self.meter, "cryo monitor")?.clone().ok_or_else(|| {
            CoreError::new(CoreErrorKind::InvalidTransition, "cryo monitor is not active")
        })?;
        let temperature_k = lock(&self.thermometer, "cryo monitor")?
            .as_ref()
            .map(|thermometer| thermometer.temperature());
        Ok(CryoReading {
            level_percent: meter.level()?,
            temperature_k,
        })
    }

    pub fn needs_refill(&self) -> CoreResult<bool> {
        Ok(self.reading()?.level_percent < self.refill_below)
    }
}

impl Module for CryoMonitor {
    fn on_activate(&self, connectors: &ResolvedConnectors) -> CoreResult<()> {
        let meter = connectors.require_as::<DummyLevelMeter>("levelmeter")?;
        let thermometer = match connectors.get("tempcontroller") {
            Some(handle) => Some(handle.downcast::<DummyTempController>().ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::IncompatibleCapability,
                    format!("'{}' is not a temperature controller", handle.name()),
                )
            })?),
            None => None,
        };
        if thermometer.is_none() {
            tracing::warn!("no temperature controller bound, monitoring level only");
        }
        *lock(&self.meter, "cryo monitor")? = Some(meter);
        *lock(&self.thermometer, "cryo monitor")? = thermometer;
        Ok(())
    }

    fn on_deactivate(&self) -> CoreResult<()> {
        *lock(&self.meter, "cryo monitor")? = None;
        *lock(&self.thermometer, "cryo monitor")? = None;
        Ok(())
    }
}

fn monitor_factory() -> ModuleFactory {
    let descriptor = ModuleDescriptor::new("cryo.monitor", ModuleRole::Logic)
        .provides(MONITORING)
        .connector("levelmeter", LEVEL_METER)
        .optional_connector("tempcontroller", TEMP_CONTROLLER)
        .option(OptionDescriptor::with_default("refill_below", 20.0));
    ModuleFactory::new(descriptor, |options| {
        Ok(LoadedModule::new(CryoMonitor {
            refill_below: number(options, "refill_below")?,
            meter: Mutex::new(None),
            thermometer: Mutex::new(None),
        }))
    })
}

pub struct CryoConsole;

impl Module for CryoConsole {
    fn on_activate(&self, connectors: &ResolvedConnectors) -> CoreResult<()> {
        let monitor = connectors.require_as::<CryoMonitor>("monitor")?;
        let reading = monitor.reading()?;
        tracing::info!(
            level = reading.level_percent,
            temperature_k = ?reading.temperature_k,
            "console attached"
        );
        Ok(())
    }

    fn on_deactivate(&self) -> CoreResult<()> {
        Ok(())
    }
}

fn console_factory() -> ModuleFactory {
    let descriptor =
        ModuleDescriptor::new("cryo.console", ModuleRole::Gui).connector("monitor", MONITORING);
    ModuleFactory::new(descriptor, |_| Ok(LoadedModule::new(CryoConsole)))
}

/// Tops the dewar up to full.
pub struct RefillTask {
    meter: Mutex<Option<Arc<DummyLevelMeter>>>,
}

impl TaskImplementation for RefillTask {
    fn on_start(&self, modules: &ResolvedConnectors) -> CoreResult<()> {
        let meter = modules.require_as::<DummyLevelMeter>("meter")?;
        tracing::info!(level = meter.level()?, "refilling dewar");
        meter.set_level(100.0)?;
        *lock(&self.meter, "refill task")? = Some(meter);
        Ok(())
    }

    fn on_pause_checkpoint(&self) -> PauseDecision {
        PauseDecision::Acknowledge
    }

    fn on_resume(&self) -> CoreResult<()> {
        Ok(())
    }

    fn on_stop(&self) -> CoreResult<()> {
        *lock(&self.meter, "refill task")? = None;
        Ok(())
    }
}

fn refill_factory() -> TaskFactory {
    TaskFactory::new(
        TaskDescriptor::new("tasks.refill").needs("meter", LEVEL_METER),
        || {
            let task: Arc<dyn TaskImplementation> = Arc::new(RefillTask {
                meter: Mutex::new(None),
            });
            Ok(task)
        },
    )
}

/// Periodic readout of the monitor; pauses instantly.
pub struct LoggingTask {
    monitor: Mutex<Option<Arc<CryoMonitor>>>,
}

impl LoggingTask {
    fn log_reading(&self, stage: &str) -> CoreResult<()> {
        if let Some(monitor) = lock(&self.monitor, "logging task")?.as_ref() {
            let reading = monitor.reading()?;
            tracing::info!(
                stage,
                level = reading.level_percent,
                temperature_k = ?reading.temperature_k,
                refill_due = monitor.needs_refill()?,
                "cryostat reading"
            );
        }
        Ok(())
    }
}

impl TaskImplementation for LoggingTask {
    fn on_start(&self, modules: &ResolvedConnectors) -> CoreResult<()> {
        let monitor = match modules.get("monitor") {
            Some(_) => Some(modules.require_as::<CryoMonitor>("monitor")?),
            None => None,
        };
        *lock(&self.monitor, "logging task")? = monitor;
        self.log_reading("start")
    }

    fn on_pause_checkpoint(&self) -> PauseDecision {
        PauseDecision::Acknowledge
    }

    fn on_resume(&self) -> CoreResult<()> {
        self.log_reading("resume")
    }

    fn on_stop(&self) -> CoreResult<()> {
        *lock(&self.monitor, "logging task")? = None;
        Ok(())
    }
}

fn logging_factory() -> TaskFactory {
    TaskFactory::new(
        TaskDescriptor::new("tasks.logging").optionally_needs("monitor", MONITORING),
        || {
            let task: Arc<dyn TaskImplementation> = Arc::new(LoggingTask {
                monitor: Mutex::new(None),
            });
            Ok(task)
        },
    )
}

#[cfg(test)]
mod tests {
    use labrig_core::declaration::{DeclarationStore, DeclarationTree, ModuleEntry, TaskEntry};
    use labrig_core::lifecycle::{ControllerConfig, LifecycleController, ModuleLookup};
    use labrig_core::models::{ModuleState, TaskStatus};
    use labrig_core::scheduler::TaskScheduler;

    use super::*;

    fn cryostat() -> DeclarationTree {
        DeclarationTree::new()
            .hardware(ModuleEntry::new("levelmeter", "dummy.levelmeter").option("initial_level", 12.0))
            .hardware(ModuleEntry::new("tempcontroller", "dummy.tempcontroller"))
            .logic(
                ModuleEntry::new("monitor", "cryo.monitor")
                    .connect("levelmeter", "levelmeter")
                    .connect("tempcontroller", "tempcontroller"),
            )
            .gui(ModuleEntry::new("console", "cryo.console").connect("monitor", "monitor"))
            .task(
                TaskEntry::new("refill", "tasks.refill")
                    .pauses("logging")
                    .needs("meter", "levelmeter"),
            )
            .task(TaskEntry::new("logging", "tasks.logging").needs("monitor", "monitor"))
    }

    #[tokio::test]
    async fn cryostat_configuration_runs_end_to_end() {
        let store = Arc::new(DeclarationStore::load(&cryostat(), &registry().unwrap()).unwrap());
        let controller = LifecycleController::new(store.clone(), ControllerConfig::default()).unwrap();
        let scheduler = TaskScheduler::new(store, Arc::new(controller.clone()));

        let report = controller.start_all().await.unwrap();
        assert!(report.is_complete());
        assert_eq!(
            report.activated,
            vec!["levelmeter", "tempcontroller", "monitor", "console"]
        );

        let monitor = controller
            .lookup("monitor")
            .unwrap()
            .downcast::<CryoMonitor>()
            .unwrap();
        assert!(monitor.needs_refill().unwrap());
        assert_eq!(monitor.reading().unwrap().temperature_k, Some(4.2));

        scheduler.start("logging").await.unwrap();
        scheduler.start("refill").await.unwrap();
        assert_eq!(scheduler.status("logging").unwrap(), TaskStatus::Paused);
        assert!(!monitor.needs_refill().unwrap());

        scheduler.stop("refill").await.unwrap();
        scheduler.resume("logging").await.unwrap();
        scheduler.stop("logging").await.unwrap();

        controller.stop_all().await.unwrap();
        assert_eq!(controller.status("levelmeter").unwrap(), ModuleState::Unloaded);
    }

    #[test]
    fn poisoned_instrument_state_is_an_internal_error() {
        let meter = Arc::new(DummyLevelMeter {
            channel: 1,
            level: Mutex::new(50.0),
        });
        let holder = meter.clone();
        let _ = std::thread::spawn(move || {
            let _guard = holder.level.lock().unwrap();
            panic!("instrument thread died");
        })
        .join();

        let error = meter.level().unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::Internal);
        assert_eq!(error.message, "level meter lock poisoned");
    }

    #[tokio::test]
    async fn monitor_runs_without_its_optional_thermometer() {
        let tree = DeclarationTree::new()
            .hardware(ModuleEntry::new("levelmeter", "dummy.levelmeter"))
            .logic(ModuleEntry::new("monitor", "cryo.monitor").connect("levelmeter", "levelmeter"));
        let store = Arc::new(DeclarationStore::load(&tree, &registry().unwrap()).unwrap());
        let controller = LifecycleController::new(store, ControllerConfig::default()).unwrap();

        controller.start_all().await.unwrap();

        let monitor = controller
            .lookup("monitor")
            .unwrap()
            .downcast::<CryoMonitor>()
            .unwrap();
        let reading = monitor.reading().unwrap();
        assert_eq!(reading.temperature_k, None);
        assert_eq!(reading.level_percent, 64.0);
    }
}
