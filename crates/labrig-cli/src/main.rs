//! `labrig` command line.
//!
//! - `check <file>` validates a declaration file against the built-in
//!   implementations and the dependency rules.
//! - `order <file>` prints the start (or `--stop`) order.
//! - `run <file>` activates the configuration, optionally starts tasks, and
//!   tears everything down again (after Ctrl+C with `--hold`).

mod builtin;
mod config;
mod report;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use labrig_core::declaration::DeclarationStore;
use labrig_core::graph::DependencyGraph;
use labrig_core::lifecycle::LifecycleController;
use labrig_core::models::{CoreError, CoreErrorKind, CoreResult};
use labrig_core::remote::InMemoryRemoteRegistry;
use labrig_core::scheduler::TaskScheduler;

use crate::config::LoadedConfig;

#[derive(Parser)]
#[command(name = "labrig", version, about = "Declarative instrument rig runner", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log filter directive used when LABRIG_LOG is unset
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a declaration file
    Check { file: PathBuf },

    /// Print the module start order
    Order {
        file: PathBuf,

        /// Print the stop order instead
        #[arg(long)]
        stop: bool,
    },

    /// Activate the configured modules and run tasks
    Run {
        file: PathBuf,

        /// Task to start once the modules are up; repeatable
        #[arg(short, long = "task")]
        tasks: Vec<String>,

        /// Keep everything running until Ctrl+C
        #[arg(long)]
        hold: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    labrig_core::logging::init(&cli.log_level);

    let outcome = match cli.command {
        Command::Check { file } => check(&file),
        Command::Order { file, stop } => order(&file, stop),
        Command::Run { file, tasks, hold } => run(&file, &tasks, hold).await,
    };

    match outcome {
        Ok(code) => code,
        Err(error) => {
            tracing::error!(kind = ?error.kind, module = ?error.module, task = ?error.task, "{}", error.message);
            eprintln!("error: {}", report::describe_error(&error));
            ExitCode::FAILURE
        }
    }
}

struct Prepared {
    config: LoadedConfig,
    store: Arc<DeclarationStore>,
    graph: DependencyGraph,
}

fn prepare(file: &Path) -> CoreResult<Prepared> {
    let config = config::load(file)?;
    let registry = builtin::registry()?;
    let store = Arc::new(DeclarationStore::load(&config.tree, &registry)?);
    let graph = DependencyGraph::from_store(&store)?;
    Ok(Prepared {
        config,
        store,
        graph,
    })
}

fn check(file: &Path) -> CoreResult<ExitCode> {
    let prepared = prepare(file)?;
    println!(
        "{}: {} modules, {} dependencies, {} tasks",
        file.display(),
        prepared.graph.len(),
        prepared.graph.edges().len(),
        prepared.config.tree.tasks.len()
    );
    for name in &prepared.config.startup {
        if !prepared.graph.contains(name) {
            return Err(CoreError::for_module(
                name.as_str(),
                CoreErrorKind::UnknownModuleReference,
                "startup lists an undeclared module",
            ));
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn order(file: &Path, stop: bool) -> CoreResult<ExitCode> {
    let prepared = prepare(file)?;
    let order = if stop {
        prepared.graph.stop_order()
    } else {
        prepared.graph.start_order()
    };
    for line in report::order_lines(&prepared.graph, &order) {
        println!("{line}");
    }
    Ok(ExitCode::SUCCESS)
}

async fn run(file: &Path, tasks: &[String], hold: bool) -> CoreResult<ExitCode> {
    let prepared = prepare(file)?;
    let remote = Arc::new(InMemoryRemoteRegistry::new());
    let controller = LifecycleController::with_remote_exposure(
        prepared.store.clone(),
        prepared.config.controller,
        remote.clone(),
    )?;
    let scheduler = TaskScheduler::new(prepared.store.clone(), Arc::new(controller.clone()));

    let mut healthy = true;
    let reports = if prepared.config.startup.is_empty() {
        vec![controller.start_all().await?]
    } else {
        let mut reports = Vec::new();
        for name in &prepared.config.startup {
            reports.push(controller.start(name).await?);
        }
        reports
    };
    for started in &reports {
        healthy &= started.is_complete();
        for line in report::start_lines(started) {
            println!("{line}");
        }
    }

    for task in tasks {
        match scheduler.start(task).await {
            Ok(snapshot) => println!("{}", report::task_line(&snapshot)),
            Err(error) => {
                healthy = false;
                eprintln!("task {task}: {}", report::describe_error(&error));
            }
        }
    }

    let exposed = remote.exposed()?;
    if !exposed.is_empty() {
        println!("exposed for remote access: {}", exposed.join(", "));
    }

    if hold {
        println!("running; press Ctrl+C to stop");
        tokio::signal::ctrl_c().await.map_err(|error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("cannot wait for Ctrl+C: {error}"),
            )
        })?;
        tracing::info!("shutdown requested");
    }

    for snapshot in scheduler.snapshots()? {
        if snapshot.status.is_terminal() {
            continue;
        }
        if let Err(error) = scheduler.stop(&snapshot.name).await {
            healthy = false;
            eprintln!("task {}: {}", snapshot.name, report::describe_error(&error));
        }
    }
    for snapshot in scheduler.snapshots()? {
        println!("{}", report::task_line(&snapshot));
    }

    for snapshot in controller.snapshots()? {
        println!("{}", report::module_line(&snapshot));
    }
    let stopped = controller.stop_all().await?;
    healthy &= stopped.is_complete();
    for line in report::stop_lines(&stopped) {
        println!("{line}");
    }

    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
