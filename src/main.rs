//! CLI entry point for the sardana pool
//!
//! Builds a pool from a configuration file and drives it from the command
//! line:
//!
//! ```bash
//! sardana --config config/sardana.toml check
//! sardana list
//! sardana move mot01 12.5
//! sardana move mg01 1.0 2.0 -4.5 --quiet
//! sardana count --time 0.5
//! sardana count --monitor 1000 --master ct02
//! ```
//!
//! Ctrl-C during a move or count aborts the running operation.

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use sardana::config::SardanaConfig;
use sardana::factory::{build_pool, check_controllers, ControllerRegistry};
use sardana::logging::{self, OutputFormat, TracingConfig};
use sardana_core::{ChannelListener, Event, EventValue, Propagate};
use sardana_pool::{AcquisitionRequest, Action, Pool, PoolElement, PoolElementRef};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sardana")]
#[command(about = "Motion and acquisition pool", long_about = None)]
struct Cli {
    /// Pool configuration file (TOML)
    #[arg(long, global = true, default_value = "config/sardana.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and every controller table
    Check,

    /// Build the pool and list controllers and elements
    List,

    /// Move a motor or a motor group
    Move {
        /// Motor or motor group name
        name: String,

        /// Target positions, one per motor
        #[arg(required = true, allow_negative_numbers = true)]
        positions: Vec<f64>,

        /// Only print the final position
        #[arg(long, short)]
        quiet: bool,
    },

    /// Run one acquisition on every configured channel
    Count(CountArgs),
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct CountPreset {
    /// Integration time in seconds
    #[arg(long)]
    time: Option<f64>,

    /// Monitor count preset
    #[arg(long, requires = "master")]
    monitor: Option<f64>,
}

#[derive(Args)]
struct CountArgs {
    #[command(flatten)]
    preset: CountPreset,

    /// Master channel; defaults to the first counter/timer channel
    #[arg(long)]
    master: Option<String>,

    /// Print element events while counting
    #[arg(long)]
    events: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SardanaConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(level) = &cli.log_level {
        config.application.log_level = level.clone();
    }

    let mut tracing_config = TracingConfig::from_config(&config).map_err(|e| anyhow!(e))?;
    if cli.json_logs {
        tracing_config = tracing_config.with_format(OutputFormat::Json);
    }
    logging::init(tracing_config).map_err(|e| anyhow!(e))?;

    let registry = ControllerRegistry::with_builtin();

    match cli.command {
        Commands::Check => check(&registry, &config),
        Commands::List => {
            let pool = build_pool(&registry, &config).await?;
            list(&pool);
            Ok(())
        }
        Commands::Move {
            name,
            positions,
            quiet,
        } => {
            let pool = build_pool(&registry, &config).await?;
            move_element(&pool, &name, positions, !quiet).await
        }
        Commands::Count(args) => {
            let pool = build_pool(&registry, &config).await?;
            count(&pool, args).await
        }
    }
}

fn check(registry: &ControllerRegistry, config: &SardanaConfig) -> Result<()> {
    config.validate().map_err(|e| anyhow!(e))?;
    check_controllers(registry, config)?;
    println!(
        "{}: {} controllers, {} elements, {} motor groups",
        config.application.name,
        config.controllers.len(),
        config.elements.len(),
        config.motor_groups.len()
    );
    Ok(())
}

fn list(pool: &Pool) {
    println!("Controllers:");
    for ctrl in pool.controllers() {
        match ctrl.ctrl_error() {
            None => println!("  {:<16} {:<24} online", ctrl.name(), ctrl.controller_type()),
            Some(err) => println!(
                "  {:<16} {:<24} OFFLINE: {}",
                ctrl.name(),
                ctrl.controller_type(),
                err
            ),
        }
    }
    println!("Elements:");
    for element in pool.elements() {
        let location = match element.hardware() {
            Some((ctrl, axis)) => format!("{}/{}", ctrl.name(), axis),
            None => String::from("-"),
        };
        println!(
            "  {:<16} {:<16} {:<20} {}",
            element.name(),
            element.element_type().to_string(),
            location,
            element.core().state()
        );
    }
}

/// Subscribes to `elements` and prints their events until the handle is aborted.
fn watch_events(elements: &[PoolElementRef]) -> JoinHandle<()> {
    let (listener, mut rx) = ChannelListener::new();
    for element in elements {
        element.core().add_listener(&listener);
    }
    tokio::spawn(async move {
        // Keeps the subscriptions alive for the lifetime of the task
        let _listener: Arc<ChannelListener> = listener;
        while let Some(event) = rx.recv().await {
            println!("{}", format_event(&event));
        }
    })
}

fn format_event(event: &Event) -> String {
    let value = match &event.value {
        EventValue::State(state) => state.to_string(),
        EventValue::Text(text) => text.clone(),
        EventValue::Scalar(v) => format!("{}", v),
        EventValue::Vector(values) => format!("{:?}", values),
        EventValue::Switches(bits) => format!("{:#05b}", bits),
        EventValue::Error(err) => format!("error: {:?}", err),
    };
    format!(
        "{} {}.{} = {}",
        event.timestamp.format("%H:%M:%S%.3f"),
        event.source,
        event.name(),
        value
    )
}

async fn move_element(pool: &Pool, name: &str, positions: Vec<f64>, events: bool) -> Result<()> {
    let element = pool.get_element(name)?;
    let watcher = events.then(|| watch_events(std::slice::from_ref(&element)));

    let result = match &element {
        PoolElementRef::Motor(motor) => {
            let &[target] = positions.as_slice() else {
                bail!("{} is a motor: expected one position, got {}", name, positions.len());
            };
            tokio::select! {
                res = motor.move_to(target) => res.map_err(anyhow::Error::from),
                _ = signal::ctrl_c() => {
                    warn!(motor = %name, "interrupted, aborting");
                    motor.abort().await?;
                    motor.motion().core().wait_finished().await;
                    Err(anyhow!("motion of {} aborted", name))
                }
            }
        }
        PoolElementRef::MotorGroup(group) => {
            tokio::select! {
                res = group.move_to(positions) => res.map_err(anyhow::Error::from),
                _ = signal::ctrl_c() => {
                    warn!(group = %name, "interrupted, aborting");
                    group.abort().await?;
                    group.motion().core().wait_finished().await;
                    Err(anyhow!("motion of {} aborted", name))
                }
            }
        }
        other => Err(anyhow!("{} is a {}, not a motor or motor group", name, other.element_type())),
    };

    if let Some(watcher) = watcher {
        watcher.abort();
    }
    result?;

    match &element {
        PoolElementRef::Motor(motor) => {
            println!("{} = {}", name, motor.get_position(true, Propagate::Suppress).await?)
        }
        PoolElementRef::MotorGroup(group) => {
            println!("{} = {:?}", name, group.position(true, Propagate::Suppress).await?)
        }
        _ => {}
    }
    Ok(())
}

async fn count(pool: &Pool, args: CountArgs) -> Result<()> {
    let acquisition = pool.acquisition("cli_count")?;
    let master = args
        .master
        .as_deref()
        .map(|name| pool.get_ct_channel(name).map(|c| c.id()))
        .transpose()?;
    let request = AcquisitionRequest {
        integ_time: args.preset.time,
        monitor_count: args.preset.monitor,
        master,
    };

    let elements: Vec<PoolElementRef> = pool
        .elements()
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                PoolElementRef::CTExpChannel(_) | PoolElementRef::ZeroDExpChannel(_)
            )
        })
        .collect();
    let watcher = args.events.then(|| watch_events(&elements));

    info!(?request, "starting acquisition");
    let result = tokio::select! {
        res = acquisition.acquire(request) => res.map_err(anyhow::Error::from),
        _ = signal::ctrl_c() => {
            warn!("interrupted, aborting acquisition");
            acquisition.abort().await?;
            acquisition.wait_finished().await;
            Err(anyhow!("acquisition aborted"))
        }
    };

    if let Some(watcher) = watcher {
        watcher.abort();
    }
    result?;

    for (name, value) in acquisition
        .ct_values()
        .into_iter()
        .chain(acquisition.zerod_values())
    {
        match value {
            Some(v) => println!("{:<16} {}", name, v),
            None => println!("{:<16} -", name),
        }
    }
    Ok(())
}
