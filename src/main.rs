//! FabLink CLI - connect to and drive fabrication machines from a terminal

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fablink::communication::ChannelFactory;
use fablink::{
    init_logging, list_ports, AppEvent, ConnectionEvent, ConnectionManager, DefaultChannelFactory,
    EventBus, MachineCommand, MachineState, PrintEvent, PrintRequest, Protocol,
    SettingsPersistence, TransportTarget,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "fablink")]
#[command(author, version, about = "Connect to and drive fabrication machines")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "FABLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Serial device of the machine
    #[arg(long, conflicts_with = "host")]
    serial: Option<String>,

    /// Baud rate for --serial
    #[arg(long, requires = "serial")]
    baud: Option<u32>,

    /// Network host of the machine
    #[arg(long)]
    host: Option<String>,

    /// Assume this protocol instead of detecting it
    #[arg(short, long)]
    protocol: Option<Protocol>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,

    /// Report which protocol the machine speaks
    Detect,

    /// Connect and print machine events until interrupted
    Monitor,

    /// Show firmware version and machine state
    Info,

    /// Send G-code and print the firmware output
    Gcode {
        /// Lines to send
        #[arg(required = true)]
        lines: Vec<String>,
    },

    /// Home all axes
    Home,

    /// Upload a file to the machine's storage
    Upload {
        /// File to send
        file: PathBuf,
    },

    /// Start printing a G-code file
    Print {
        /// G-code file
        file: PathBuf,

        /// Stay connected until the job finishes
        #[arg(long)]
        wait: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let mut store = match &cli.config {
        Some(path) => SettingsPersistence::open(path.clone()),
        None => SettingsPersistence::open_default(),
    }
    .context("loading settings")?;
    tracing::debug!("Settings from {}", store.path().display());

    match &cli.command {
        Commands::Ports => ports(),
        Commands::Detect => detect(&cli, &store).await,
        command => session(&cli, &mut store, command).await,
    }
}

fn ports() -> Result<()> {
    let ports = list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let maker = port.manufacturer.unwrap_or_default();
        println!("{:<24} {} {}", port.port_name, port.description, maker);
    }
    Ok(())
}

/// Target from the command line, else the last remembered one
fn resolve_target(cli: &Cli, store: &SettingsPersistence) -> Result<(TransportTarget, Option<Protocol>)> {
    let config = store.config();
    if let Some(path) = &cli.serial {
        let baud = cli.baud.unwrap_or(config.connection.baud_rate);
        return Ok((TransportTarget::serial(path, baud), cli.protocol));
    }
    if let Some(host) = &cli.host {
        return Ok((TransportTarget::network(host), cli.protocol));
    }
    let target = config
        .target()
        .context("no machine given: pass --serial or --host")?;
    Ok((target, cli.protocol.or(config.connection.protocol_hint)))
}

async fn detect(cli: &Cli, store: &SettingsPersistence) -> Result<()> {
    let (target, _) = resolve_target(cli, store)?;
    let factory = DefaultChannelFactory::new(store.config().manager_config());
    let protocol = factory.detect(&target).await?;
    println!("{}: {}", target, protocol);
    Ok(())
}

async fn session(cli: &Cli, store: &mut SettingsPersistence, command: &Commands) -> Result<()> {
    let (target, hint) = resolve_target(cli, store)?;
    let bus = Arc::new(EventBus::new());
    let manager = ConnectionManager::new(store.config().manager_config(), bus.clone());
    let mut events = bus.receiver();

    let state = manager
        .connection_open(target.clone(), hint)
        .await
        .with_context(|| format!("connecting to {}", target))?;
    if let Err(e) = store.remember_connection(&target, state.protocol) {
        tracing::warn!("Could not save settings: {}", e);
    }

    let outcome = run(&manager, &mut events, command, state).await;
    manager.connection_close(false).await?;
    outcome
}

async fn run(
    manager: &ConnectionManager,
    events: &mut tokio::sync::broadcast::Receiver<AppEvent>,
    command: &Commands,
    state: MachineState,
) -> Result<()> {
    match command {
        Commands::Monitor => {
            println!("Connected to {} over {}", state.series, state.protocol);
            follow(events, |_| false).await
        }
        Commands::Info => {
            let firmware = manager
                .firmware_version()
                .await
                .unwrap_or_else(|e| format!("unavailable ({})", e));
            let state = manager.state().await.unwrap_or(state);
            println!("Firmware: {}", firmware);
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        Commands::Gcode { lines } => {
            let output = manager.execute_gcode(&lines.join("\n")).await?;
            if !output.is_empty() {
                println!("{}", output);
            }
            Ok(())
        }
        Commands::Home => {
            manager.execute(MachineCommand::Home).await?;
            Ok(())
        }
        Commands::Upload { file } => {
            let content = tokio::fs::read(file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            manager.upload_file(&file_name(file), content).await?;
            println!("Uploaded {}", file.display());
            Ok(())
        }
        Commands::Print { file, wait } => {
            let content = tokio::fs::read_to_string(file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            manager
                .start_print(PrintRequest::new(file_name(file), content))
                .await?;
            println!("Started {}", file.display());
            if *wait {
                follow(events, |event| {
                    matches!(event, AppEvent::Print(PrintEvent::Finished { .. }))
                })
                .await?;
            }
            Ok(())
        }
        Commands::Ports | Commands::Detect => Ok(()),
    }
}

/// Print events until `done` matches one, the connection closes, or Ctrl-C
async fn follow(
    events: &mut tokio::sync::broadcast::Receiver<AppEvent>,
    done: impl Fn(&AppEvent) -> bool,
) -> Result<()> {
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    println!("{:<28} {}", event.wire_name(), event.description());
                    if done(&event) {
                        return Ok(());
                    }
                    if let AppEvent::Connection(ConnectionEvent::Close { reason, .. }) = event {
                        anyhow::bail!("connection closed: {}", reason);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Dropped {} events", missed);
                }
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
