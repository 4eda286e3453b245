//! # FabLink
//!
//! Host-side connection layer for multi-function fabrication machines
//! (3D printing, laser engraving, CNC carving) that speak one of several
//! protocols over serial, TCP, UDP, or HTTP.
//!
//! ## Architecture
//!
//! FabLink is organized as a workspace with multiple crates:
//!
//! 1. **fablink-core** - Data model, error taxonomy, normalized event bus
//! 2. **fablink-communication** - Links, binary protocol, detection, channels, connection manager
//! 3. **fablink-settings** - Configuration files and their runtime mapping
//! 4. **fablink** - Logging setup and the headless command-line binary

pub use fablink_communication as communication;
pub use fablink_settings as settings;

pub use fablink_core::{
    AppEvent, ConnectionEvent, DisconnectReason, Error, EventBus, MachineState, PrintEvent,
    Protocol, Result,
};

pub use fablink_communication::{
    list_ports, ConnectionManager, DefaultChannelFactory, MachineCommand, ManagerConfig,
    PrintRequest, TransportTarget,
};

pub use fablink_settings::{Config, SettingsPersistence};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging with the default configuration
///
/// Sets up structured logging with:
/// - Console output on stderr, keeping stdout for command results
/// - RUST_LOG environment variable support, `info` when unset
/// - `verbose` raising the default to `debug`
pub fn init_logging(verbose: bool) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level)?,
    };

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(verbose)
        .with_line_number(verbose);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
