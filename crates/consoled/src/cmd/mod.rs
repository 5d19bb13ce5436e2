use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod dce;
pub mod decode;
pub mod dte;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the console server: bridge every configured line to a pty.
    Dce(DceArgs),
    /// Run the console client: send heartbeats on this switch's console.
    Dte(DteArgs),
    /// Split a captured serial stream into frames and user data.
    Decode(DecodeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Dce(args) => dce::run(args),
        Command::Dte(args) => dte::run(args),
        Command::Decode(args) => decode::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct DceArgs {
    /// Switch configuration (config_db.json layout).
    #[arg(long, env = "CONSOLED_CONFIG", value_name = "FILE")]
    pub config: PathBuf,
    /// Platform udev prefix for console device names.
    #[arg(long, default_value = consoled_config::DEFAULT_UDEV_PREFIX, conflicts_with = "udev_prefix_file")]
    pub udev_prefix: String,
    /// Read the udev prefix from a one-line file (udevprefix.conf).
    #[arg(long, value_name = "FILE")]
    pub udev_prefix_file: Option<PathBuf>,
    /// Quiet time after a configuration file change before it is reloaded (e.g. 100ms).
    #[arg(long, default_value = "100ms")]
    pub reload_delay: String,
    /// Silence after the last heartbeat before a line is reported down.
    #[arg(long, default_value = "15s")]
    pub heartbeat_timeout: String,
}

#[derive(Args, Debug)]
pub struct DteArgs {
    /// Switch configuration (config_db.json layout).
    #[arg(long, env = "CONSOLED_CONFIG", value_name = "FILE")]
    pub config: PathBuf,
    /// Console tty name; taken from the boot command line when omitted.
    #[arg(long)]
    pub tty: Option<String>,
    /// Console baud rate when --tty is given.
    #[arg(long, requires = "tty")]
    pub baud: Option<u32>,
    /// Boot command line to read the console= parameter from.
    #[arg(long, default_value = "/proc/cmdline", value_name = "FILE")]
    pub cmdline: PathBuf,
    /// Time between heartbeats (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub heartbeat_interval: String,
    /// Quiet time after a configuration file change before it is reloaded.
    #[arg(long, default_value = "100ms")]
    pub reload_delay: String,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Captured stream; stdin when omitted.
    pub file: Option<PathBuf>,
    /// Largest escaped frame content before a frame is treated as user data.
    #[arg(long, default_value_t = consoled_frame::DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_len: usize,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else if let Some(num) = input.strip_suffix('m') {
        (num, "m")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value.saturating_mul(60))),
        _ => Err(CliError::new(
            USAGE,
            format!("unsupported duration unit: {unit}"),
        )),
    }
}

/// Clear `running` on SIGINT/SIGTERM.
pub(crate) fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
