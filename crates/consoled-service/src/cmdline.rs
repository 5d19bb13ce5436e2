use std::path::Path;

use consoled_config::DEFAULT_BAUD;

use crate::error::{Result, ServiceError};

/// Kernel console named on the boot command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleParam {
    pub tty_name: String,
    pub baud: u32,
}

/// Find the console in a kernel command line.
///
/// Every `console=` token is considered and the last one wins, matching
/// the kernel's choice of `/dev/console`. The value is
/// `ttyName[,baud[parity[bits]]]`; only the leading digits after the
/// comma are the baud rate, which defaults to 9600.
pub fn parse_cmdline(cmdline: &str) -> Result<ConsoleParam> {
    let value = cmdline
        .split_whitespace()
        .filter_map(|token| token.strip_prefix("console="))
        .filter(|value| !value.is_empty())
        .last()
        .ok_or(ServiceError::NoConsoleParam)?;

    let (tty_name, options) = match value.split_once(',') {
        Some((tty, options)) => (tty, options),
        None => (value, ""),
    };

    let digits_end = options
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(options.len());
    let baud = match options[..digits_end].parse::<u32>() {
        Ok(baud) if baud > 0 => baud,
        _ => DEFAULT_BAUD,
    };

    Ok(ConsoleParam {
        tty_name: tty_name.to_string(),
        baud,
    })
}

/// Read and parse a command line file (normally `/proc/cmdline`).
pub fn read_proc_cmdline(path: &Path) -> Result<ConsoleParam> {
    let content = std::fs::read_to_string(path).map_err(|source| ServiceError::Cmdline {
        path: path.to_path_buf(),
        source,
    })?;
    let param = parse_cmdline(&content)?;
    tracing::debug!(tty = %param.tty_name, baud = param.baud, "console found on command line");
    Ok(param)
}
