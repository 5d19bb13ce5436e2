use std::fmt;
use std::io;

use consoled_config::ConfigError;
use consoled_frame::FrameError;
use consoled_serial::SerialError;
use consoled_service::ServiceError;

// Exit codes follow the sysexits-style layout used across our CLIs.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const DEVICE_ERROR: i32 = 3;
pub const NOT_FOUND: i32 = 40;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

fn io_code(err: &io::Error) -> i32 {
    match err.kind() {
        io::ErrorKind::NotFound => NOT_FOUND,
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        _ => INTERNAL,
    }
}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    CliError::new(io_code(&err), format!("{context}: {err}"))
}

pub fn config_error(context: &str, err: ConfigError) -> CliError {
    let code = match &err {
        ConfigError::Read { source, .. } => io_code(source),
        ConfigError::Parse { .. } | ConfigError::EmptyUdevPrefix(_) => DATA_INVALID,
        ConfigError::SubscriptionClosed => FAILURE,
        ConfigError::Watcher(_) | ConfigError::Notify(_) => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn serial_error(context: &str, err: SerialError) -> CliError {
    let code = match &err {
        SerialError::Open { source, .. } | SerialError::Symlink { source, .. } => {
            match io_code(source) {
                INTERNAL => DEVICE_ERROR,
                code => code,
            }
        }
        SerialError::UnsupportedBaud(_) => USAGE,
        SerialError::Configure { .. } | SerialError::Pty(_) | SerialError::Io(_) => DEVICE_ERROR,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::PayloadTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        FrameError::ConnectionClosed => CliError::new(DEVICE_ERROR, format!("{context}: {err}")),
    }
}

pub fn service_error(context: &str, err: ServiceError) -> CliError {
    match err {
        ServiceError::Serial(err) => serial_error(context, err),
        ServiceError::Frame(err) => frame_error(context, err),
        ServiceError::Config(err) => config_error(context, err),
        ServiceError::NoConsoleParam => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        ServiceError::Cmdline { ref source, .. } => {
            CliError::new(io_code(source), format!("{context}: {err}"))
        }
        ServiceError::NotOpen(_) => CliError::new(DEVICE_ERROR, format!("{context}: {err}")),
        ServiceError::Spawn(_) => CliError::new(INTERNAL, format!("{context}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn missing_config_file_maps_to_not_found() {
        let err = config_error(
            "load",
            ConfigError::Read {
                path: PathBuf::from("/missing.json"),
                source: io::Error::from(io::ErrorKind::NotFound),
            },
        );
        assert_eq!(err.code, NOT_FOUND);
        assert!(err.message.starts_with("load: "));
    }

    #[test]
    fn serial_open_failure_keeps_permission_code() {
        let err = serial_error(
            "open",
            SerialError::Open {
                path: PathBuf::from("/dev/ttyS0"),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            },
        );
        assert_eq!(err.code, PERMISSION_DENIED);

        let err = serial_error(
            "open",
            SerialError::Open {
                path: PathBuf::from("/dev/ttyS0"),
                source: io::Error::other("busy"),
            },
        );
        assert_eq!(err.code, DEVICE_ERROR);
    }

    #[test]
    fn missing_console_param_is_invalid_data() {
        let err = service_error("dte", ServiceError::NoConsoleParam);
        assert_eq!(err.code, DATA_INVALID);
        assert_eq!(err.message, "dte: No console= parameter found");
    }

    #[test]
    fn nested_service_errors_unwrap() {
        let err = service_error("dte", ServiceError::Serial(SerialError::UnsupportedBaud(1234)));
        assert_eq!(err.code, USAGE);
    }
}
