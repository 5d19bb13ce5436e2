use std::path::PathBuf;

/// Errors that can occur while running a console service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Serial, pty or symlink setup failed.
    #[error("serial error: {0}")]
    Serial(#[from] consoled_serial::SerialError),

    /// A frame could not be written.
    #[error("frame error: {0}")]
    Frame(#[from] consoled_frame::FrameError),

    /// Configuration could not be loaded or followed.
    #[error("config error: {0}")]
    Config(#[from] consoled_config::ConfigError),

    /// The boot command line names no console.
    #[error("No console= parameter found")]
    NoConsoleParam,

    /// The boot command line could not be read.
    #[error("failed to read {path}: {source}")]
    Cmdline {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Heartbeats need an open serial line.
    #[error("serial device {0} is not open")]
    NotOpen(PathBuf),

    /// A worker thread could not be started.
    #[error("failed to spawn thread: {0}")]
    Spawn(std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
