use std::path::PathBuf;

/// Errors that can occur while setting up or driving a console line.
#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    /// The serial device could not be opened.
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The serial device rejected its line settings.
    #[error("failed to configure {path}: {source}")]
    Configure {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The baud rate has no termios speed constant.
    #[error("unsupported baud rate: {0}")]
    UnsupportedBaud(u32),

    /// A pseudo-terminal pair could not be allocated.
    #[error("failed to allocate pty: {0}")]
    Pty(std::io::Error),

    /// The operator-facing symlink could not be created.
    #[error("failed to create symlink {path}: {source}")]
    Symlink {
        path: PathBuf,
        source: std::io::Error,
    },

    /// An I/O error occurred on an open line.
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
