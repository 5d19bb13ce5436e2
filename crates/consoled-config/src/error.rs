use std::path::PathBuf;

/// Errors that can occur while loading or watching configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A configuration file is not a valid table snapshot.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The platform udev prefix file is empty.
    #[error("udev prefix file is empty: {0}")]
    EmptyUdevPrefix(PathBuf),

    /// The store dropped the sending side of a subscription.
    #[error("configuration subscription closed")]
    SubscriptionClosed,

    /// The file watcher thread could not be started.
    #[error("failed to start configuration watcher: {0}")]
    Watcher(std::io::Error),

    /// The platform file notification backend refused the watch.
    #[error("failed to watch configuration: {0}")]
    Notify(#[from] notify::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
