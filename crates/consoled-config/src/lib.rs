//! Configuration and runtime state interfaces for the console daemon.
//!
//! The daemon reads two tables (`CONSOLE_PORT`, `CONSOLE_SWITCH`) through
//! [`ConfigSource`] and follows changes through [`ConfigProvider`]
//! subscriptions. Per-line runtime state is published through
//! [`StateTable`].
//!
//! [`MemoryConfigStore`] is the in-process implementation; paired with
//! [`ConfigFileWatcher`] it follows a JSON file on disk.

pub mod error;
pub mod file;
pub mod memory;
pub mod port;
pub mod state;
pub mod store;
pub mod tables;

pub use error::{ConfigError, Result};
pub use file::{load_config_file, ConfigFileWatcher, DEFAULT_RELOAD_DELAY};
pub use memory::MemoryConfigStore;
pub use port::{
    load_port_configs, parse_baud, ConsoleNaming, PortConfig, DEFAULT_BAUD, DEFAULT_UDEV_PREFIX,
};
pub use state::{MemoryStateTable, SharedStateTable, StateTable};
pub use store::{
    field_map, ConfigEvent, ConfigProvider, ConfigSnapshot, ConfigSource, FieldMap, Operation,
    Subscription, TableEntries,
};
