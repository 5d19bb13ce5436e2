use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};
use crate::store::{ConfigSource, FieldMap};
use crate::tables::{BAUD_RATE_FIELD, CONSOLE_PORT_TABLE};

/// Baud rate used when a port entry or boot parameter does not name one.
pub const DEFAULT_BAUD: u32 = 9600;

/// Platform udev prefix used when none is configured.
pub const DEFAULT_UDEV_PREFIX: &str = "C0-";

/// Fixed platform naming convention for console devices.
///
/// With the default prefix, link `1` is served by `/dev/C0-1` and exposed
/// to operators through the symlink `/dev/VC0-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleNaming {
    udev_prefix: String,
}

impl ConsoleNaming {
    pub fn new(udev_prefix: impl Into<String>) -> Self {
        Self {
            udev_prefix: udev_prefix.into(),
        }
    }

    /// Read the prefix from a one-line platform file (`udevprefix.conf`).
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let prefix = content.trim();
        if prefix.is_empty() {
            return Err(ConfigError::EmptyUdevPrefix(path.to_path_buf()));
        }
        Ok(Self::new(prefix))
    }

    pub fn udev_prefix(&self) -> &str {
        &self.udev_prefix
    }

    /// Serial device backing a link.
    pub fn device_path(&self, link_id: &str) -> PathBuf {
        PathBuf::from(format!("/dev/{}{}", self.udev_prefix, link_id))
    }

    /// Prefix of the operator-facing PTY symlinks.
    pub fn pty_symlink_prefix(&self) -> String {
        format!("/dev/V{}", self.udev_prefix)
    }
}

impl Default for ConsoleNaming {
    fn default() -> Self {
        Self::new(DEFAULT_UDEV_PREFIX)
    }
}

/// Desired configuration of one console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    pub link_id: String,
    pub baud: u32,
    pub device: PathBuf,
}

impl PortConfig {
    /// Build from a `CONSOLE_PORT` entry.
    ///
    /// A missing `baud_rate` falls back to [`DEFAULT_BAUD`]; an unusable one
    /// skips the entry.
    pub fn from_entry(link_id: &str, fields: &FieldMap, naming: &ConsoleNaming) -> Option<Self> {
        let baud = match fields.get(BAUD_RATE_FIELD) {
            None => DEFAULT_BAUD,
            Some(raw) => match parse_baud(raw) {
                Some(baud) => baud,
                None => {
                    tracing::warn!(link_id, baud_rate = %raw, "ignoring port with invalid baud rate");
                    return None;
                }
            },
        };

        Some(Self {
            link_id: link_id.to_string(),
            baud,
            device: naming.device_path(link_id),
        })
    }
}

/// Parse a positive decimal baud rate.
pub fn parse_baud(raw: &str) -> Option<u32> {
    match raw.trim().parse::<u32>() {
        Ok(0) | Err(_) => None,
        Ok(baud) => Some(baud),
    }
}

/// Every usable port entry, keyed by link id.
pub fn load_port_configs(
    source: &(impl ConfigSource + ?Sized),
    naming: &ConsoleNaming,
) -> BTreeMap<String, PortConfig> {
    source
        .get_table(CONSOLE_PORT_TABLE)
        .iter()
        .filter_map(|(link_id, fields)| {
            PortConfig::from_entry(link_id, fields, naming).map(|cfg| (link_id.clone(), cfg))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{field_map, ConfigSnapshot};

    #[test]
    fn default_naming() {
        let naming = ConsoleNaming::default();
        assert_eq!(naming.device_path("1"), PathBuf::from("/dev/C0-1"));
        assert_eq!(naming.pty_symlink_prefix(), "/dev/VC0-");
    }

    #[test]
    fn naming_from_file_trims() {
        let dir = std::env::temp_dir().join(format!("consoled-udev-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("udevprefix.conf");

        std::fs::write(&path, "C1-\n").unwrap();
        let naming = ConsoleNaming::from_file(&path).unwrap();
        assert_eq!(naming.device_path("4"), PathBuf::from("/dev/C1-4"));

        std::fs::write(&path, "  \n").unwrap();
        assert!(matches!(
            ConsoleNaming::from_file(&path),
            Err(ConfigError::EmptyUdevPrefix(_))
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn parses_three_ports() {
        let snapshot = ConfigSnapshot::new()
            .with_entry(CONSOLE_PORT_TABLE, "1", field_map([("baud_rate", "9600")]))
            .with_entry(CONSOLE_PORT_TABLE, "2", field_map([("baud_rate", "115200")]))
            .with_entry(CONSOLE_PORT_TABLE, "3", field_map([("baud_rate", "9600")]));

        let configs = load_port_configs(&snapshot, &ConsoleNaming::default());

        assert_eq!(configs.len(), 3);
        assert_eq!(configs["1"].baud, 9600);
        assert_eq!(configs["1"].device, PathBuf::from("/dev/C0-1"));
        assert_eq!(configs["2"].baud, 115200);
        assert_eq!(configs["2"].device, PathBuf::from("/dev/C0-2"));
        assert_eq!(configs["3"].baud, 9600);
        assert_eq!(configs["3"].device, PathBuf::from("/dev/C0-3"));
    }

    #[test]
    fn empty_table_yields_no_configs() {
        assert!(load_port_configs(&ConfigSnapshot::new(), &ConsoleNaming::default()).is_empty());
    }

    #[test]
    fn missing_baud_defaults_and_invalid_is_skipped() {
        let snapshot = ConfigSnapshot::new()
            .with_entry(CONSOLE_PORT_TABLE, "1", FieldMap::new())
            .with_entry(CONSOLE_PORT_TABLE, "2", field_map([("baud_rate", "fast")]))
            .with_entry(CONSOLE_PORT_TABLE, "3", field_map([("baud_rate", "0")]));

        let configs = load_port_configs(&snapshot, &ConsoleNaming::default());
        assert_eq!(configs.len(), 1);
        assert_eq!(configs["1"].baud, DEFAULT_BAUD);
    }

    #[test]
    fn parse_baud_trims() {
        assert_eq!(parse_baud(" 38400 "), Some(38400));
        assert_eq!(parse_baud("-1"), None);
    }
}
