//! Table, entry and field names of the console configuration.
//!
//! | Database | Table | Purpose |
//! |----------|-------|---------|
//! | CONFIG_DB | CONSOLE_PORT | One entry per physical line (`baud_rate`, ...) |
//! | CONFIG_DB | CONSOLE_SWITCH | Feature flags (`console_mgmt`, `controlled_device`) |
//! | STATE_DB | CONSOLE_PORT | Per-line runtime state written by proxy workers |

use crate::store::{ConfigSource, FieldMap};

/// Per-line configuration table.
pub const CONSOLE_PORT_TABLE: &str = "CONSOLE_PORT";

/// Switch-wide feature flags table.
pub const CONSOLE_SWITCH_TABLE: &str = "CONSOLE_SWITCH";

/// Console-server (DCE) feature entry in [`CONSOLE_SWITCH_TABLE`].
pub const CONSOLE_MGMT_KEY: &str = "console_mgmt";

/// Console-client (DTE) feature entry in [`CONSOLE_SWITCH_TABLE`].
pub const CONTROLLED_DEVICE_KEY: &str = "controlled_device";

pub const ENABLED_FIELD: &str = "enabled";
pub const BAUD_RATE_FIELD: &str = "baud_rate";
pub const REMOTE_DEVICE_FIELD: &str = "remote_device";
pub const FLOW_CONTROL_FIELD: &str = "flow_control";

/// The only value that turns a flag on.
pub const YES: &str = "yes";

/// State fields written per line.
pub const STATE_PTY_FIELD: &str = "pty";
pub const STATE_OPER_FIELD: &str = "oper_state";
pub const STATE_LAST_HEARTBEAT_FIELD: &str = "last_heartbeat";

pub const OPER_UNKNOWN: &str = "unknown";
pub const OPER_UP: &str = "up";
pub const OPER_DOWN: &str = "down";

/// True iff `fields[field] == "yes"`.
pub fn is_yes(fields: Option<&FieldMap>, field: &str) -> bool {
    fields
        .and_then(|f| f.get(field))
        .map(|value| value == YES)
        .unwrap_or(false)
}

/// Whether the console-server feature is enabled.
pub fn console_mgmt_enabled(source: &(impl ConfigSource + ?Sized)) -> bool {
    let entry = source.get_entry(CONSOLE_SWITCH_TABLE, CONSOLE_MGMT_KEY);
    is_yes(entry.as_ref(), ENABLED_FIELD)
}

/// Whether the console-client heartbeat is enabled.
pub fn controlled_device_enabled(source: &(impl ConfigSource + ?Sized)) -> bool {
    let entry = source.get_entry(CONSOLE_SWITCH_TABLE, CONTROLLED_DEVICE_KEY);
    is_yes(entry.as_ref(), ENABLED_FIELD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{field_map, ConfigSnapshot};

    fn switch(key: &str, value: &str) -> ConfigSnapshot {
        ConfigSnapshot::new().with_entry(
            CONSOLE_SWITCH_TABLE,
            key,
            field_map([(ENABLED_FIELD, value)]),
        )
    }

    #[test]
    fn only_yes_enables() {
        assert!(console_mgmt_enabled(&switch(CONSOLE_MGMT_KEY, "yes")));
        assert!(!console_mgmt_enabled(&switch(CONSOLE_MGMT_KEY, "no")));
        assert!(!console_mgmt_enabled(&switch(CONSOLE_MGMT_KEY, "YES")));
        assert!(!console_mgmt_enabled(&switch(CONSOLE_MGMT_KEY, "")));
    }

    #[test]
    fn missing_entry_or_field_is_disabled() {
        assert!(!console_mgmt_enabled(&ConfigSnapshot::new()));
        assert!(!controlled_device_enabled(&ConfigSnapshot::new()));
        let no_field = ConfigSnapshot::new().with_entry(
            CONSOLE_SWITCH_TABLE,
            CONTROLLED_DEVICE_KEY,
            FieldMap::new(),
        );
        assert!(!controlled_device_enabled(&no_field));
    }

    #[test]
    fn flags_are_independent() {
        let snapshot = switch(CONTROLLED_DEVICE_KEY, "yes");
        assert!(controlled_device_enabled(&snapshot));
        assert!(!console_mgmt_enabled(&snapshot));
    }
}
