use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use consoled_config::tables::{CONSOLE_PORT_TABLE, CONSOLE_SWITCH_TABLE};
use consoled_config::{ConfigEvent, ConfigProvider, ConfigSnapshot, ConfigSource};
use tracing::{debug, info, warn};

use crate::dce::DceService;
use crate::dte::DteService;
use crate::error::Result;
use crate::proxy::ProxyFactory;

/// How often the dispatch loop rechecks its running flag while idle.
pub const DISPATCH_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A service driven by configuration changes.
pub trait ConfigHandler {
    /// Tables the handler reads and follows.
    fn tables(&self) -> &'static [&'static str];

    /// Apply the startup snapshot.
    fn load_initial_config(&mut self, snapshot: &ConfigSnapshot) -> Result<()>;

    /// Apply one change notification.
    fn handle_event(&mut self, event: &ConfigEvent) -> Result<()>;
}

/// Drive `handler` from `provider` until `running` is cleared.
///
/// The subscription is taken before the snapshot so no change can fall
/// between the two. Events are handled strictly one at a time; a failing
/// event is logged and the loop moves on.
pub fn run_dispatch<P, H>(provider: &P, handler: &mut H, running: &AtomicBool) -> Result<()>
where
    P: ConfigProvider + ?Sized,
    H: ConfigHandler,
{
    let tables = handler.tables();
    let subscription = provider.subscribe(tables);
    let snapshot = provider.snapshot(tables);
    handler.load_initial_config(&snapshot)?;
    info!(?tables, "configuration dispatch started");

    while running.load(Ordering::SeqCst) {
        let Some(event) = subscription.recv_timeout(DISPATCH_POLL_INTERVAL)? else {
            continue;
        };
        debug!(table = %event.table, key = %event.key, op = %event.op, "configuration event");
        if let Err(err) = handler.handle_event(&event) {
            warn!(table = %event.table, key = %event.key, error = %err, "configuration event failed");
        }
    }

    info!("configuration dispatch stopped");
    Ok(())
}

impl<C: ConfigSource, F: ProxyFactory> ConfigHandler for DceService<C, F> {
    fn tables(&self) -> &'static [&'static str] {
        &[CONSOLE_PORT_TABLE, CONSOLE_SWITCH_TABLE]
    }

    fn load_initial_config(&mut self, snapshot: &ConfigSnapshot) -> Result<()> {
        DceService::load_initial_config(self, snapshot);
        Ok(())
    }

    fn handle_event(&mut self, event: &ConfigEvent) -> Result<()> {
        match event.table.as_str() {
            CONSOLE_PORT_TABLE => {
                self.console_port_handler(&event.key, event.op, &event.fields);
            }
            CONSOLE_SWITCH_TABLE => {
                self.console_switch_handler(&event.key, event.op, &event.fields);
            }
            _ => {}
        }
        Ok(())
    }
}

impl<C: ConfigSource> ConfigHandler for DteService<C> {
    fn tables(&self) -> &'static [&'static str] {
        &[CONSOLE_SWITCH_TABLE]
    }

    fn load_initial_config(&mut self, snapshot: &ConfigSnapshot) -> Result<()> {
        DteService::load_initial_config(self, snapshot)
    }

    fn handle_event(&mut self, event: &ConfigEvent) -> Result<()> {
        if event.table == CONSOLE_SWITCH_TABLE {
            self.console_switch_handler(&event.key, event.op, &event.fields)?;
        }
        Ok(())
    }
}
