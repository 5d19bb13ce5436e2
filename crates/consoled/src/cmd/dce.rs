use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use consoled_config::{
    ConfigFileWatcher, ConsoleNaming, MemoryConfigStore, MemoryStateTable, SharedStateTable,
};
use consoled_service::{run_dispatch, DceService, ProxyTimings, SerialProxyFactory};
use tracing::info;

use crate::cmd::{install_ctrlc_handler, parse_duration, DceArgs};
use crate::exit::{config_error, service_error, CliResult, SUCCESS};

pub fn run(args: DceArgs) -> CliResult<i32> {
    let reload_delay = parse_duration(&args.reload_delay)?;
    let heartbeat_timeout = parse_duration(&args.heartbeat_timeout)?;

    let naming = match &args.udev_prefix_file {
        Some(path) => {
            ConsoleNaming::from_file(path).map_err(|err| config_error("udev prefix", err))?
        }
        None => ConsoleNaming::new(args.udev_prefix.clone()),
    };

    let store = MemoryConfigStore::new();
    let watcher = ConfigFileWatcher::spawn(args.config.clone(), store.clone(), reload_delay)
        .map_err(|err| config_error("configuration", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let timings = ProxyTimings {
        heartbeat_timeout,
        ..ProxyTimings::default()
    };
    let state_table: SharedStateTable = Arc::new(MemoryStateTable::new());
    let mut service = DceService::new(
        store.clone(),
        SerialProxyFactory::new(timings),
        naming,
        state_table,
    );
    info!(
        udev_prefix = service.naming().udev_prefix(),
        pty_prefix = %service.pty_symlink_prefix(),
        "console server starting"
    );

    let result = run_dispatch(&store, &mut service, &running);
    service.shutdown();
    drop(watcher);
    result.map_err(|err| service_error("dce", err))?;

    info!("console server stopped");
    Ok(SUCCESS)
}
