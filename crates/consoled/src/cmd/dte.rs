use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use consoled_config::{ConfigFileWatcher, MemoryConfigStore, DEFAULT_BAUD};
use consoled_service::{read_proc_cmdline, run_dispatch, DteService, HeartbeatLoop};
use tracing::info;

use crate::cmd::{install_ctrlc_handler, parse_duration, DteArgs};
use crate::exit::{config_error, service_error, CliResult, SUCCESS};

pub fn run(args: DteArgs) -> CliResult<i32> {
    let heartbeat_interval = parse_duration(&args.heartbeat_interval)?;
    let reload_delay = parse_duration(&args.reload_delay)?;

    let (tty_name, baud) = match args.tty {
        Some(tty) => (tty, args.baud.unwrap_or(DEFAULT_BAUD)),
        None => {
            let param = read_proc_cmdline(&args.cmdline)
                .map_err(|err| service_error("boot command line", err))?;
            (param.tty_name, param.baud)
        }
    };

    let store = MemoryConfigStore::new();
    let watcher = ConfigFileWatcher::spawn(args.config.clone(), store.clone(), reload_delay)
        .map_err(|err| config_error("configuration", err))?;

    let mut service = DteService::new(
        store.clone(),
        &tty_name,
        baud,
        HeartbeatLoop::new(heartbeat_interval),
    );
    service
        .open()
        .map_err(|err| service_error("console line", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;
    info!(tty = %tty_name, baud, interval = ?heartbeat_interval, "console client starting");

    let result = run_dispatch(&store, &mut service, &running);
    service.shutdown();
    drop(watcher);
    result.map_err(|err| service_error("dte", err))?;

    info!(seq = service.seq(), "console client stopped");
    Ok(SUCCESS)
}
