use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use consoled_config::tables::console_mgmt_enabled;
use consoled_config::{
    load_port_configs, ConfigSnapshot, ConfigSource, ConsoleNaming, FieldMap, Operation,
    PortConfig, SharedStateTable,
};
use tracing::{debug, info, warn};

use crate::proxy::{ProxyFactory, ProxySpec, ProxyWorker};

/// Runtime record of one live proxy worker.
#[derive(Debug)]
pub struct ProxyHandle<W> {
    pub link_id: String,
    pub device: PathBuf,
    pub baud: u32,
    pub pty_symlink_path: PathBuf,
    worker: W,
}

impl<W: ProxyWorker> ProxyHandle<W> {
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub fn worker(&self) -> &W {
        &self.worker
    }

    fn matches(&self, config: &PortConfig) -> bool {
        self.baud == config.baud && self.device == config.device
    }
}

/// Links started and stopped by one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

/// Console-server service: one proxy worker per configured line while
/// `CONSOLE_SWITCH|console_mgmt` is enabled.
///
/// Every change recomputes the full desired set and converges the live
/// workers to it. A line whose baud rate or device changed is restarted.
pub struct DceService<C, F: ProxyFactory> {
    config: C,
    factory: F,
    naming: ConsoleNaming,
    state_table: SharedStateTable,
    proxies: BTreeMap<String, ProxyHandle<F::Worker>>,
    running: bool,
}

impl<C: ConfigSource, F: ProxyFactory> DceService<C, F> {
    pub fn new(config: C, factory: F, naming: ConsoleNaming, state_table: SharedStateTable) -> Self {
        Self {
            config,
            factory,
            naming,
            state_table,
            proxies: BTreeMap::new(),
            running: false,
        }
    }

    pub fn naming(&self) -> &ConsoleNaming {
        &self.naming
    }

    /// Prefix of the operator-facing pty symlinks, e.g. `/dev/VC0-`.
    pub fn pty_symlink_prefix(&self) -> String {
        self.naming.pty_symlink_prefix()
    }

    pub fn proxies(&self) -> &BTreeMap<String, ProxyHandle<F::Worker>> {
        &self.proxies
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether `CONSOLE_SWITCH|console_mgmt|enabled` is `"yes"`.
    pub fn check_feature_enabled(&self) -> bool {
        console_mgmt_enabled(&self.config)
    }

    /// Every configured line, keyed by link id.
    pub fn get_all_configs(&self) -> BTreeMap<String, PortConfig> {
        load_port_configs(&self.config, &self.naming)
    }

    /// Converge the live workers to the current configuration.
    pub fn sync(&mut self) -> SyncReport {
        let desired = self.desired_from(&self.config);
        self.converge(desired)
    }

    /// Bootstrap from the startup snapshot.
    pub fn load_initial_config(&mut self, snapshot: &ConfigSnapshot) -> SyncReport {
        self.running = true;
        let desired = self.desired_from(snapshot);
        let report = self.converge(desired);
        info!(proxies = self.proxies.len(), "initial console server configuration applied");
        report
    }

    /// React to a `CONSOLE_PORT` change.
    pub fn console_port_handler(&mut self, key: &str, op: Operation, fields: &FieldMap) -> SyncReport {
        debug!(key, %op, ?fields, "console port changed");
        self.sync()
    }

    /// React to a `CONSOLE_SWITCH` change.
    pub fn console_switch_handler(
        &mut self,
        key: &str,
        op: Operation,
        fields: &FieldMap,
    ) -> SyncReport {
        debug!(key, %op, ?fields, "console switch changed");
        self.sync()
    }

    /// Stop every worker.
    pub fn shutdown(&mut self) {
        let ids: Vec<String> = self.proxies.keys().cloned().collect();
        for link_id in ids {
            self.remove_proxy(&link_id);
        }
        self.running = false;
        info!("console server stopped");
    }

    fn desired_from(&self, source: &(impl ConfigSource + ?Sized)) -> BTreeMap<String, PortConfig> {
        if console_mgmt_enabled(source) {
            load_port_configs(source, &self.naming)
        } else {
            BTreeMap::new()
        }
    }

    fn converge(&mut self, desired: BTreeMap<String, PortConfig>) -> SyncReport {
        let mut report = SyncReport::default();

        let stale: Vec<String> = self
            .proxies
            .iter()
            .filter(|(id, handle)| desired.get(*id).is_none_or(|cfg| !handle.matches(cfg)))
            .map(|(id, _)| id.clone())
            .collect();
        for link_id in stale {
            self.remove_proxy(&link_id);
            report.stopped.push(link_id);
        }

        let prefix = self.pty_symlink_prefix();
        let mut pending: Vec<(PortConfig, F::Worker)> = desired
            .into_values()
            .filter(|cfg| !self.proxies.contains_key(&cfg.link_id))
            .map(|cfg| {
                let worker = self.factory.create(ProxySpec {
                    link_id: cfg.link_id.clone(),
                    device: cfg.device.clone(),
                    baud: cfg.baud,
                    state_table: self.state_table.clone(),
                    pty_symlink_prefix: prefix.clone(),
                });
                (cfg, worker)
            })
            .collect();

        start_all(&mut pending);

        for (cfg, worker) in pending {
            let pty_symlink_path = PathBuf::from(format!("{prefix}{}", cfg.link_id));
            report.started.push(cfg.link_id.clone());
            self.proxies.insert(
                cfg.link_id.clone(),
                ProxyHandle {
                    link_id: cfg.link_id,
                    device: cfg.device,
                    baud: cfg.baud,
                    pty_symlink_path,
                    worker,
                },
            );
        }

        if !report.is_empty() {
            info!(
                started = ?report.started,
                stopped = ?report.stopped,
                proxies = self.proxies.len(),
                "console server reconciled"
            );
        }
        report
    }

    fn remove_proxy(&mut self, link_id: &str) {
        if let Some(mut handle) = self.proxies.remove(link_id) {
            handle.worker.stop();
            debug!(link_id, device = ?handle.device, "proxy removed");
        }
    }
}

/// Start workers concurrently so one slow line does not hold up the rest.
///
/// The reconciler records every worker whatever the outcome.
fn start_all<W: ProxyWorker>(pending: &mut [(PortConfig, W)]) {
    match pending {
        [] => {}
        [(cfg, worker)] => report_start(&cfg.link_id, &cfg.device, worker.start()),
        _ => std::thread::scope(|scope| {
            let started: Vec<_> = pending
                .iter_mut()
                .map(|(cfg, worker)| {
                    let link_id = cfg.link_id.as_str();
                    let device = cfg.device.as_path();
                    scope.spawn(move || report_start(link_id, device, worker.start()))
                })
                .collect();
            for handle in started {
                if handle.join().is_err() {
                    warn!("proxy start panicked");
                }
            }
        }),
    }
}

fn report_start(link_id: &str, device: &Path, ok: bool) {
    if ok {
        debug!(link_id, ?device, "proxy start requested");
    } else {
        warn!(link_id, ?device, "proxy did not start; keeping its slot");
    }
}

impl<C, F: ProxyFactory> Drop for DceService<C, F> {
    fn drop(&mut self) {
        for handle in self.proxies.values_mut() {
            handle.worker.stop();
        }
    }
}
