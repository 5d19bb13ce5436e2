use std::io::{ErrorKind, Read};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use consoled_config::tables::controlled_device_enabled;
use consoled_config::{ConfigSnapshot, ConfigSource, FieldMap, Operation};
use consoled_frame::FrameFilter;
use consoled_serial::{wait_readable, SerialDevice};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, ServiceError};
use crate::heartbeat::{HeartbeatLoop, SharedWriter};

const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct ReadFlow {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ReadFlow {
    fn spawn(device: SerialDevice) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name("dte-read".to_string())
            .spawn(move || read_loop(device, &flag))
            .map_err(ServiceError::Spawn)?;
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        self.stop.store(true, Ordering::Release);
        if self.handle.join().is_err() {
            warn!("serial read thread panicked");
        }
    }
}

fn read_loop(mut device: SerialDevice, stop: &AtomicBool) {
    let mut filter = FrameFilter::new()
        .on_frame(|frame| {
            debug!(seq = frame.seq, kind = frame.frame_type.name(), "frame received");
        })
        .on_user_data(|data| trace!(len = data.len(), "console data"));

    let fd = device.as_raw_fd();
    let mut buf = [0u8; 1024];
    while !stop.load(Ordering::Acquire) {
        match wait_readable(&[fd], READ_POLL_INTERVAL) {
            Ok(ready) if ready[0] => {}
            Ok(_) => {
                filter.on_timeout();
                continue;
            }
            Err(err) => {
                warn!(error = %err, "poll failed");
                break;
            }
        }
        match device.read(&mut buf) {
            Ok(0) => {
                warn!(path = ?device.path(), "serial device closed");
                break;
            }
            Ok(n) => filter.process(&buf[..n]),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(err) => {
                warn!(error = %err, "serial read failed");
                break;
            }
        }
    }
}

/// Console-client service: one serial line toward an upstream console
/// server, with a heartbeat gated by `CONSOLE_SWITCH|controlled_device`.
///
/// Runtime states are `Stopped` and `Running { enabled }`; only `enabled`
/// transitions start or stop the heartbeat.
pub struct DteService<C> {
    config: C,
    tty_name: String,
    baud: u32,
    device_path: PathBuf,
    running: bool,
    enabled: bool,
    heartbeat: HeartbeatLoop,
    writer: Option<SharedWriter>,
    reader: Option<ReadFlow>,
}

impl<C: ConfigSource> DteService<C> {
    pub fn new(config: C, tty_name: &str, baud: u32, heartbeat: HeartbeatLoop) -> Self {
        Self {
            config,
            tty_name: tty_name.to_string(),
            baud,
            device_path: PathBuf::from(format!("/dev/{tty_name}")),
            running: false,
            enabled: false,
            heartbeat,
            writer: None,
            reader: None,
        }
    }

    pub fn tty_name(&self) -> &str {
        &self.tty_name
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the heartbeat loop is currently active.
    pub fn heartbeat_active(&self) -> bool {
        self.heartbeat.is_running()
    }

    /// Sequence number of the last heartbeat written.
    pub fn seq(&self) -> u8 {
        self.heartbeat.seq()
    }

    pub fn heartbeat_starts(&self) -> u64 {
        self.heartbeat.starts()
    }

    pub fn heartbeat_stops(&self) -> u64 {
        self.heartbeat.stops()
    }

    /// Open the serial line, start the read flow and use the line for
    /// heartbeats.
    pub fn open(&mut self) -> Result<()> {
        let device = SerialDevice::open(&self.device_path, self.baud)?;
        let reader = device.try_clone()?;
        self.reader = Some(ReadFlow::spawn(reader)?);
        self.attach_writer(SharedWriter::new(device));
        info!(tty = %self.tty_name, baud = self.baud, "console line open");
        Ok(())
    }

    /// Use `writer` as the serial line for heartbeats.
    pub fn attach_writer(&mut self, writer: SharedWriter) {
        self.writer = Some(writer);
        self.running = true;
    }

    /// Whether `CONSOLE_SWITCH|controlled_device|enabled` is `"yes"`.
    pub fn check_enabled(&self) -> bool {
        controlled_device_enabled(&self.config)
    }

    /// Bootstrap from the startup snapshot, after [`DteService::open`].
    pub fn load_initial_config(&mut self, snapshot: &ConfigSnapshot) -> Result<()> {
        let enabled = controlled_device_enabled(snapshot);
        info!(enabled, "initial console client configuration");
        self.apply_enabled(enabled)
    }

    /// Start the heartbeat loop. No-op if already running.
    pub fn start_heartbeat(&mut self) -> Result<()> {
        let writer = self
            .writer
            .clone()
            .ok_or_else(|| ServiceError::NotOpen(self.device_path.clone()))?;
        if self.heartbeat.start(writer)? {
            info!(interval = ?self.heartbeat.interval(), "heartbeat enabled");
        }
        Ok(())
    }

    /// Stop the heartbeat loop; on return no further heartbeat is written.
    pub fn stop_heartbeat(&mut self) {
        if self.heartbeat.stop() {
            info!("heartbeat disabled");
        }
    }

    /// React to a `CONSOLE_SWITCH` change.
    ///
    /// Only an actual change of the enabled flag starts or stops the
    /// heartbeat; repeating the current value does nothing.
    pub fn console_switch_handler(
        &mut self,
        key: &str,
        op: Operation,
        fields: &FieldMap,
    ) -> Result<()> {
        debug!(key, %op, ?fields, "console switch changed");
        let enabled = self.check_enabled();
        if enabled == self.enabled {
            return Ok(());
        }
        self.apply_enabled(enabled)
    }

    // The flag only turns on once the heartbeat is actually running, so a
    // failed start is retried by the next event carrying "yes".
    fn apply_enabled(&mut self, enabled: bool) -> Result<()> {
        if !enabled {
            self.stop_heartbeat();
            self.enabled = false;
            return Ok(());
        }
        if let Err(err) = self.start_heartbeat() {
            warn!(error = %err, "heartbeat not started");
            return Err(err);
        }
        self.enabled = true;
        Ok(())
    }

    /// Stop both flows and release the line.
    pub fn shutdown(&mut self) {
        self.stop_heartbeat();
        if let Some(reader) = self.reader.take() {
            reader.stop();
        }
        self.writer = None;
        self.running = false;
        info!(tty = %self.tty_name, "console client stopped");
    }
}

impl<C> Drop for DteService<C> {
    fn drop(&mut self) {
        self.heartbeat.stop();
        if let Some(reader) = self.reader.take() {
            reader.stop();
        }
    }
}
