use std::cell::Cell;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use consoled_config::tables::{
    OPER_DOWN, OPER_UNKNOWN, OPER_UP, STATE_LAST_HEARTBEAT_FIELD, STATE_OPER_FIELD,
    STATE_PTY_FIELD,
};
use consoled_config::{field_map, SharedStateTable};
use consoled_frame::FrameFilter;
use consoled_serial::{wait_readable, write_all, Pty, PtySymlink, SerialDevice};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, ServiceError};

const READ_BUFFER_SIZE: usize = 4096;

/// Everything a proxy worker is constructed with.
#[derive(Clone)]
pub struct ProxySpec {
    pub link_id: String,
    pub device: PathBuf,
    pub baud: u32,
    pub state_table: SharedStateTable,
    pub pty_symlink_prefix: String,
}

impl ProxySpec {
    /// Operator-facing symlink for this line, e.g. `/dev/VC0-1`.
    pub fn pty_symlink_path(&self) -> PathBuf {
        PathBuf::from(format!("{}{}", self.pty_symlink_prefix, self.link_id))
    }
}

impl std::fmt::Debug for ProxySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySpec")
            .field("link_id", &self.link_id)
            .field("device", &self.device)
            .field("baud", &self.baud)
            .field("pty_symlink_prefix", &self.pty_symlink_prefix)
            .finish()
    }
}

/// Lifecycle of one per-line worker as seen by the reconciler.
pub trait ProxyWorker: Send {
    /// Best effort; failure is logged by the worker and reported as `false`.
    fn start(&mut self) -> bool;

    /// Release everything the worker holds. Safe to call when not started.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Builds workers for the reconciler.
pub trait ProxyFactory {
    type Worker: ProxyWorker;

    fn create(&self, spec: ProxySpec) -> Self::Worker;
}

/// Timing policy of a [`SerialProxy`] bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyTimings {
    /// Readiness poll tick; also the longest pass-through bytes are held
    /// back, whether or not the line goes quiet.
    pub poll_interval: Duration,
    /// Silence after the last heartbeat before the line is reported down.
    pub heartbeat_timeout: Duration,
    /// Idle time after which an unterminated frame is given back as data.
    pub partial_frame_timeout: Duration,
    /// Longest wait for a full output queue before bytes are dropped.
    pub write_timeout: Duration,
}

impl Default for ProxyTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_secs(15),
            partial_frame_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
        }
    }
}

struct Bridge {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    _symlink: PtySymlink,
}

/// Bridges a physical console line to a pty.
///
/// Serial input is demultiplexed: heartbeat frames update the line's
/// state entry, everything else is forwarded to the pty. Pty input is
/// written to the line unchanged.
pub struct SerialProxy {
    spec: ProxySpec,
    timings: ProxyTimings,
    bridge: Option<Bridge>,
}

impl SerialProxy {
    pub fn new(spec: ProxySpec, timings: ProxyTimings) -> Self {
        Self {
            spec,
            timings,
            bridge: None,
        }
    }

    pub fn spec(&self) -> &ProxySpec {
        &self.spec
    }

    fn open_bridge(&self) -> Result<Bridge> {
        let device = SerialDevice::open(&self.spec.device, self.spec.baud)?;
        let pty = Pty::open()?;
        let link_path = self.spec.pty_symlink_path();
        let symlink = PtySymlink::create(pty.slave_path(), &link_path)?;

        self.spec.state_table.set(
            &self.spec.link_id,
            field_map([
                (STATE_PTY_FIELD, &*link_path.to_string_lossy()),
                (STATE_OPER_FIELD, OPER_UNKNOWN),
            ]),
        );

        let stop = Arc::new(AtomicBool::new(false));
        let ctx = BridgeContext {
            link_id: self.spec.link_id.clone(),
            state_table: self.spec.state_table.clone(),
            timings: self.timings,
            stop: stop.clone(),
        };
        let handle = std::thread::Builder::new()
            .name(format!("proxy-{}", self.spec.link_id))
            .spawn(move || ctx.run(device, pty))
            .map_err(ServiceError::Spawn)?;

        Ok(Bridge {
            stop,
            handle,
            _symlink: symlink,
        })
    }
}

impl ProxyWorker for SerialProxy {
    fn start(&mut self) -> bool {
        if self.bridge.is_some() {
            return true;
        }
        match self.open_bridge() {
            Ok(bridge) => {
                info!(
                    link_id = %self.spec.link_id,
                    device = ?self.spec.device,
                    baud = self.spec.baud,
                    "proxy started"
                );
                self.bridge = Some(bridge);
                true
            }
            Err(err) => {
                warn!(link_id = %self.spec.link_id, error = %err, "proxy failed to start");
                false
            }
        }
    }

    fn stop(&mut self) {
        let Some(bridge) = self.bridge.take() else {
            return;
        };
        bridge.stop.store(true, Ordering::Release);
        if bridge.handle.join().is_err() {
            warn!(link_id = %self.spec.link_id, "proxy bridge panicked");
        }
        self.spec.state_table.del(&self.spec.link_id);
        info!(link_id = %self.spec.link_id, "proxy stopped");
    }

    fn is_running(&self) -> bool {
        self.bridge
            .as_ref()
            .is_some_and(|bridge| !bridge.handle.is_finished())
    }
}

impl Drop for SerialProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds [`SerialProxy`] workers sharing one timing policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialProxyFactory {
    pub timings: ProxyTimings,
}

impl SerialProxyFactory {
    pub fn new(timings: ProxyTimings) -> Self {
        Self { timings }
    }
}

impl ProxyFactory for SerialProxyFactory {
    type Worker = SerialProxy;

    fn create(&self, spec: ProxySpec) -> SerialProxy {
        SerialProxy::new(spec, self.timings)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Paces pass-through flushes so a line that never goes quiet still
/// delivers its bytes at least once per interval.
struct FlushClock {
    interval: Duration,
    last: Instant,
}

impl FlushClock {
    fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last: now,
        }
    }

    fn due(&mut self, now: Instant, idle: bool) -> bool {
        if idle || now.duration_since(self.last) >= self.interval {
            self.last = now;
            return true;
        }
        false
    }
}

struct BridgeContext {
    link_id: String,
    state_table: SharedStateTable,
    timings: ProxyTimings,
    stop: Arc<AtomicBool>,
}

impl BridgeContext {
    fn set_oper(&self, oper: &str) {
        self.state_table
            .set(&self.link_id, field_map([(STATE_OPER_FIELD, oper)]));
    }

    fn run(self, device: SerialDevice, pty: Pty) {
        let link_id = self.link_id.as_str();
        let master: &File = pty.master();
        let write_timeout = self.timings.write_timeout;
        let heartbeat = Cell::new(None::<u8>);

        let mut filter = FrameFilter::new()
            .on_frame(|frame| {
                if frame.is_heartbeat() {
                    heartbeat.set(Some(frame.seq));
                } else {
                    debug!(link_id, seq = frame.seq, kind = frame.frame_type.name(), "ignoring frame");
                }
            })
            .on_user_data(|data| {
                if let Err(err) = write_all(master, data, write_timeout) {
                    trace!(link_id, len = data.len(), error = %err, "pty output dropped");
                }
            });

        let fds = [device.as_raw_fd(), pty.as_raw_fd()];
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut last_input = Instant::now();
        let mut flush_clock = FlushClock::new(self.timings.poll_interval, last_input);
        let mut last_heartbeat: Option<Instant> = None;
        let mut up = false;

        while !self.stop.load(Ordering::Acquire) {
            let ready = match wait_readable(&fds, self.timings.poll_interval) {
                Ok(ready) => ready,
                Err(err) => {
                    warn!(link_id, error = %err, "poll failed");
                    break;
                }
            };
            let now = Instant::now();

            let mut idle = true;
            if ready[0] {
                match (&device).read(&mut buf) {
                    Ok(0) => {
                        warn!(link_id, "serial device closed");
                        break;
                    }
                    Ok(n) => {
                        idle = false;
                        last_input = now;
                        filter.process(&buf[..n]);
                    }
                    Err(err)
                        if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                    Err(err) => {
                        warn!(link_id, error = %err, "serial read failed");
                        break;
                    }
                }
            }

            if ready[1] {
                match (&*master).read(&mut buf) {
                    Ok(0) => {}
                    Ok(n) => {
                        if let Err(err) = device.write_all_timeout(&buf[..n], write_timeout) {
                            warn!(link_id, error = %err, "serial write failed");
                        }
                    }
                    Err(err)
                        if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                    Err(err) => {
                        warn!(link_id, error = %err, "pty read failed");
                        break;
                    }
                }
            }

            if let Some(seq) = heartbeat.take() {
                trace!(link_id, seq, "heartbeat");
                last_heartbeat = Some(now);
                if !up {
                    info!(link_id, "line is up");
                }
                up = true;
                self.state_table.set(
                    link_id,
                    field_map([
                        (STATE_OPER_FIELD, OPER_UP.to_string()),
                        (STATE_LAST_HEARTBEAT_FIELD, unix_now().to_string()),
                    ]),
                );
            }

            if flush_clock.due(now, idle) {
                filter.on_timeout();
            }
            if idle {
                if filter.in_frame()
                    && now.duration_since(last_input) > self.timings.partial_frame_timeout
                {
                    debug!(link_id, "abandoning unterminated frame");
                    filter.abandon_partial();
                }
            }

            if up
                && last_heartbeat
                    .is_some_and(|at| now.duration_since(at) > self.timings.heartbeat_timeout)
            {
                info!(link_id, "heartbeat lost; line is down");
                up = false;
                self.set_oper(OPER_DOWN);
            }
        }

        let stats = filter.stats();
        debug!(
            link_id,
            frames = stats.frames,
            malformed = stats.malformed,
            user_bytes = stats.user_bytes,
            "bridge exiting"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use consoled_config::MemoryStateTable;
    use consoled_frame::Frame;

    use super::*;

    fn unique_temp_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "consoled-proxy-{tag}-{}-{nanos}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn spec(device: PathBuf, state: &MemoryStateTable, prefix: String) -> ProxySpec {
        ProxySpec {
            link_id: "1".to_string(),
            device,
            baud: 9600,
            state_table: Arc::new(state.clone()),
            pty_symlink_prefix: prefix,
        }
    }

    fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let until = Instant::now() + deadline;
        while Instant::now() < until {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    #[test]
    fn flush_clock_fires_on_idle_or_after_interval() {
        let start = Instant::now();
        let mut clock = FlushClock::new(Duration::from_millis(100), start);

        assert!(!clock.due(start + Duration::from_millis(40), false));
        assert!(!clock.due(start + Duration::from_millis(99), false));
        assert!(clock.due(start + Duration::from_millis(100), false));
        assert!(!clock.due(start + Duration::from_millis(150), false));
        assert!(clock.due(start + Duration::from_millis(150), true));
        assert!(!clock.due(start + Duration::from_millis(200), false));
        assert!(clock.due(start + Duration::from_millis(250), false));
    }

    #[test]
    fn symlink_path_joins_prefix_and_link() {
        let state = MemoryStateTable::new();
        let spec = spec(PathBuf::from("/dev/C0-1"), &state, "/dev/VC0-".to_string());
        assert_eq!(spec.pty_symlink_path(), PathBuf::from("/dev/VC0-1"));
    }

    #[test]
    fn start_fails_softly_without_device() {
        let state = MemoryStateTable::new();
        let dir = unique_temp_dir("missing");
        let prefix = format!("{}/VC0-", dir.display());
        let mut proxy = SerialProxy::new(
            spec(dir.join("C0-1"), &state, prefix),
            ProxyTimings::default(),
        );

        assert!(!proxy.start());
        assert!(!proxy.is_running());
        assert!(state.get("1").is_none());
        assert!(std::fs::symlink_metadata(dir.join("VC0-1")).is_err());

        proxy.stop();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bridges_pty_line_and_tracks_heartbeats() {
        // A pty pair stands in for the physical line: the proxy opens its
        // slave side, the test drives the master side as the remote device.
        let mut line = Pty::open().unwrap();
        let state = MemoryStateTable::new();
        let dir = unique_temp_dir("bridge");
        let prefix = format!("{}/VC0-", dir.display());
        let timings = ProxyTimings {
            poll_interval: Duration::from_millis(20),
            heartbeat_timeout: Duration::from_millis(300),
            ..ProxyTimings::default()
        };
        let mut proxy = SerialProxy::new(
            spec(line.slave_path().to_path_buf(), &state, prefix),
            timings,
        );

        assert!(proxy.start());
        assert!(proxy.is_running());
        let link = dir.join("VC0-1");
        let entry = state.get("1").unwrap();
        assert_eq!(entry[STATE_PTY_FIELD], link.to_string_lossy());
        assert_eq!(entry[STATE_OPER_FIELD], OPER_UNKNOWN);

        let mut user = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&link)
            .unwrap();

        let mut wire = b"login: ".to_vec();
        wire.extend_from_slice(&Frame::heartbeat(1).build());
        line.master_mut().write_all(&wire).unwrap();

        assert!(wait_for(Duration::from_secs(5), || {
            state
                .get("1")
                .is_some_and(|e| e.get(STATE_OPER_FIELD).map(String::as_str) == Some(OPER_UP))
        }));
        assert!(state.get("1").unwrap().contains_key(STATE_LAST_HEARTBEAT_FIELD));

        let ready = wait_readable(&[user.as_raw_fd()], Duration::from_secs(5)).unwrap();
        assert_eq!(ready, vec![true]);
        let mut out = [0u8; 64];
        let n = user.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"login: ");

        user.write_all(b"admin\r").unwrap();
        assert!(wait_for(Duration::from_secs(5), || {
            wait_readable(&[line.as_raw_fd()], Duration::from_millis(10))
                .map(|r| r[0])
                .unwrap_or(false)
        }));
        let n = line.master_mut().read(&mut out).unwrap();
        assert_eq!(&out[..n], b"admin\r");

        assert!(wait_for(Duration::from_secs(5), || {
            state
                .get("1")
                .is_some_and(|e| e.get(STATE_OPER_FIELD).map(String::as_str) == Some(OPER_DOWN))
        }));

        proxy.stop();
        assert!(!proxy.is_running());
        assert!(state.get("1").is_none());
        assert!(std::fs::symlink_metadata(&link).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn busy_line_still_delivers_pass_through() {
        let line = Pty::open().unwrap();
        let state = MemoryStateTable::new();
        let dir = unique_temp_dir("busy");
        let prefix = format!("{}/VC0-", dir.display());
        let timings = ProxyTimings {
            poll_interval: Duration::from_millis(20),
            ..ProxyTimings::default()
        };
        let mut proxy = SerialProxy::new(
            spec(line.slave_path().to_path_buf(), &state, prefix),
            timings,
        );
        assert!(proxy.start());

        let mut user = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join("VC0-1"))
            .unwrap();

        // Keep the line busy for far longer than the delivery deadline.
        let streaming = Arc::new(AtomicBool::new(true));
        let mut remote = line.master().try_clone().unwrap();
        let feeder = {
            let streaming = Arc::clone(&streaming);
            std::thread::spawn(move || {
                let until = Instant::now() + Duration::from_secs(3);
                while Instant::now() < until {
                    let _ = remote.write_all(b"x");
                    std::thread::sleep(Duration::from_millis(5));
                }
                streaming.store(false, Ordering::Release);
            })
        };

        let ready = wait_readable(&[user.as_raw_fd()], Duration::from_secs(1)).unwrap();
        assert_eq!(ready, vec![true]);
        assert!(streaming.load(Ordering::Acquire));
        let mut out = [0u8; 256];
        let n = user.read(&mut out).unwrap();
        assert!(n > 0);
        assert!(out[..n].iter().all(|&b| b == b'x'));

        feeder.join().unwrap();
        proxy.stop();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
