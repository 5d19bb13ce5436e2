use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use consoled_frame::{FrameWriter, DEFAULT_WRITE_TIMEOUT};
use tracing::{debug, trace, warn};

use crate::error::{Result, ServiceError};

/// Default time between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A `Write` sink shared between owners; each call locks the inner sink.
#[derive(Clone)]
pub struct SharedWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl SharedWriter {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().flush()
    }
}

impl std::fmt::Debug for SharedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedWriter").finish_non_exhaustive()
    }
}

/// Advance `seq` (mod 256) and write a heartbeat carrying the new value.
///
/// The sequence advances even if the write fails.
pub fn tick<W: Write>(seq: &AtomicU8, writer: &mut FrameWriter<W>) -> Result<u8> {
    let next = seq.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
    writer.send_heartbeat(next)?;
    Ok(next)
}

struct Running {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Periodic heartbeat writer.
///
/// The first heartbeat is written as soon as the loop starts, then one per
/// interval. [`HeartbeatLoop::stop`] returns only after the writer thread
/// has exited, so no write can follow it.
pub struct HeartbeatLoop {
    interval: Duration,
    seq: Arc<AtomicU8>,
    running: Option<Running>,
    starts: u64,
    stops: u64,
}

impl HeartbeatLoop {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            seq: Arc::new(AtomicU8::new(0)),
            running: None,
            starts: 0,
            stops: 0,
        }
    }

    /// Continue the sequence from `seq`; the next heartbeat carries `seq + 1`.
    pub fn with_initial_seq(self, seq: u8) -> Self {
        self.seq.store(seq, Ordering::Release);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sequence number of the last heartbeat written.
    pub fn seq(&self) -> u8 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Number of times the loop was actually started.
    pub fn starts(&self) -> u64 {
        self.starts
    }

    /// Number of times a running loop was actually stopped.
    pub fn stops(&self) -> u64 {
        self.stops
    }

    /// Start writing heartbeats to `writer`. Returns `false` if already running.
    pub fn start<W: Write + Send + 'static>(&mut self, writer: W) -> Result<bool> {
        if self.running.is_some() {
            return Ok(false);
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let seq = self.seq.clone();
        let interval = self.interval;
        let handle = std::thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || {
                // A stalled line must not hold the thread past the next stop request.
                let mut writer = FrameWriter::new(writer)
                    .with_write_timeout(interval.min(DEFAULT_WRITE_TIMEOUT));
                loop {
                    match tick(&seq, &mut writer) {
                        Ok(seq) => trace!(seq, "heartbeat sent"),
                        Err(err) => warn!(error = %err, "heartbeat write failed"),
                    }
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(ServiceError::Spawn)?;

        self.running = Some(Running { stop_tx, handle });
        self.starts += 1;
        debug!(interval = ?self.interval, "heartbeat started");
        Ok(true)
    }

    /// Stop the loop and wait for it to exit. Returns `false` if not running.
    pub fn stop(&mut self) -> bool {
        let Some(running) = self.running.take() else {
            return false;
        };
        let _ = running.stop_tx.send(());
        if running.handle.join().is_err() {
            warn!("heartbeat thread panicked");
        }
        self.stops += 1;
        debug!(seq = self.seq(), "heartbeat stopped");
        true
    }
}

impl Default for HeartbeatLoop {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL)
    }
}

impl Drop for HeartbeatLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for HeartbeatLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatLoop")
            .field("interval", &self.interval)
            .field("seq", &self.seq())
            .field("running", &self.is_running())
            .finish()
    }
}
