use std::io::{self, ErrorKind, Write};
use std::time::{Duration, Instant};

use bytes::BytesMut;

use crate::codec::{encode_frame, Frame, DEFAULT_MAX_PAYLOAD};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 64;

/// How long a sink may refuse bytes before a write gives up.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

const STALL_BACKOFF: Duration = Duration::from_millis(1);

/// Writes complete, delimited frames to any `Write` sink.
///
/// Each frame is written in full and flushed before `write_frame` returns,
/// so frames never interleave with other writers sharing the line. A sink
/// that keeps reporting `WouldBlock` for longer than the write timeout fails
/// the call with `ErrorKind::TimedOut`.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    max_payload_size: usize,
    write_timeout: Duration,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with the default payload limit.
    pub fn new(inner: T) -> Self {
        Self::with_max_payload(inner, DEFAULT_MAX_PAYLOAD)
    }

    /// Create a new frame writer with an explicit payload limit.
    pub fn with_max_payload(inner: T, max_payload_size: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            max_payload_size,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Bound how long a non-blocking sink may stall a single call.
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Encode and write one frame (blocking).
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.payload.len() > self.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.max_payload_size,
            });
        }

        self.buf.clear();
        encode_frame(frame, &mut self.buf);

        let mut offset = 0usize;
        let mut stalled_since = None;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => {
                    offset += n;
                    stalled_since = None;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    self.back_off(&mut stalled_since)?
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Write a heartbeat carrying `seq`.
    pub fn send_heartbeat(&mut self, seq: u8) -> Result<()> {
        self.write_frame(&Frame::heartbeat(seq))
    }

    /// Flush the underlying sink.
    pub fn flush(&mut self) -> Result<()> {
        let mut stalled_since = None;
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    self.back_off(&mut stalled_since)?
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    fn back_off(&self, stalled_since: &mut Option<Instant>) -> Result<()> {
        let since = *stalled_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= self.write_timeout {
            return Err(FrameError::Io(io::Error::new(
                ErrorKind::TimedOut,
                format!("sink stalled for {:?}", self.write_timeout),
            )));
        }
        std::thread::sleep(STALL_BACKOFF);
        Ok(())
    }

    /// Borrow the underlying sink.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner sink.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::filter::FrameFilter;
    use crate::frame_type::FrameType;

    fn decode_all(wire: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut filter = FrameFilter::new().on_frame(|frame| frames.push(frame));
        filter.process(wire);
        drop(filter);
        frames
    }

    #[test]
    fn writes_heartbeat() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.send_heartbeat(12).unwrap();

        let wire = writer.into_inner().into_inner();
        assert_eq!(wire, Frame::heartbeat(12).build().to_vec());
    }

    #[test]
    fn writes_multiple_frames() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.send_heartbeat(1).unwrap();
        writer.send_heartbeat(2).unwrap();
        writer
            .write_frame(&Frame::new(3, FrameType::Unknown(0x30), &b"abc"[..]))
            .unwrap();

        let frames = decode_all(&writer.into_inner().into_inner());
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].seq, 2);
        assert_eq!(frames[2].payload.as_ref(), b"abc");
    }

    #[test]
    fn payload_too_large_rejected() {
        let mut writer = FrameWriter::with_max_payload(Cursor::new(Vec::<u8>::new()), 4);
        let frame = Frame::new(0, FrameType::Unknown(0x30), &b"oversized"[..]);
        let err = writer.write_frame(&frame).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 9, max: 4 }));
        assert!(writer.get_ref().get_ref().is_empty());
    }

    #[test]
    fn flush_propagates() {
        let sink = FlushTrackingWriter::default();
        let flag = Arc::clone(&sink.flushed);
        let mut writer = FrameWriter::new(sink);

        writer.send_heartbeat(1).unwrap();

        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn retries_interrupted_and_would_block() {
        let sink = FlakyWriter {
            failures: vec![ErrorKind::Interrupted, ErrorKind::WouldBlock],
            data: Vec::new(),
        };
        let mut writer = FrameWriter::new(sink);
        writer.send_heartbeat(200).unwrap();

        let inner = writer.into_inner();
        assert_eq!(inner.data, Frame::heartbeat(200).build().to_vec());
    }

    #[test]
    fn connection_closed_when_write_returns_zero() {
        let mut writer = FrameWriter::new(ZeroWriter);
        let err = writer.send_heartbeat(1).unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn io_error_propagates() {
        let sink = FlakyWriter {
            failures: vec![ErrorKind::BrokenPipe],
            data: Vec::new(),
        };
        let mut writer = FrameWriter::new(sink);
        let err = writer.send_heartbeat(1).unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == ErrorKind::BrokenPipe));
    }

    #[test]
    fn stalled_sink_times_out() {
        let mut writer =
            FrameWriter::new(StalledWriter::default()).with_write_timeout(Duration::from_millis(20));
        let started = Instant::now();
        let err = writer.send_heartbeat(1).unwrap_err();

        assert!(matches!(err, FrameError::Io(ref e) if e.kind() == ErrorKind::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(writer.get_ref().attempts > 1);
    }

    #[test]
    fn stalled_flush_times_out() {
        let sink = StalledWriter {
            accept_writes: true,
            ..StalledWriter::default()
        };
        let mut writer = FrameWriter::new(sink).with_write_timeout(Duration::from_millis(20));
        let err = writer.send_heartbeat(1).unwrap_err();
        assert!(matches!(err, FrameError::Io(ref e) if e.kind() == ErrorKind::TimedOut));
    }

    #[derive(Default)]
    struct StalledWriter {
        accept_writes: bool,
        attempts: usize,
    }

    impl Write for StalledWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.attempts += 1;
            if self.accept_writes {
                return Ok(buf.len());
            }
            Err(std::io::Error::from(ErrorKind::WouldBlock))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::Error::from(ErrorKind::WouldBlock))
        }
    }

    #[derive(Default)]
    struct FlushTrackingWriter {
        flushed: Arc<AtomicBool>,
        data: Vec<u8>,
    }

    impl Write for FlushTrackingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FlakyWriter {
        failures: Vec<ErrorKind>,
        data: Vec<u8>,
    }

    impl Write for FlakyWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if !self.failures.is_empty() {
                return Err(std::io::Error::from(self.failures.remove(0)));
            }
            // Short writes exercise the offset loop.
            let n = buf.len().min(3);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
