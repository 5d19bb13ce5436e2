use bytes::BytesMut;

use crate::codec::{decode_frame, Frame, DLE, EOF, EOF_SEQUENCE, SOF, SOF_SEQUENCE};

const INITIAL_BUFFER_CAPACITY: usize = 4 * 1024;

/// Default limit for the escaped content of a frame still waiting for its EOF.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024;

type FrameCallback<'a> = Box<dyn FnMut(Frame) + 'a>;
type UserDataCallback<'a> = Box<dyn FnMut(&[u8]) + 'a>;

/// Counters describing what a filter has seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    /// Frames decoded and delivered.
    pub frames: u64,
    /// Delimited frames dropped because they failed to decode or were cut short.
    pub malformed: u64,
    /// Pass-through bytes delivered as user data.
    pub user_bytes: u64,
    /// Incomplete frames handed back as user data.
    pub released_partials: u64,
}

enum Scan {
    /// EOF sequence found at this offset.
    Complete(usize),
    /// A fresh SOF sequence started at this offset before the open frame ended.
    Restart(usize),
    /// Need more input; resume scanning at this offset.
    Incomplete(usize),
}

/// Streaming demultiplexer for a serial byte stream.
///
/// Bytes are split into decoded [`Frame`]s and opaque pass-through chunks.
/// Pass-through bytes are flushed as soon as the next frame boundary is
/// seen, or when the owner reports inactivity via [`FrameFilter::on_timeout`].
///
/// One filter is bound to one stream; it is not shared across connections.
pub struct FrameFilter<'a> {
    buf: BytesMut,
    in_frame: bool,
    scan_pos: usize,
    max_frame_len: usize,
    on_frame: Option<FrameCallback<'a>>,
    on_user_data: Option<UserDataCallback<'a>>,
    stats: FilterStats,
}

impl<'a> FrameFilter<'a> {
    /// Create a filter with no callbacks registered.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            in_frame: false,
            scan_pos: 0,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            on_frame: None,
            on_user_data: None,
            stats: FilterStats::default(),
        }
    }

    /// Register the decoded-frame callback.
    pub fn on_frame(mut self, callback: impl FnMut(Frame) + 'a) -> Self {
        self.on_frame = Some(Box::new(callback));
        self
    }

    /// Register the pass-through callback.
    pub fn on_user_data(mut self, callback: impl FnMut(&[u8]) + 'a) -> Self {
        self.on_user_data = Some(Box::new(callback));
        self
    }

    /// Override the open-frame length guard.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Feed the next chunk of the stream.
    pub fn process(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);

        loop {
            if !self.in_frame {
                match find_sequence(&self.buf[self.scan_pos..], &SOF_SEQUENCE) {
                    Some(offset) => {
                        let start = self.scan_pos + offset;
                        if start > 0 {
                            let data = self.buf.split_to(start);
                            self.emit_user_data(&data);
                        }
                        self.in_frame = true;
                        self.scan_pos = SOF_SEQUENCE.len();
                    }
                    None => {
                        // Resume where a marker split across chunks could begin.
                        self.scan_pos = self.buf.len().saturating_sub(SOF_SEQUENCE.len() - 1);
                        return;
                    }
                }
            }

            match self.scan_open_frame() {
                Scan::Complete(end) => {
                    let wire = self.buf.split_to(end + EOF_SEQUENCE.len());
                    self.in_frame = false;
                    self.scan_pos = 0;
                    match decode_frame(&wire[SOF_SEQUENCE.len()..end]) {
                        Some(frame) => self.emit_frame(frame),
                        None => {
                            self.stats.malformed += 1;
                            tracing::debug!(len = wire.len(), "discarding malformed frame");
                        }
                    }
                }
                Scan::Restart(start) => {
                    let dropped = self.buf.split_to(start);
                    self.stats.malformed += 1;
                    self.scan_pos = SOF_SEQUENCE.len();
                    tracing::debug!(len = dropped.len(), "discarding truncated frame");
                }
                Scan::Incomplete(resume) => {
                    self.scan_pos = resume;
                    if self.buf.len() - SOF_SEQUENCE.len() > self.max_frame_len {
                        tracing::debug!(
                            len = self.buf.len(),
                            max = self.max_frame_len,
                            "open frame exceeded length guard, passing through"
                        );
                        self.release_partial();
                    }
                    return;
                }
            }
        }
    }

    /// Flush buffered pass-through bytes after a period of inactivity.
    ///
    /// An incomplete frame is left untouched.
    pub fn on_timeout(&mut self) {
        if self.in_frame || self.buf.is_empty() {
            return;
        }
        let data = self.buf.split();
        self.scan_pos = 0;
        self.emit_user_data(&data);
    }

    /// Give up on an incomplete frame and deliver its bytes as user data.
    ///
    /// Returns true when something was released.
    pub fn abandon_partial(&mut self) -> bool {
        if !self.in_frame {
            return false;
        }
        self.release_partial();
        true
    }

    /// True while a frame has started but its EOF has not arrived.
    pub fn in_frame(&self) -> bool {
        self.in_frame
    }

    /// Bytes currently held back.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Counters collected so far.
    pub fn stats(&self) -> FilterStats {
        self.stats
    }

    fn release_partial(&mut self) {
        let data = self.buf.split();
        self.in_frame = false;
        self.scan_pos = 0;
        self.stats.released_partials += 1;
        self.emit_user_data(&data);
    }

    // Escape-aware: a DLE and the byte after it are always consumed together.
    fn scan_open_frame(&self) -> Scan {
        let buf = &self.buf[..];
        let mut i = self.scan_pos;
        while i < buf.len() {
            let byte = buf[i];
            if byte == DLE {
                if i + 1 >= buf.len() {
                    return Scan::Incomplete(i);
                }
                i += 2;
                continue;
            }
            if byte == EOF || byte == SOF {
                let rest = &buf[i..];
                if rest.len() < EOF_SEQUENCE.len() {
                    if rest.iter().all(|&b| b == byte) {
                        return Scan::Incomplete(i);
                    }
                } else if rest[..EOF_SEQUENCE.len()] == EOF_SEQUENCE {
                    return Scan::Complete(i);
                } else if rest[..SOF_SEQUENCE.len()] == SOF_SEQUENCE {
                    return Scan::Restart(i);
                }
            }
            i += 1;
        }
        Scan::Incomplete(i)
    }

    fn emit_frame(&mut self, frame: Frame) {
        self.stats.frames += 1;
        if let Some(callback) = self.on_frame.as_mut() {
            callback(frame);
        }
    }

    fn emit_user_data(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.stats.user_bytes += data.len() as u64;
        if let Some(callback) = self.on_user_data.as_mut() {
            callback(data);
        }
    }
}

impl Default for FrameFilter<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameFilter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameFilter")
            .field("buffered", &self.buf.len())
            .field("in_frame", &self.in_frame)
            .field("max_frame_len", &self.max_frame_len)
            .field("stats", &self.stats)
            .finish()
    }
}

fn find_sequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
