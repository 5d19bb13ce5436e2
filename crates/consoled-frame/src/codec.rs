use bytes::{BufMut, Bytes, BytesMut};

use crate::frame_type::FrameType;

/// Start-of-frame marker byte.
pub const SOF: u8 = 0x05;

/// End-of-frame marker byte.
pub const EOF: u8 = 0x00;

/// Escape byte (data link escape).
pub const DLE: u8 = 0x10;

/// Literal prefix written before every frame.
pub const SOF_SEQUENCE: [u8; 3] = [SOF; 3];

/// Literal suffix written after every frame.
pub const EOF_SEQUENCE: [u8; 3] = [EOF; 3];

/// Body header: seq (1) + type (1).
pub const BODY_HEADER_SIZE: usize = 2;

/// Trailing CRC-16 size.
pub const CRC_SIZE: usize = 2;

/// Default maximum payload size accepted by the writer.
pub const DEFAULT_MAX_PAYLOAD: usize = 256;

/// A control frame multiplexed into the serial byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sequence number, wraps modulo 256.
    pub seq: u8,
    /// Frame type.
    pub frame_type: FrameType,
    /// Type-specific payload (empty for heartbeats).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(seq: u8, frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            seq,
            frame_type,
            payload: payload.into(),
        }
    }

    /// Create a heartbeat frame with an empty payload.
    pub fn heartbeat(seq: u8) -> Self {
        Self::new(seq, FrameType::Heartbeat, Bytes::new())
    }

    /// True iff this frame is a heartbeat.
    pub fn is_heartbeat(&self) -> bool {
        self.frame_type == FrameType::Heartbeat
    }

    /// Serialize into the delimited wire format.
    pub fn build(&self) -> Bytes {
        let mut dst = BytesMut::new();
        encode_frame(self, &mut dst);
        dst.freeze()
    }

    /// Decode the content found strictly between `SOF_SEQUENCE` and `EOF_SEQUENCE`.
    ///
    /// Returns `None` for truncated content or a CRC mismatch.
    pub fn parse(content: &[u8]) -> Option<Self> {
        decode_frame(content)
    }
}

/// CRC-16/MODBUS (reflected polynomial 0xA001, initial value 0xFFFF).
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn is_reserved(byte: u8) -> bool {
    matches!(byte, SOF | EOF | DLE)
}

/// Byte-stuff `data` into `dst`, prefixing every SOF, EOF and DLE byte with DLE.
pub fn escape_into(data: &[u8], dst: &mut BytesMut) {
    dst.reserve(data.len());
    for &byte in data {
        if is_reserved(byte) {
            dst.put_u8(DLE);
        }
        dst.put_u8(byte);
    }
}

/// Byte-stuff `data`.
pub fn escape_data(data: &[u8]) -> Vec<u8> {
    let mut dst = BytesMut::with_capacity(data.len() * 2);
    escape_into(data, &mut dst);
    dst.to_vec()
}

/// Reverse [`escape_data`] in a single left-to-right pass.
///
/// A trailing DLE with no following byte is dropped.
pub fn unescape_data(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut bytes = data.iter();
    while let Some(&byte) = bytes.next() {
        if byte == DLE {
            match bytes.next() {
                Some(&literal) => out.push(literal),
                None => tracing::trace!("dropping dangling escape byte"),
            }
        } else {
            out.push(byte);
        }
    }
    out
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬──────────────────────────────────────────────┬──────────────┐
/// │ SOF (3B)     │ escape( seq(1B) type(1B) payload  CRC16(2B LE) ) │ EOF (3B)     │
/// │ 05 05 05     │                                              │ 00 00 00     │
/// └──────────────┴──────────────────────────────────────────────┴──────────────┘
/// ```
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) {
    let mut body = BytesMut::with_capacity(BODY_HEADER_SIZE + frame.payload.len() + CRC_SIZE);
    body.put_u8(frame.seq);
    body.put_u8(frame.frame_type.as_u8());
    body.put_slice(&frame.payload);
    let crc = crc16_modbus(&body);
    body.put_u16_le(crc);

    dst.reserve(SOF_SEQUENCE.len() + body.len() * 2 + EOF_SEQUENCE.len());
    dst.put_slice(&SOF_SEQUENCE);
    escape_into(&body, dst);
    dst.put_slice(&EOF_SEQUENCE);
}

/// Decode delimited frame content (without SOF/EOF sequences).
pub fn decode_frame(content: &[u8]) -> Option<Frame> {
    let raw = unescape_data(content);
    if raw.len() < BODY_HEADER_SIZE + CRC_SIZE {
        tracing::debug!(len = raw.len(), "frame content too short");
        return None;
    }

    let (body, crc_bytes) = raw.split_at(raw.len() - CRC_SIZE);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let computed = crc16_modbus(body);
    if received != computed {
        tracing::debug!(received, computed, "frame CRC mismatch");
        return None;
    }

    Some(Frame {
        seq: body[0],
        frame_type: FrameType::from(body[1]),
        payload: Bytes::copy_from_slice(&body[BODY_HEADER_SIZE..]),
    })
}
