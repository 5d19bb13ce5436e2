//! Control framing for serial console lines.
//!
//! Control frames travel inside an otherwise transparent serial byte stream.
//! Every frame is:
//! - delimited by a 3-byte SOF sequence and a 3-byte EOF sequence
//! - byte-stuffed so the delimiters never appear inside its content
//! - protected by a CRC-16/MODBUS over its body
//!
//! [`FrameFilter`] splits a live stream back into frames and pass-through
//! user data; [`FrameWriter`] puts frames on the wire.

pub mod codec;
pub mod error;
pub mod filter;
pub mod frame_type;
pub mod writer;

pub use codec::{
    crc16_modbus, decode_frame, encode_frame, escape_data, unescape_data, Frame,
    DEFAULT_MAX_PAYLOAD, DLE, EOF, EOF_SEQUENCE, SOF, SOF_SEQUENCE,
};
pub use error::{FrameError, Result};
pub use filter::{FilterStats, FrameFilter, DEFAULT_MAX_FRAME_LEN};
pub use frame_type::{FrameType, HEARTBEAT};
pub use writer::{FrameWriter, DEFAULT_WRITE_TIMEOUT};
