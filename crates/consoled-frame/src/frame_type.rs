//! Frame type identifiers.
//!
//! Only the heartbeat type is defined today. Every other value still
//! decodes so that callers can decide what to do with it.

/// Liveness signal carrying only a sequence number.
pub const HEARTBEAT: u8 = 0x01;

/// Type byte of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Heartbeat,
    Unknown(u8),
}

impl FrameType {
    /// Wire value of this type.
    pub fn as_u8(self) -> u8 {
        match self {
            FrameType::Heartbeat => HEARTBEAT,
            FrameType::Unknown(value) => value,
        }
    }

    /// Human-readable name, used in logs and CLI output.
    pub fn name(self) -> &'static str {
        match self {
            FrameType::Heartbeat => "HEARTBEAT",
            FrameType::Unknown(_) => "UNKNOWN",
        }
    }
}

impl From<u8> for FrameType {
    fn from(value: u8) -> Self {
        match value {
            HEARTBEAT => FrameType::Heartbeat,
            other => FrameType::Unknown(other),
        }
    }
}
