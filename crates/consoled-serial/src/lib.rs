//! Unix plumbing for serial console lines.
//!
//! - [`SerialDevice`]: a raw 8N1 serial port at a fixed baud rate
//! - [`Pty`]: a pseudo-terminal pair exposing a line to local users
//! - [`PtySymlink`]: the stable operator-facing name of a pty
//! - [`wait_readable`]: `poll(2)` over a set of descriptors

pub mod error;

#[cfg(unix)]
pub mod device;
#[cfg(unix)]
pub mod pty;

pub use error::{Result, SerialError};

#[cfg(unix)]
pub use device::{speed_for_baud, wait_readable, write_all, SerialDevice};
#[cfg(unix)]
pub use pty::{Pty, PtySymlink};
