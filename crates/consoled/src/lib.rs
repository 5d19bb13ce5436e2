//! Serial console management for network switches.
//!
//! Two roles share one framing protocol:
//! - DCE (console server): every configured console line is bridged to a
//!   pty reachable through a `/dev/VC0-<n>` symlink
//! - DTE (console client): the switch's own console line carries a periodic
//!   heartbeat so the upstream console server can tell it is alive
//!
//! # Crate Structure
//!
//! - [`frame`]: Heartbeat framing, stream filter and frame writer
//! - [`config`]: Configuration provider, file watcher and port naming
//! - [`serial`]: Raw serial devices, ptys and pty symlinks
//! - [`service`]: DCE reconciler, DTE heartbeat service and dispatch loop

/// Re-export frame types.
pub mod frame {
    pub use consoled_frame::*;
}

/// Re-export configuration types.
pub mod config {
    pub use consoled_config::*;
}

/// Re-export serial line types.
pub mod serial {
    pub use consoled_serial::*;
}

/// Re-export service types.
pub mod service {
    pub use consoled_service::*;
}
