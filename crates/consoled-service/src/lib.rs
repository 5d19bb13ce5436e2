//! Console server and console client services.
//!
//! - [`DceService`] keeps one [`ProxyWorker`] per configured console line
//!   while the console-server feature is enabled.
//! - [`DteService`] owns the switch's own console line and runs a
//!   heartbeat toward the upstream console server while the
//!   controlled-device feature is enabled.
//!
//! Both implement [`ConfigHandler`]; [`run_dispatch`] feeds them the
//! startup snapshot and every later change, one at a time.

pub mod cmdline;
pub mod dce;
pub mod dispatch;
pub mod dte;
pub mod error;
pub mod heartbeat;
pub mod proxy;

pub use cmdline::{parse_cmdline, read_proc_cmdline, ConsoleParam};
pub use dce::{DceService, ProxyHandle, SyncReport};
pub use dispatch::{run_dispatch, ConfigHandler, DISPATCH_POLL_INTERVAL};
pub use dte::DteService;
pub use error::{Result, ServiceError};
pub use heartbeat::{tick, HeartbeatLoop, SharedWriter, DEFAULT_HEARTBEAT_INTERVAL};
pub use proxy::{
    ProxyFactory, ProxySpec, ProxyTimings, ProxyWorker, SerialProxy, SerialProxyFactory,
};
