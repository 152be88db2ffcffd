//! # evapi-core
//!
//! The part of the event-loop API that provider and consumers share verbatim.
//!
//! A provider (the module that owns the loop) fills in an [`EvApi`] table and
//! publishes it into a [`Registry`]. Consumers bind to it by name, which checks
//! the table's version/revision against the one they were built with, and then
//! call loop operations through the cached table.
//!
//! ## Modules
//!
//! - `version` - `ApiVersion` and the compatibility rule
//! - `table` - `EvApi`, the `#[repr(C)]` capability table
//! - `registry` - publish / lookup / bind
//! - `watcher` - watcher handles, kinds and event masks
//! - `handle` - host handle to fd / signal number conversion
//! - `error` - bind and publish errors
//! - `kprint` - kernel-style logging macros
//! - `env` - environment variable helpers

pub mod version;
pub mod table;
pub mod registry;
pub mod watcher;
pub mod handle;
pub mod error;
pub mod kprint;
pub mod env;

pub use version::{ApiVersion, Versioned, API_REVISION, API_VERSION};
pub use table::{EvApi, OnceCallback};
pub use registry::{Publish, Registry, API_NAME};
pub use watcher::{
    AnyWatcher, BreakHow, Callback, Check, CheckWatcher, Child, ChildWatcher, Idle, IdleWatcher,
    Io, IoWatcher, Periodic, PeriodicWatcher, Prepare, PrepareWatcher, Revents, RunFlags, Signal,
    SignalWatcher, Stat, StatAttr, StatWatcher, Timer, TimerWatcher, Tstamp, Watcher,
    WatcherHeader, WatcherKind,
};
pub use handle::{sv_fileno, sv_signum, HostHandle, SignalSpec};
pub use error::{BindError, BindResult, PublishError};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str};

/// Backend identifiers reported by `EvApi::backend`.
pub mod backend {
    pub const SELECT: u32 = 0x0000_0001;
    pub const POLL: u32 = 0x0000_0002;
    pub const EPOLL: u32 = 0x0000_0004;
}
