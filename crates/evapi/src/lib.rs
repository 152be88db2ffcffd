//! # evapi - consumer facade for the `ev::API` table
//!
//! A consumer binds once at init and then drives the provider's loop through
//! the returned [`Ev`] handle. Every method is a single indirect call through
//! the cached table.
//!
//! ## Quick Start
//!
//! ```ignore
//! use evapi::{i_ev_api, Ev, Revents, RunFlags, Timer, TimerWatcher};
//!
//! fn init() -> evapi::BindResult<Ev> {
//!     let ev = i_ev_api!("timer-plugin")?;
//!     let tick = TimerWatcher::new(Timer::new(0.5, 0.5), |_, _| println!("tick"));
//!     ev.timer_start(&tick);
//!     ev.run(RunFlags::DEFAULT);
//!     Ok(ev)
//! }
//! ```
//!
//! Failures are reported at bind time only: [`BindError::NotFound`] when no
//! provider has published yet, [`BindError::VersionMismatch`] when the
//! published table is older than or incompatible with the one this consumer
//! was compiled against.

mod ev;
mod slot;

pub use ev::{import, import_with, Ev};
pub use slot::EvSlot;

pub use evapi_core::registry::{self, global, Publish, Registry, API_NAME};
pub use evapi_core::watcher::{MAXPRI, MINPRI};
pub use evapi_core::{
    backend, env, kprint, AnyWatcher, ApiVersion, BindError, BindResult, BreakHow, Callback,
    Check, CheckWatcher, Child, ChildWatcher, EvApi, HostHandle, Idle, IdleWatcher, Io,
    IoWatcher, OnceCallback, Periodic, PeriodicWatcher, Prepare, PrepareWatcher, PublishError,
    Revents, RunFlags, Signal, SignalSpec, SignalWatcher, Stat, StatAttr, StatWatcher, Timer,
    TimerWatcher, Tstamp, Versioned, Watcher, WatcherHeader, WatcherKind, API_REVISION,
    API_VERSION,
};
pub use evapi_core::{kdebug, kerror, kinfo, kprintln, ktrace, kwarn};

/// Bind to the published `ev::API` table, checking it against the version
/// this consumer is being compiled with.
///
/// `i_ev_api!("name")` binds against the process-wide registry;
/// `i_ev_api!(SLOT, "name")` also caches the handle in an [`EvSlot`].
#[macro_export]
macro_rules! i_ev_api {
    ($consumer:expr) => {
        $crate::import_with(
            $crate::global(),
            $crate::ApiVersion::new($crate::API_VERSION, $crate::API_REVISION),
            $consumer,
        )
    };
    ($slot:expr, $consumer:expr) => {
        $slot.init_with(
            $crate::global(),
            $crate::ApiVersion::new($crate::API_VERSION, $crate::API_REVISION),
            $consumer,
        )
    };
}
