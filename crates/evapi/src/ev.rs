//! The bound handle and call redirection.

use std::os::unix::io::RawFd;

use evapi_core::registry::{self, API_NAME};
use evapi_core::{
    AnyWatcher, ApiVersion, BindResult, BreakHow, CheckWatcher, ChildWatcher, EvApi, HostHandle,
    IdleWatcher, IoWatcher, PeriodicWatcher, PrepareWatcher, Registry, Revents, RunFlags,
    SignalSpec, SignalWatcher, StatWatcher, TimerWatcher, Tstamp, Versioned,
};

/// Bind `consumer` to the table in the process-wide registry.
pub fn import(consumer: &str) -> BindResult<Ev> {
    import_with(registry::global(), ApiVersion::CURRENT, consumer)
}

/// Bind `consumer` to the table in `registry`, requiring `expected`.
pub fn import_with(
    registry: &Registry<EvApi>,
    expected: ApiVersion,
    consumer: &str,
) -> BindResult<Ev> {
    registry.bind(API_NAME, expected, consumer).map(|api| Ev { api })
}

/// A validated, cached reference to the provider's table.
#[derive(Clone, Copy)]
pub struct Ev {
    api: &'static EvApi,
}

impl Ev {
    /// Bind against an injected registry with this crate's version.
    pub fn bind_in(registry: &Registry<EvApi>, consumer: &str) -> BindResult<Ev> {
        import_with(registry, ApiVersion::CURRENT, consumer)
    }

    /// Version the provider published.
    pub fn api_version(&self) -> ApiVersion {
        self.api.api_version()
    }

    /// Both handles call through the same table?
    pub fn same_table(&self, other: &Ev) -> bool {
        self.api.same_table(other.api)
    }

    pub fn table(&self) -> &'static EvApi {
        self.api
    }

    // marshalling

    #[inline]
    pub fn sv_fileno(&self, handle: &HostHandle<'_>) -> Option<RawFd> {
        (self.api.sv_fileno)(handle)
    }

    #[inline]
    pub fn sv_signum(&self, spec: &SignalSpec<'_>) -> Option<i32> {
        (self.api.sv_signum)(spec)
    }

    // time

    /// Loop time, cached once per iteration.
    #[inline]
    pub fn now(&self) -> Tstamp {
        (self.api.now)()
    }

    #[inline]
    pub fn time(&self) -> Tstamp {
        (self.api.time)()
    }

    // loop control

    #[inline]
    pub fn backend(&self) -> u32 {
        (self.api.backend)()
    }

    #[inline]
    pub fn run(&self, flags: RunFlags) {
        (self.api.run)(flags)
    }

    #[inline]
    pub fn break_loop(&self, how: BreakHow) {
        (self.api.break_loop)(how)
    }

    #[inline]
    pub fn ref_loop(&self) {
        (self.api.ref_loop)()
    }

    #[inline]
    pub fn unref_loop(&self) {
        (self.api.unref_loop)()
    }

    /// One-shot wait on `fd` and/or `timeout`. A negative fd skips the io
    /// part, a negative timeout waits indefinitely.
    pub fn once<F>(&self, fd: RawFd, events: Revents, timeout: Tstamp, cb: F)
    where
        F: FnOnce(Revents) + 'static,
    {
        (self.api.once)(fd, events, timeout, Box::new(cb))
    }

    // pending

    #[inline]
    pub fn clear_pending(&self, w: &dyn AnyWatcher) -> Revents {
        (self.api.clear_pending)(w)
    }

    #[inline]
    pub fn invoke(&self, w: &dyn AnyWatcher, revents: Revents) {
        (self.api.invoke)(w, revents)
    }
}

macro_rules! redirect {
    ($($name:ident($ty:ty);)*) => {
        impl Ev {
            $(
                #[inline]
                pub fn $name(&self, w: &$ty) {
                    (self.api.$name)(w)
                }
            )*
        }
    };
}

redirect! {
    io_start(IoWatcher);
    io_stop(IoWatcher);
    timer_start(TimerWatcher);
    timer_stop(TimerWatcher);
    timer_again(TimerWatcher);
    periodic_start(PeriodicWatcher);
    periodic_stop(PeriodicWatcher);
    signal_start(SignalWatcher);
    signal_stop(SignalWatcher);
    child_start(ChildWatcher);
    child_stop(ChildWatcher);
    stat_start(StatWatcher);
    stat_stop(StatWatcher);
    stat_stat(StatWatcher);
    idle_start(IdleWatcher);
    idle_stop(IdleWatcher);
    prepare_start(PrepareWatcher);
    prepare_stop(PrepareWatcher);
    check_start(CheckWatcher);
    check_stop(CheckWatcher);
}

impl std::fmt::Debug for Ev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ev")
            .field("api", &self.api_version())
            .field("table", &(self.api as *const EvApi))
            .finish()
    }
}
