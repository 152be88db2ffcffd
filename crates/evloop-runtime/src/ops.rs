//! Raw operations on the calling thread's default loop.
//!
//! These are the functions `EV_API` points at. Each one looks up the
//! thread's loop (creating it on first use) and forwards.

use std::os::unix::io::RawFd;

use evapi_core::{
    kwarn, AnyWatcher, BreakHow, CheckWatcher, ChildWatcher, IdleWatcher, IoWatcher,
    OnceCallback, PeriodicWatcher, PrepareWatcher, Revents, RunFlags, SignalWatcher,
    StatWatcher, TimerWatcher, Tstamp,
};

use crate::clock::wall_now;
use crate::ev_loop::EvLoop;

thread_local! {
    static DEFAULT_LOOP: EvLoop = EvLoop::default();
}

/// The calling thread's default loop.
pub fn default_loop() -> EvLoop {
    DEFAULT_LOOP.with(EvLoop::clone)
}

fn with_loop<R>(f: impl FnOnce(&EvLoop) -> R) -> Option<R> {
    match DEFAULT_LOOP.try_with(|lp| f(lp)) {
        Ok(r) => Some(r),
        Err(_) => {
            kwarn!("default loop already torn down on this thread");
            None
        }
    }
}

pub fn now() -> Tstamp {
    with_loop(EvLoop::now).unwrap_or_else(wall_now)
}

pub fn time() -> Tstamp {
    wall_now()
}

pub fn backend() -> u32 {
    with_loop(EvLoop::backend).unwrap_or(0)
}

pub fn run(flags: RunFlags) {
    // run on a clone: callbacks may reach the loop through the thread-local
    if let Some(lp) = with_loop(EvLoop::clone) {
        lp.run(flags);
    }
}

pub fn break_loop(how: BreakHow) {
    with_loop(|lp| lp.break_loop(how));
}

pub fn ref_loop() {
    with_loop(EvLoop::ref_loop);
}

pub fn unref_loop() {
    with_loop(EvLoop::unref_loop);
}

pub fn once(fd: RawFd, events: Revents, timeout: Tstamp, cb: OnceCallback) {
    with_loop(|lp| lp.once(fd, events, timeout, cb));
}

pub fn clear_pending(w: &dyn AnyWatcher) -> Revents {
    with_loop(|lp| lp.clear_pending(w)).unwrap_or(Revents::NONE)
}

pub fn invoke(w: &dyn AnyWatcher, revents: Revents) {
    w.invoke(revents);
}

macro_rules! forward {
    ($($name:ident($ty:ty);)*) => {
        $(
            pub fn $name(w: &$ty) {
                with_loop(|lp| lp.$name(w));
            }
        )*
    };
}

forward! {
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
