//! The capability table.
//!
//! Layout for version 3 (fields in this order, never reordered):
//!
//! ```text
//! ver, rev
//! sv_fileno, sv_signum                       host handle conversion
//! now, time                                  clocks
//! backend, run, break_loop, ref_loop,        loop control
//!   unref_loop, once
//! clear_pending, invoke                      pending introspection
//! io_start, io_stop
//! timer_start, timer_stop, timer_again
//! periodic_start, periodic_stop
//! signal_start, signal_stop
//! child_start, child_stop
//! stat_start, stat_stop, stat_stat
//! idle_start, idle_stop
//! prepare_start, prepare_stop
//! check_start, check_stop
//! ```
//!
//! New fields may only be appended, together with a revision bump.

use std::fmt;
use std::os::unix::io::RawFd;

use crate::handle::{HostHandle, SignalSpec};
use crate::version::{ApiVersion, Versioned};
use crate::watcher::{
    AnyWatcher, BreakHow, CheckWatcher, ChildWatcher, IdleWatcher, IoWatcher, PeriodicWatcher,
    PrepareWatcher, Revents, RunFlags, SignalWatcher, StatWatcher, TimerWatcher, Tstamp,
};

/// Completion callback of the one-shot wait. Receives the events that ended
/// the wait (`TIMER` on timeout).
pub type OnceCallback = Box<dyn FnOnce(Revents)>;

/// Function table a provider publishes and consumers call through.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct EvApi {
    pub ver: u32,
    pub rev: u32,

    pub sv_fileno: fn(&HostHandle<'_>) -> Option<RawFd>,
    pub sv_signum: fn(&SignalSpec<'_>) -> Option<i32>,

    pub now: fn() -> Tstamp,
    pub time: fn() -> Tstamp,
    pub backend: fn() -> u32,
    pub run: fn(RunFlags),
    pub break_loop: fn(BreakHow),
    pub ref_loop: fn(),
    pub unref_loop: fn(),
    pub once: fn(RawFd, Revents, Tstamp, OnceCallback),
    pub clear_pending: fn(&dyn AnyWatcher) -> Revents,
    pub invoke: fn(&dyn AnyWatcher, Revents),

    pub io_start: fn(&IoWatcher),
    pub io_stop: fn(&IoWatcher),
    pub timer_start: fn(&TimerWatcher),
    pub timer_stop: fn(&TimerWatcher),
    pub timer_again: fn(&TimerWatcher),
    pub periodic_start: fn(&PeriodicWatcher),
    pub periodic_stop: fn(&PeriodicWatcher),
    pub signal_start: fn(&SignalWatcher),
    pub signal_stop: fn(&SignalWatcher),
    pub child_start: fn(&ChildWatcher),
    pub child_stop: fn(&ChildWatcher),
    pub stat_start: fn(&StatWatcher),
    pub stat_stop: fn(&StatWatcher),
    pub stat_stat: fn(&StatWatcher),
    pub idle_start: fn(&IdleWatcher),
    pub idle_stop: fn(&IdleWatcher),
    pub prepare_start: fn(&PrepareWatcher),
    pub prepare_stop: fn(&PrepareWatcher),
    pub check_start: fn(&CheckWatcher),
    pub check_stop: fn(&CheckWatcher),
}

/// Number of function slots after the header.
pub const SLOT_COUNT: usize = 32;

impl EvApi {
    /// Addresses of every function slot, in layout order.
    pub fn slot_addrs(&self) -> [usize; SLOT_COUNT] {
        [
            self.sv_fileno as usize,
            self.sv_signum as usize,
            self.now as usize,
            self.time as usize,
            self.backend as usize,
            self.run as usize,
            self.break_loop as usize,
            self.ref_loop as usize,
            self.unref_loop as usize,
            self.once as usize,
            self.clear_pending as usize,
            self.invoke as usize,
            self.io_start as usize,
            self.io_stop as usize,
            self.timer_start as usize,
            self.timer_stop as usize,
            self.timer_again as usize,
            self.periodic_start as usize,
            self.periodic_stop as usize,
            self.signal_start as usize,
            self.signal_stop as usize,
            self.child_start as usize,
            self.child_stop as usize,
            self.stat_start as usize,
            self.stat_stop as usize,
            self.stat_stat as usize,
            self.idle_start as usize,
            self.idle_stop as usize,
            self.prepare_start as usize,
            self.prepare_stop as usize,
            self.check_start as usize,
            self.check_stop as usize,
        ]
    }
}

impl Versioned for EvApi {
    fn api_version(&self) -> ApiVersion {
        ApiVersion::new(self.ver, self.rev)
    }

    fn same_table(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
            || (self.ver == other.ver
                && self.rev == other.rev
                && self.slot_addrs() == other.slot_addrs())
    }
}

impl fmt::Debug for EvApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvApi")
            .field("ver", &self.ver)
            .field("rev", &self.rev)
            .field("slots", &SLOT_COUNT)
            .finish()
    }
}

// Header then one pointer per slot, no padding in between.
const _: () = assert!(
    std::mem::size_of::<EvApi>()
        == 2 * std::mem::size_of::<u32>() + SLOT_COUNT * std::mem::size_of::<usize>()
);

#[cfg(test)]
pub(crate) mod testing {
    //! Inert table for tests that only exercise publish/bind.

    use super::*;

    fn fileno(_: &HostHandle<'_>) -> Option<RawFd> {
        None
    }
    fn signum(_: &SignalSpec<'_>) -> Option<i32> {
        None
    }
    fn zero_time() -> Tstamp {
        0.0
    }
    fn zero_backend() -> u32 {
        0
    }
    fn run(_: RunFlags) {}
    fn brk(_: BreakHow) {}
    fn nothing() {}
    fn once(_: RawFd, _: Revents, _: Tstamp, _: OnceCallback) {}
    fn clear(_: &dyn AnyWatcher) -> Revents {
        Revents::NONE
    }
    fn invoke(_: &dyn AnyWatcher, _: Revents) {}
    fn w<T>(_: &T) {}

    pub(crate) fn inert(ver: u32, rev: u32) -> EvApi {
        EvApi {
            ver,
            rev,
            sv_fileno: fileno,
            sv_signum: signum,
            now: zero_time,
            time: zero_time,
            backend: zero_backend,
            run,
            break_loop: brk,
            ref_loop: nothing,
            unref_loop: nothing,
            once,
            clear_pending: clear,
            invoke,
            io_start: w,
            io_stop: w,
            timer_start: w,
            timer_stop: w,
            timer_again: w,
            periodic_start: w,
            periodic_stop: w,
            signal_start: w,
            signal_stop: w,
            child_start: w,
            child_stop: w,
            stat_start: w,
            stat_stop: w,
            stat_stat: w,
            idle_start: w,
            idle_stop: w,
            prepare_start: w,
            prepare_stop: w,
            check_start: w,
            check_stop: w,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::inert;
    use super::*;

    #[test]
    fn test_api_version_from_header() {
        let t = inert(3, 2);
        assert_eq!(t.api_version(), ApiVersion::new(3, 2));
    }

    #[test]
    fn test_same_table_compares_slots() {
        let a = inert(3, 0);
        let b = inert(3, 0);
        assert!(a.same_table(&b));

        let c = inert(3, 1);
        assert!(!a.same_table(&c));

        fn other_now() -> Tstamp {
            1.0
        }
        let d = EvApi { now: other_now, ..inert(3, 0) };
        assert!(!a.same_table(&d));
    }

    #[test]
    fn test_slot_order_starts_with_conversions() {
        let t = inert(3, 0);
        let addrs = t.slot_addrs();
        assert_eq!(addrs[0], t.sv_fileno as usize);
        assert_eq!(addrs[SLOT_COUNT - 1], t.check_stop as usize);
    }
}
