//! The event loop
//!
//! One `EvLoop` per thread in normal use (see `ops::default_loop`), though
//! standalone loops work too. All state sits behind a `RefCell` that is
//! never borrowed while a callback runs, so callbacks may freely start,
//! stop or re-run watchers on the loop that invoked them.
//!
//! # Iteration
//!
//! ```text
//! prepare ──► timeout ──► backend.wait ──► clocks ──► io / signals / children
//!                                                          │
//!     dispatch ◄── check ◄── idle (if nothing pending) ◄── timers / periodics / stats
//! ```

use std::cell::{Cell, RefCell, RefMut};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use evapi_core::watcher::{Periodic, MAXPRI, MINPRI};
use evapi_core::{
    kdebug, kerror, ktrace, kwarn, AnyWatcher, BreakHow, CheckWatcher, ChildWatcher,
    IdleWatcher, Io, IoWatcher, OnceCallback, PeriodicWatcher, PrepareWatcher, Revents,
    RunFlags, SignalWatcher, StatAttr, StatWatcher, Timer, TimerWatcher, Tstamp, Watcher,
    WatcherHeader, WatcherKind,
};

use crate::backend::{Backend, Interest, PollBackend};
use crate::child;
use crate::clock::{wall_now, MonoClock};
use crate::config::LoopConfig;
use crate::error::LoopError;
use crate::signal;
use crate::timer::TimerQueue;

const NUMPRI: usize = (MAXPRI - MINPRI + 1) as usize;

#[inline]
fn pri_index(priority: i32) -> usize {
    (priority.clamp(MINPRI, MAXPRI) - MINPRI) as usize
}

/// Smallest interval a repeating periodic is scheduled with.
pub const MIN_PERIODIC_INTERVAL: Tstamp = 0.0001220703125;

/// Next firing time of a periodic watcher after `now`.
///
/// Positive intervals below [`MIN_PERIODIC_INTERVAL`] are raised to it.
/// When the interval is lost in the precision of `now` the watcher is
/// due at `now`.
pub fn periodic_next(p: &Periodic, now: Tstamp) -> Option<Tstamp> {
    if let Some(reschedule) = p.reschedule {
        return Some(reschedule(p, now).max(now));
    }
    if p.interval > 0.0 {
        let interval = p.interval.max(MIN_PERIODIC_INTERVAL);
        let mut at = p.offset + interval * ((now - p.offset) / interval).floor();
        while at <= now {
            let next = at + interval;
            if next == at {
                at = now;
                break;
            }
            at = next;
        }
        return Some(at);
    }
    None
}

/// Handle to a loop. Clones share the same loop.
#[derive(Clone)]
pub struct EvLoop {
    inner: Rc<Inner>,
}

struct Inner {
    config: LoopConfig,
    state: RefCell<LoopState>,
}

struct LoopState {
    backend: Box<dyn Backend>,
    mono: MonoClock,
    mn_now: Tstamp,
    rt_now: Tstamp,

    ios: Vec<IoWatcher>,
    timers: TimerQueue<TimerWatcher>,
    periodics: TimerQueue<PeriodicWatcher>,
    stats: TimerQueue<StatWatcher>,
    signals: Vec<SignalWatcher>,
    children: Vec<ChildWatcher>,
    idles: Vec<IdleWatcher>,
    prepares: Vec<PrepareWatcher>,
    checks: Vec<CheckWatcher>,

    /// FIFO per priority, lowest priority first.
    pending: [VecDeque<Box<dyn AnyWatcher>>; NUMPRI],

    refs: i64,
    depth: u32,
    break_how: BreakHow,
    iterations: u64,
    sigchld_watched: bool,
}

impl LoopState {
    fn update_clocks(&mut self) {
        self.mn_now = self.mono.now();
        self.rt_now = wall_now();
    }

    fn activate(&mut self, header: &WatcherHeader) {
        header.set_active(true);
        self.refs += 1;
    }

    fn deactivate(&mut self, header: &WatcherHeader) {
        header.set_active(false);
        self.refs -= 1;
    }

    fn feed<K: WatcherKind>(&mut self, w: &Watcher<K>, revents: Revents) {
        if w.header().add_pending(revents) {
            self.pending[pri_index(w.header().priority())].push_back(w.to_any());
        }
    }

    fn clear_pending(&mut self, w: &dyn AnyWatcher) -> Revents {
        let revents = w.header().take_pending();
        if !revents.is_empty() {
            let id = w.header().id();
            for queue in &mut self.pending {
                queue.retain(|p| p.header().id() != id);
            }
        }
        revents
    }

    fn has_pending(&self) -> bool {
        self.pending.iter().any(|q| !q.is_empty())
    }

    fn pending_count(&self) -> usize {
        self.pending.iter().map(VecDeque::len).sum()
    }

    fn next_pending(&mut self) -> Option<(Box<dyn AnyWatcher>, Revents)> {
        for queue in self.pending.iter_mut().rev() {
            while let Some(w) = queue.pop_front() {
                let revents = w.header().take_pending();
                if !revents.is_empty() {
                    return Some((w, revents));
                }
            }
        }
        None
    }

    fn block_timeout(&mut self, flags: RunFlags, config: &LoopConfig) -> Duration {
        if flags.contains(RunFlags::NOWAIT)
            || self.refs <= 0
            || !self.idles.is_empty()
            || self.has_pending()
        {
            return Duration::ZERO;
        }
        let mut wait = config.max_block.as_secs_f64();
        if let Some(at) = self.timers.next_deadline() {
            wait = wait.min(at - self.mn_now);
        }
        if let Some(at) = self.periodics.next_deadline() {
            wait = wait.min(at - self.rt_now);
        }
        if let Some(at) = self.stats.next_deadline() {
            wait = wait.min(at - self.mn_now);
        }
        if !self.signals.is_empty() || !self.children.is_empty() {
            wait = wait.min(config.signal_poll.as_secs_f64());
        }
        Duration::from_secs_f64(wait.max(0.0))
    }

    fn release_all(&mut self) {
        for w in self.signals.drain(..) {
            w.header().set_active(false);
            signal::unwatch(w.params().signum);
        }
        if self.sigchld_watched {
            signal::unwatch(libc::SIGCHLD);
            self.sigchld_watched = false;
        }
        let headers = self
            .ios
            .iter()
            .map(|w| w.header())
            .chain(self.timers.items().map(|w| w.header()))
            .chain(self.periodics.items().map(|w| w.header()))
            .chain(self.stats.items().map(|w| w.header()))
            .chain(self.children.iter().map(|w| w.header()))
            .chain(self.idles.iter().map(|w| w.header()))
            .chain(self.prepares.iter().map(|w| w.header()))
            .chain(self.checks.iter().map(|w| w.header()));
        for header in headers {
            header.set_active(false);
        }
        for queue in &mut self.pending {
            for w in queue.drain(..) {
                w.header().take_pending();
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.state.get_mut().release_all();
    }
}

struct OnceShared {
    cb: RefCell<Option<OnceCallback>>,
    io: Cell<Option<u64>>,
    timer: Cell<Option<u64>>,
}

fn finish_once(lp: &Weak<Inner>, shared: &OnceShared, revents: Revents) {
    let Some(cb) = shared.cb.borrow_mut().take() else { return };
    if let Some(inner) = lp.upgrade() {
        let lp = EvLoop { inner };
        if let Some(w) = shared.io.get().and_then(|id| lp.find_io(id)) {
            lp.io_stop(&w);
        }
        if let Some(w) = shared.timer.get().and_then(|id| lp.find_timer(id)) {
            lp.timer_stop(&w);
        }
    }
    cb(revents);
}

macro_rules! listed_ops {
    ($start:ident, $stop:ident, $field:ident, $ty:ty) => {
        pub fn $start(&self, w: &$ty) {
            if self.reject_active(w) {
                return;
            }
            let mut st = self.state();
            st.activate(w.header());
            st.$field.push(w.clone());
        }

        pub fn $stop(&self, w: &$ty) {
            let removed = {
                let mut st = self.state();
                st.clear_pending(w);
                if !w.is_active() {
                    return;
                }
                st.deactivate(w.header());
                let pos = st.$field.iter().position(|x| x.ptr_eq(w));
                pos.map(|pos| st.$field.remove(pos))
            };
            drop(removed);
        }
    };
}

impl EvLoop {
    pub fn new(config: LoopConfig) -> Self {
        let config = match config.validate() {
            Ok(()) => config,
            Err(e) => {
                kwarn!("{}; using library defaults", e);
                LoopConfig::new()
            }
        };
        let backend = PollBackend::new(config.poll_capacity);
        kdebug!("event loop created (backend {})", backend.name());
        let mut state = LoopState {
            backend: Box::new(backend),
            mono: MonoClock::new(),
            mn_now: 0.0,
            rt_now: 0.0,
            ios: Vec::new(),
            timers: TimerQueue::new(),
            periodics: TimerQueue::new(),
            stats: TimerQueue::new(),
            signals: Vec::new(),
            children: Vec::new(),
            idles: Vec::new(),
            prepares: Vec::new(),
            checks: Vec::new(),
            pending: std::array::from_fn(|_| VecDeque::new()),
            refs: 0,
            depth: 0,
            break_how: BreakHow::Cancel,
            iterations: 0,
            sigchld_watched: false,
        };
        state.update_clocks();
        Self { inner: Rc::new(Inner { config, state: RefCell::new(state) }) }
    }

    fn state(&self) -> RefMut<'_, LoopState> {
        self.inner.state.borrow_mut()
    }

    fn downgrade(&self) -> Weak<Inner> {
        Rc::downgrade(&self.inner)
    }

    fn reject_active<K: WatcherKind>(&self, w: &Watcher<K>) -> bool {
        if w.is_active() {
            kwarn!("{} watcher {} already active; start ignored", K::NAME, w.id());
            return true;
        }
        false
    }

    pub fn config(&self) -> &LoopConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // time and loop control
    // ------------------------------------------------------------------

    /// Wall-clock time cached at the start of the current iteration.
    pub fn now(&self) -> Tstamp {
        self.state().rt_now
    }

    pub fn time(&self) -> Tstamp {
        wall_now()
    }

    /// Re-read both clocks outside of an iteration.
    pub fn now_update(&self) {
        self.state().update_clocks();
    }

    pub fn backend(&self) -> u32 {
        self.state().backend.id()
    }

    pub fn ref_loop(&self) {
        self.state().refs += 1;
    }

    pub fn unref_loop(&self) {
        self.state().refs -= 1;
    }

    pub fn break_loop(&self, how: BreakHow) {
        self.state().break_how = how;
    }

    /// Active-watcher references plus `ref_loop` minus `unref_loop`.
    pub fn refs(&self) -> i64 {
        self.state().refs
    }

    /// Nesting depth of `run`.
    pub fn depth(&self) -> u32 {
        self.state().depth
    }

    pub fn iterations(&self) -> u64 {
        self.state().iterations
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending_count()
    }

    /// Run iterations until no references remain, a break is requested, or
    /// (with `ONCE`/`NOWAIT`) after a single iteration.
    pub fn run(&self, flags: RunFlags) {
        {
            let mut st = self.state();
            st.depth += 1;
            st.break_how = BreakHow::Cancel;
            st.update_clocks();
        }
        loop {
            self.iterate(flags);
            let st = self.state();
            if flags.is_single_iteration() || st.break_how != BreakHow::Cancel || st.refs <= 0 {
                break;
            }
        }
        let mut st = self.state();
        if st.break_how == BreakHow::One {
            st.break_how = BreakHow::Cancel;
        }
        st.depth -= 1;
    }

    fn dispatch_pending(&self) {
        loop {
            let next = self.state().next_pending();
            let Some((w, revents)) = next else { break };
            ktrace!("invoke {} watcher {} ({:?})", w.kind_name(), w.header().id(), revents);
            w.invoke(revents);
        }
    }

    fn iterate(&self, flags: RunFlags) {
        {
            let mut st = self.state();
            st.iterations += 1;
            for w in st.prepares.clone() {
                st.feed(&w, Revents::PREPARE);
            }
        }
        self.dispatch_pending();
        if self.state().break_how != BreakHow::Cancel {
            return;
        }

        let config = &self.inner.config;
        let mut st = self.state();
        st.update_clocks();
        let timeout = st.block_timeout(flags, config);

        let mut interests: Vec<Interest> = st
            .ios
            .iter()
            .map(|w| {
                let p = w.params();
                Interest { fd: p.fd, events: p.events }
            })
            .collect();
        let io_count = interests.len();
        if !st.signals.is_empty() || !st.children.is_empty() {
            if let Some(fd) = signal::wake_fd() {
                interests.push(Interest { fd, events: Revents::READ });
            }
        }

        let ready = match st.backend.wait(&interests, Some(timeout)) {
            Ok(ready) => ready,
            Err(e) => {
                kerror!("{} backend wait failed: {}", st.backend.name(), e);
                Vec::new()
            }
        };
        st.update_clocks();

        // io
        let mut dead = Vec::new();
        let mut woke = false;
        for r in ready {
            if r.index >= io_count {
                woke = true;
                continue;
            }
            let w = st.ios[r.index].clone();
            if r.revents.contains(Revents::ERROR) {
                kerror!("io watcher {}: fd {} is not open; stopping", w.id(), w.params().fd);
                dead.push(w.clone());
            }
            st.feed(&w, r.revents);
        }
        for w in dead {
            st.ios.retain(|x| !x.ptr_eq(&w));
            st.deactivate(w.header());
        }

        // signals
        if woke {
            signal::drain();
        }
        if !st.signals.is_empty() {
            let mut signums: Vec<i32> = st.signals.iter().map(|w| w.params().signum).collect();
            signums.sort_unstable();
            signums.dedup();
            for signum in signums {
                if signal::take(signum) {
                    for w in st.signals.clone() {
                        if w.params().signum == signum {
                            st.feed(&w, Revents::SIGNAL);
                        }
                    }
                }
            }
        }

        // children
        if !st.children.is_empty() {
            if !st.signals.iter().any(|w| w.params().signum == libc::SIGCHLD) {
                signal::take(libc::SIGCHLD);
            }
            let mut targets: Vec<(i32, bool)> = Vec::new();
            for w in &st.children {
                let p = w.params();
                match targets.iter_mut().find(|(pid, _)| *pid == p.pid) {
                    Some(t) => t.1 |= p.trace,
                    None => targets.push((p.pid, p.trace)),
                }
            }
            // specific pids before "any child"
            targets.sort_by_key(|(pid, _)| *pid == 0);
            let mut reaped = Vec::new();
            for (pid, trace) in targets {
                reaped.extend(child::reap(pid, trace));
            }
            for r in reaped {
                for w in st.children.clone() {
                    let matches = {
                        let p = w.params();
                        (p.pid == r.pid || p.pid == 0) && (p.trace || !r.is_trace_only())
                    };
                    if matches {
                        {
                            let mut p = w.params_mut();
                            p.rpid = r.pid;
                            p.rstatus = r.status;
                        }
                        st.feed(&w, Revents::CHILD);
                    }
                }
            }
        }

        // timers
        let mn_now = st.mn_now;
        for (id, w) in st.timers.pop_expired(mn_now) {
            let repeat = w.params().repeat;
            if repeat > 0.0 {
                let at = (w.params().at + repeat).max(mn_now);
                w.params_mut().at = at;
                st.timers.insert(id, at, w.clone());
            } else {
                st.deactivate(w.header());
            }
            st.feed(&w, Revents::TIMER);
        }

        // periodics; reschedule functions run without the state borrowed
        let rt_now = st.rt_now;
        let due = st.periodics.pop_expired(rt_now);
        drop(st);
        let due: Vec<_> = due
            .into_iter()
            .map(|(id, w)| {
                let next = periodic_next(&w.params(), rt_now);
                (id, w, next)
            })
            .collect();
        let mut st = self.state();
        for (id, w, next) in due {
            if !w.is_active() {
                continue;
            }
            match next {
                Some(at) => {
                    w.params_mut().at = at;
                    st.periodics.insert(id, at, w.clone());
                }
                None => st.deactivate(w.header()),
            }
            st.feed(&w, Revents::PERIODIC);
        }

        // stats
        for (id, w) in st.stats.pop_expired(mn_now) {
            let (path, interval) = {
                let p = w.params();
                (p.path.clone(), config.stat_interval_for(p.interval))
            };
            let fresh = StatAttr::probe(&path);
            let changed = {
                let mut p = w.params_mut();
                p.at = mn_now + interval;
                if fresh.changed_from(&p.attr) {
                    p.prev = std::mem::replace(&mut p.attr, fresh);
                    true
                } else {
                    false
                }
            };
            st.stats.insert(id, mn_now + interval, w.clone());
            if changed {
                st.feed(&w, Revents::STAT);
            }
        }

        // idle only when nothing else happened
        if !st.has_pending() {
            for w in st.idles.clone() {
                st.feed(&w, Revents::IDLE);
            }
        }

        for w in st.checks.clone() {
            st.feed(&w, Revents::CHECK);
        }

        drop(st);
        self.dispatch_pending();
    }

    /// Wait once for `fd` (if `>= 0`) to become ready for `events`, or for
    /// `timeout` seconds (if `>= 0`), whichever comes first. `cb` runs
    /// exactly once with the events that ended the wait.
    pub fn once(&self, fd: RawFd, events: Revents, timeout: Tstamp, cb: OnceCallback) {
        if fd < 0 && timeout < 0.0 {
            kwarn!("once without fd or timeout would never complete; ignored");
            return;
        }
        let shared = Rc::new(OnceShared {
            cb: RefCell::new(Some(cb)),
            io: Cell::new(None),
            timer: Cell::new(None),
        });
        if fd >= 0 {
            let (lp, s) = (self.downgrade(), Rc::clone(&shared));
            let io = IoWatcher::new(Io::new(fd, events), move |_, revents| {
                finish_once(&lp, &s, revents)
            });
            shared.io.set(Some(io.id()));
            self.io_start(&io);
        }
        if timeout >= 0.0 {
            let (lp, s) = (self.downgrade(), Rc::clone(&shared));
            let timer = TimerWatcher::new(Timer::new(timeout, 0.0), move |_, revents| {
                finish_once(&lp, &s, revents)
            });
            shared.timer.set(Some(timer.id()));
            self.timer_start(&timer);
        }
    }

    fn find_io(&self, id: u64) -> Option<IoWatcher> {
        self.state().ios.iter().find(|w| w.id() == id).cloned()
    }

    fn find_timer(&self, id: u64) -> Option<TimerWatcher> {
        self.state().timers.get(id).cloned()
    }

    // ------------------------------------------------------------------
    // pending
    // ------------------------------------------------------------------

    /// Drop queued events of `w`. Returns what was queued.
    pub fn clear_pending(&self, w: &dyn AnyWatcher) -> Revents {
        self.state().clear_pending(w)
    }

    /// Run the callback of `w` right now.
    pub fn invoke(&self, w: &dyn AnyWatcher, revents: Revents) {
        w.invoke(revents);
    }

    /// Queue `revents` for `w` as if the loop had detected them.
    pub fn feed_event<K: WatcherKind>(&self, w: &Watcher<K>, revents: Revents) {
        self.state().feed(w, revents);
    }

    // ------------------------------------------------------------------
    // io
    // ------------------------------------------------------------------

    pub fn io_start(&self, w: &IoWatcher) {
        if self.reject_active(w) {
            return;
        }
        let fd = w.params().fd;
        if fd < 0 {
            kerror!("io watcher {}: {}", w.id(), LoopError::InvalidFd(fd));
            return;
        }
        let mut st = self.state();
        st.activate(w.header());
        st.ios.push(w.clone());
    }

    pub fn io_stop(&self, w: &IoWatcher) {
        let removed = {
            let mut st = self.state();
            st.clear_pending(w);
            if !w.is_active() {
                return;
            }
            st.deactivate(w.header());
            let pos = st.ios.iter().position(|x| x.ptr_eq(w));
            pos.map(|pos| st.ios.swap_remove(pos))
        };
        drop(removed);
    }

    // ------------------------------------------------------------------
    // timer
    // ------------------------------------------------------------------

    fn schedule_timer(st: &mut LoopState, w: &TimerWatcher, at: Tstamp) {
        w.params_mut().at = at;
        st.timers.insert(w.id(), at, w.clone());
        if !w.is_active() {
            st.activate(w.header());
        }
    }

    pub fn timer_start(&self, w: &TimerWatcher) {
        if self.reject_active(w) {
            return;
        }
        let (after, repeat) = {
            let p = w.params();
            (p.after, p.repeat)
        };
        if repeat < 0.0 {
            kerror!("timer watcher {}: negative repeat {}", w.id(), repeat);
            return;
        }
        let mut st = self.state();
        let at = st.mn_now + after;
        Self::schedule_timer(&mut st, w, at);
    }

    pub fn timer_stop(&self, w: &TimerWatcher) {
        let removed = {
            let mut st = self.state();
            st.clear_pending(w);
            if !w.is_active() {
                return;
            }
            st.deactivate(w.header());
            st.timers.cancel(w.id())
        };
        drop(removed);
    }

    /// Restart a repeating timer from now, or stop a non-repeating one.
    pub fn timer_again(&self, w: &TimerWatcher) {
        let repeat = w.params().repeat;
        let mut st = self.state();
        st.clear_pending(w);
        if repeat > 0.0 {
            let at = st.mn_now + repeat;
            Self::schedule_timer(&mut st, w, at);
        } else if w.is_active() {
            st.deactivate(w.header());
            let removed = st.timers.cancel(w.id());
            drop(st);
            drop(removed);
        }
    }

    // ------------------------------------------------------------------
    // periodic
    // ------------------------------------------------------------------

    pub fn periodic_start(&self, w: &PeriodicWatcher) {
        if self.reject_active(w) {
            return;
        }
        let rt_now = self.state().rt_now;
        let at = {
            let p = w.params();
            periodic_next(&p, rt_now).unwrap_or(p.offset)
        };
        if w.is_active() {
            return;
        }
        w.params_mut().at = at;
        let mut st = self.state();
        st.periodics.insert(w.id(), at, w.clone());
        st.activate(w.header());
    }

    pub fn periodic_stop(&self, w: &PeriodicWatcher) {
        let removed = {
            let mut st = self.state();
            st.clear_pending(w);
            if !w.is_active() {
                return;
            }
            st.deactivate(w.header());
            st.periodics.cancel(w.id())
        };
        drop(removed);
    }

    // ------------------------------------------------------------------
    // signal / child
    // ------------------------------------------------------------------

    pub fn signal_start(&self, w: &SignalWatcher) {
        if self.reject_active(w) {
            return;
        }
        let signum = w.params().signum;
        if let Err(e) = signal::watch(signum) {
            kerror!("signal watcher {}: {}", w.id(), e);
            return;
        }
        let mut st = self.state();
        st.activate(w.header());
        st.signals.push(w.clone());
    }

    pub fn signal_stop(&self, w: &SignalWatcher) {
        let removed = {
            let mut st = self.state();
            st.clear_pending(w);
            if !w.is_active() {
                return;
            }
            st.deactivate(w.header());
            let pos = st.signals.iter().position(|x| x.ptr_eq(w));
            pos.map(|pos| st.signals.remove(pos))
        };
        if removed.is_some() {
            signal::unwatch(w.params().signum);
        }
    }

    pub fn child_start(&self, w: &ChildWatcher) {
        if self.reject_active(w) {
            return;
        }
        let mut st = self.state();
        if !st.sigchld_watched {
            match signal::watch(libc::SIGCHLD) {
                Ok(()) => st.sigchld_watched = true,
                Err(e) => kwarn!("SIGCHLD unavailable ({}); children found by polling", e),
            }
        }
        st.activate(w.header());
        st.children.push(w.clone());
    }

    pub fn child_stop(&self, w: &ChildWatcher) {
        let removed = {
            let mut st = self.state();
            st.clear_pending(w);
            if !w.is_active() {
                return;
            }
            st.deactivate(w.header());
            let pos = st.children.iter().position(|x| x.ptr_eq(w));
            let removed = pos.map(|pos| st.children.remove(pos));
            if st.children.is_empty() && st.sigchld_watched {
                st.sigchld_watched = false;
                signal::unwatch(libc::SIGCHLD);
            }
            removed
        };
        drop(removed);
    }

    // ------------------------------------------------------------------
    // stat
    // ------------------------------------------------------------------

    pub fn stat_start(&self, w: &StatWatcher) {
        if self.reject_active(w) {
            return;
        }
        let (path, interval) = {
            let p = w.params();
            (p.path.clone(), self.inner.config.stat_interval_for(p.interval))
        };
        let attr = StatAttr::probe(&path);
        let mut st = self.state();
        let at = st.mn_now + interval;
        {
            let mut p = w.params_mut();
            p.prev = attr;
            p.attr = attr;
            p.at = at;
        }
        st.stats.insert(w.id(), at, w.clone());
        st.activate(w.header());
    }

    pub fn stat_stop(&self, w: &StatWatcher) {
        let removed = {
            let mut st = self.state();
            st.clear_pending(w);
            if !w.is_active() {
                return;
            }
            st.deactivate(w.header());
            st.stats.cancel(w.id())
        };
        drop(removed);
    }

    /// Refresh `attr` now, keeping the old value in `prev`. Raises no event.
    pub fn stat_stat(&self, w: &StatWatcher) {
        let path = w.params().path.clone();
        let fresh = StatAttr::probe(&path);
        let mut p = w.params_mut();
        p.prev = std::mem::replace(&mut p.attr, fresh);
    }

    // ------------------------------------------------------------------
    // idle / prepare / check
    // ------------------------------------------------------------------

    listed_ops!(idle_start, idle_stop, idles, IdleWatcher);
    listed_ops!(prepare_start, prepare_stop, prepares, PrepareWatcher);
    listed_ops!(check_start, check_stop, checks, CheckWatcher);
}

impl Default for EvLoop {
    fn default() -> Self {
        Self::new(LoopConfig::from_env())
    }
}

impl std::fmt::Debug for EvLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.state.try_borrow() {
            Ok(st) => f
                .debug_struct("EvLoop")
                .field("refs", &st.refs)
                .field("depth", &st.depth)
                .field("iterations", &st.iterations)
                .field("ios", &st.ios.len())
                .field("timers", &st.timers.len())
                .field("pending", &st.pending_count())
                .finish(),
            Err(_) => f.write_str("EvLoop { <busy> }"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evapi_core::watcher::{Check, Child, Idle, Prepare, Signal, Stat};
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn test_loop() -> EvLoop {
        EvLoop::new(LoopConfig::new().signal_poll(Duration::from_millis(10)))
    }

    /// Breaks all runs after `secs` so a broken test cannot hang.
    fn guard(lp: &EvLoop, secs: f64) -> TimerWatcher {
        let l = lp.clone();
        let w = TimerWatcher::new(Timer::new(secs, 0.0), move |_, _| l.break_loop(BreakHow::All));
        lp.timer_start(&w);
        lp.unref_loop();
        w
    }

    fn counter() -> Rc<Cell<u32>> {
        Rc::new(Cell::new(0))
    }

    #[test]
    fn test_periodic_next() {
        let p = Periodic::new(0.0, 10.0);
        assert_eq!(periodic_next(&p, 95.0), Some(100.0));
        assert_eq!(periodic_next(&p, 100.0), Some(110.0));
        let p = Periodic::new(3.0, 10.0);
        assert_eq!(periodic_next(&p, 95.0), Some(103.0));
        assert_eq!(periodic_next(&Periodic::new(50.0, 0.0), 95.0), None);

        fn next_even(_: &Periodic, now: Tstamp) -> Tstamp {
            (now / 2.0).floor() * 2.0 + 2.0
        }
        let p = Periodic::with_reschedule(next_even);
        assert_eq!(periodic_next(&p, 7.0), Some(8.0));
    }

    #[test]
    fn test_periodic_next_tiny_interval_terminates() {
        let now = 1.7e9;
        let at = periodic_next(&Periodic::new(0.0, 1e-10), now).unwrap();
        assert!(at > now);
        assert!(at - now <= 2.0 * MIN_PERIODIC_INTERVAL);

        // interval below the precision of `now`
        let now = 1e13;
        let at = periodic_next(&Periodic::new(0.0, MIN_PERIODIC_INTERVAL), now).unwrap();
        assert!(at >= now && at - now < 0.01);
    }

    #[test]
    fn test_timer_fires_once_and_run_returns() {
        let lp = test_loop();
        let hits = counter();
        let h = Rc::clone(&hits);
        let w = TimerWatcher::new(Timer::new(0.01, 0.0), move |_, ev| {
            assert_eq!(ev, Revents::TIMER);
            h.set(h.get() + 1);
        });
        lp.timer_start(&w);
        assert!(w.is_active());
        assert_eq!(lp.refs(), 1);

        lp.run(RunFlags::DEFAULT);
        assert_eq!(hits.get(), 1);
        assert!(!w.is_active());
        assert_eq!(lp.refs(), 0);
        assert_eq!(lp.depth(), 0);
    }

    #[test]
    fn test_start_stop_and_double_stop() {
        let lp = test_loop();
        let hits = counter();
        let h = Rc::clone(&hits);
        let w = TimerWatcher::new(Timer::new(0.0, 0.0), move |_, _| h.set(h.get() + 1));

        lp.timer_start(&w);
        lp.timer_start(&w);
        assert_eq!(lp.refs(), 1);

        lp.timer_stop(&w);
        assert!(!w.is_active());
        lp.timer_stop(&w);
        assert_eq!(lp.refs(), 0);

        lp.run(RunFlags::NOWAIT);
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_stop_clears_pending() {
        let lp = test_loop();
        let hits = counter();
        let h = Rc::clone(&hits);
        let w = IdleWatcher::new(Idle, move |_, _| h.set(h.get() + 1));
        lp.feed_event(&w, Revents::IDLE);
        assert!(w.is_pending());
        lp.idle_stop(&w);
        assert!(!w.is_pending());
        assert_eq!(lp.pending_count(), 0);
        lp.run(RunFlags::NOWAIT);
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_repeat_timer_stops_itself() {
        let lp = test_loop();
        let hits = counter();
        let (h, l) = (Rc::clone(&hits), lp.clone());
        let w = TimerWatcher::new(Timer::new(0.0, 0.005), move |w, _| {
            h.set(h.get() + 1);
            if h.get() == 3 {
                l.timer_stop(w);
            }
        });
        lp.timer_start(&w);
        let _g = guard(&lp, 2.0);
        lp.run(RunFlags::DEFAULT);
        assert_eq!(hits.get(), 3);
        assert!(!w.is_active());
    }

    #[test]
    fn test_timer_again_rules() {
        let lp = test_loop();

        // inactive, repeat 0: no-op
        let w = TimerWatcher::new(Timer::new(5.0, 0.0), |_, _| {});
        lp.timer_again(&w);
        assert!(!w.is_active());

        // inactive, repeat > 0: starts at now + repeat
        let w = TimerWatcher::new(Timer::new(5.0, 2.0), |_, _| {});
        lp.timer_again(&w);
        assert!(w.is_active());
        let at = w.params().at;
        let mn_now = lp.state().mn_now;
        assert!((at - mn_now - 2.0).abs() < 0.5);

        // active, repeat > 0: restarted, still one reference
        lp.timer_again(&w);
        assert!(w.is_active());
        assert_eq!(lp.refs(), 1);

        // active, repeat 0: stopped
        lp.timer_stop(&w);
        w.set(|t| t.repeat = 0.0);
        lp.timer_start(&w);
        lp.timer_again(&w);
        assert!(!w.is_active());
        assert_eq!(lp.refs(), 0);
    }

    #[test]
    fn test_io_readable() {
        let lp = test_loop();
        let (a, mut b) = UnixStream::pair().unwrap();
        let got = Rc::new(Cell::new(Revents::NONE));
        let (g, l) = (Rc::clone(&got), lp.clone());
        let w = IoWatcher::new(Io::new(a.as_raw_fd(), Revents::READ), move |w, ev| {
            g.set(ev);
            l.io_stop(w);
        });
        lp.io_start(&w);
        b.write_all(b"ping").unwrap();
        let _g = guard(&lp, 2.0);
        lp.run(RunFlags::DEFAULT);
        assert_eq!(got.get(), Revents::READ);
        assert!(!w.is_active());
    }

    #[test]
    fn test_io_rejects_negative_fd() {
        let lp = test_loop();
        let w = IoWatcher::new(Io::new(-1, Revents::READ), |_, _| {});
        lp.io_start(&w);
        assert!(!w.is_active());
        assert_eq!(lp.refs(), 0);
    }

    #[test]
    fn test_once_timeout() {
        let lp = test_loop();
        let got = Rc::new(Cell::new(Revents::NONE));
        let calls = counter();
        let (g, c) = (Rc::clone(&got), Rc::clone(&calls));
        lp.once(-1, Revents::NONE, 0.05, Box::new(move |ev| {
            g.set(ev);
            c.set(c.get() + 1);
        }));
        lp.run(RunFlags::DEFAULT);
        assert_eq!(got.get(), Revents::TIMER);
        assert_eq!(calls.get(), 1);
        assert_eq!(lp.refs(), 0);
    }

    #[test]
    fn test_once_io_wins_and_timer_is_stopped() {
        let lp = test_loop();
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"x").unwrap();
        let got = Rc::new(Cell::new(Revents::NONE));
        let g = Rc::clone(&got);
        lp.once(a.as_raw_fd(), Revents::READ, 10.0, Box::new(move |ev| g.set(ev)));
        assert_eq!(lp.refs(), 2);
        lp.run(RunFlags::DEFAULT);
        assert_eq!(got.get(), Revents::READ);
        assert_eq!(lp.refs(), 0);
    }

    #[test]
    fn test_once_silent_fd_times_out() {
        let lp = test_loop();
        let _g = guard(&lp, 5.0);
        let (a, _b) = UnixStream::pair().unwrap();
        let got = Rc::new(Cell::new(Revents::NONE));
        let calls = counter();
        let (g, c) = (Rc::clone(&got), Rc::clone(&calls));
        lp.once(a.as_raw_fd(), Revents::READ, 0.05, Box::new(move |ev| {
            g.set(ev);
            c.set(c.get() + 1);
        }));
        assert_eq!(lp.state().ios.len(), 1);
        lp.run(RunFlags::DEFAULT);
        assert_eq!(got.get(), Revents::TIMER);
        assert_eq!(calls.get(), 1);
        assert_eq!(lp.refs(), 0);
        assert!(lp.state().ios.is_empty());
    }

    #[test]
    fn test_once_negative_timeout_waits_for_fd() {
        let lp = test_loop();
        let _g = guard(&lp, 5.0);
        let (a, b) = UnixStream::pair().unwrap();
        let writer = TimerWatcher::new(Timer::new(0.05, 0.0), move |_, _| {
            (&b).write_all(b"x").unwrap();
        });
        lp.timer_start(&writer);
        let got = Rc::new(Cell::new(Revents::NONE));
        let g = Rc::clone(&got);
        lp.once(a.as_raw_fd(), Revents::READ, -1.0, Box::new(move |ev| g.set(ev)));
        assert_eq!(lp.state().timers.len(), 2);
        lp.run(RunFlags::DEFAULT);
        assert_eq!(got.get(), Revents::READ);
        assert_eq!(lp.refs(), 0);
        assert!(lp.state().ios.is_empty());
    }

    #[test]
    fn test_priority_order() {
        let lp = test_loop();
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut watchers = Vec::new();
        for pri in [-1, 2, 0] {
            let (o, l) = (Rc::clone(&order), lp.clone());
            let w = IdleWatcher::new(Idle, move |w, _| {
                o.borrow_mut().push(pri);
                l.idle_stop(w);
            });
            assert!(w.set_priority(pri));
            lp.idle_start(&w);
            watchers.push(w);
        }
        lp.run(RunFlags::DEFAULT);
        assert_eq!(*order.borrow(), vec![2, 0, -1]);
    }

    #[test]
    fn test_prepare_then_check() {
        let lp = test_loop();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o = Rc::clone(&order);
        let p = PrepareWatcher::new(Prepare, move |_, ev| o.borrow_mut().push(ev));
        let o = Rc::clone(&order);
        let c = CheckWatcher::new(Check, move |_, ev| o.borrow_mut().push(ev));
        lp.prepare_start(&p);
        lp.check_start(&c);
        lp.run(RunFlags::NOWAIT);
        assert_eq!(*order.borrow(), vec![Revents::PREPARE, Revents::CHECK]);
        lp.prepare_stop(&p);
        lp.check_stop(&c);
        assert_eq!(lp.refs(), 0);
    }

    #[test]
    fn test_break_one_leaves_inner_only() {
        let lp = test_loop();
        let outer_after_inner = counter();
        let (l, flag) = (lp.clone(), Rc::clone(&outer_after_inner));
        let inner_break = {
            let l = lp.clone();
            TimerWatcher::new(Timer::new(0.0, 0.0), move |_, _| l.break_loop(BreakHow::One))
        };
        let ib = inner_break.clone();
        let starter = TimerWatcher::new(Timer::new(0.0, 0.0), move |_, _| {
            // keep the loop referenced while nested
            l.ref_loop();
            l.timer_start(&ib);
            l.run(RunFlags::DEFAULT);
            assert_eq!(l.depth(), 1);
            flag.set(1);
            l.unref_loop();
        });
        lp.timer_start(&starter);
        let _g = guard(&lp, 2.0);
        lp.run(RunFlags::DEFAULT);
        assert_eq!(outer_after_inner.get(), 1);
        assert_eq!(lp.depth(), 0);
    }

    #[test]
    fn test_break_all_leaves_every_run() {
        let lp = test_loop();
        let l = lp.clone();
        let keepalive = TimerWatcher::new(Timer::new(30.0, 0.0), |_, _| {});
        lp.timer_start(&keepalive);
        let nested = TimerWatcher::new(Timer::new(0.0, 0.0), move |_, _| {
            let l2 = l.clone();
            let stopper =
                TimerWatcher::new(Timer::new(0.0, 0.0), move |_, _| l2.break_loop(BreakHow::All));
            l.timer_start(&stopper);
            l.run(RunFlags::DEFAULT);
        });
        lp.timer_start(&nested);
        lp.run(RunFlags::DEFAULT);
        assert_eq!(lp.depth(), 0);
        assert!(keepalive.is_active());
        lp.timer_stop(&keepalive);
    }

    #[test]
    fn test_unref_lets_run_return() {
        let lp = test_loop();
        let w = TimerWatcher::new(Timer::new(30.0, 0.0), |_, _| {});
        lp.timer_start(&w);
        lp.unref_loop();
        lp.run(RunFlags::DEFAULT);
        assert!(w.is_active());
        lp.ref_loop();
        lp.timer_stop(&w);
        assert_eq!(lp.refs(), 0);
    }

    #[test]
    fn test_clear_pending_and_invoke() {
        let lp = test_loop();
        let seen = Rc::new(Cell::new(Revents::NONE));
        let s = Rc::clone(&seen);
        let w = TimerWatcher::new(Timer::new(1.0, 0.0), move |_, ev| s.set(ev));

        assert_eq!(lp.clear_pending(&w), Revents::NONE);
        lp.feed_event(&w, Revents::TIMER);
        lp.feed_event(&w, Revents::CUSTOM);
        assert_eq!(lp.pending_count(), 1);
        assert_eq!(lp.clear_pending(&w), Revents::TIMER | Revents::CUSTOM);
        assert_eq!(lp.pending_count(), 0);

        lp.invoke(&w, Revents::CUSTOM);
        assert_eq!(seen.get(), Revents::CUSTOM);
    }

    #[test]
    fn test_signal_watcher() {
        let lp = test_loop();
        let hits = counter();
        let (h, l) = (Rc::clone(&hits), lp.clone());
        let w = SignalWatcher::new(Signal::new(libc::SIGUSR1), move |w, ev| {
            assert_eq!(ev, Revents::SIGNAL);
            h.set(h.get() + 1);
            l.signal_stop(w);
        });
        lp.signal_start(&w);
        assert!(w.is_active());
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGUSR1).unwrap();
        let _g = guard(&lp, 2.0);
        lp.run(RunFlags::DEFAULT);
        assert_eq!(hits.get(), 1);
        assert_eq!(signal::watch_count(libc::SIGUSR1), 0);
    }

    #[test]
    fn test_signal_watcher_rejects_sigkill() {
        let lp = test_loop();
        let w = SignalWatcher::new(Signal::new(libc::SIGKILL), |_, _| {});
        lp.signal_start(&w);
        assert!(!w.is_active());
    }

    #[test]
    fn test_child_watcher() {
        let lp = test_loop();
        let child = std::process::Command::new("sh").args(["-c", "exit 7"]).spawn().unwrap();
        let pid = child.id() as i32;
        let code = Rc::new(Cell::new(None));
        let (c, l) = (Rc::clone(&code), lp.clone());
        let w = ChildWatcher::new(Child::new(pid, false), move |w, ev| {
            assert_eq!(ev, Revents::CHILD);
            assert_eq!(w.params().rpid, pid);
            c.set(w.params().exit_code());
            l.child_stop(w);
        });
        lp.child_start(&w);
        let _g = guard(&lp, 5.0);
        lp.run(RunFlags::DEFAULT);
        assert_eq!(code.get(), Some(7));
        assert!(!w.is_active());
    }

    #[test]
    fn test_periodic_fires() {
        let lp = test_loop();
        let hits = counter();
        let (h, l) = (Rc::clone(&hits), lp.clone());
        let w = PeriodicWatcher::new(Periodic::new(0.0, 0.02), move |w, ev| {
            assert_eq!(ev, Revents::PERIODIC);
            h.set(h.get() + 1);
            if h.get() == 2 {
                l.periodic_stop(w);
            }
        });
        lp.periodic_start(&w);
        let _g = guard(&lp, 2.0);
        lp.run(RunFlags::DEFAULT);
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn test_absolute_periodic_in_past_fires_once() {
        let lp = test_loop();
        let hits = counter();
        let h = Rc::clone(&hits);
        let w = PeriodicWatcher::new(Periodic::new(1.0, 0.0), move |_, _| h.set(h.get() + 1));
        lp.periodic_start(&w);
        lp.run(RunFlags::DEFAULT);
        assert_eq!(hits.get(), 1);
        assert!(!w.is_active());
    }

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("evloop-{}-{}", tag, std::process::id()))
    }

    #[test]
    fn test_stat_detects_creation() {
        let lp = test_loop();
        let path = temp_path("stat");
        let _ = std::fs::remove_file(&path);

        let seen = Rc::new(Cell::new(false));
        let (s, l) = (Rc::clone(&seen), lp.clone());
        let w = StatWatcher::new(Stat::new(&path, 0.1), move |w, ev| {
            assert_eq!(ev, Revents::STAT);
            let p = w.params();
            assert!(p.attr.exists);
            assert!(!p.prev.exists);
            s.set(true);
            drop(p);
            l.stat_stop(w);
        });
        lp.stat_start(&w);
        assert!(!w.params().attr.exists);

        let p2 = path.clone();
        let writer = TimerWatcher::new(Timer::new(0.02, 0.0), move |_, _| {
            std::fs::write(&p2, b"hello").unwrap();
        });
        lp.timer_start(&writer);
        let _g = guard(&lp, 3.0);
        lp.run(RunFlags::DEFAULT);
        assert!(seen.get());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_stat_stat_moves_attr_to_prev() {
        let lp = test_loop();
        let path = temp_path("statstat");
        std::fs::write(&path, b"a").unwrap();
        let w = StatWatcher::new(Stat::new(&path, 0.0), |_, _| {});
        lp.stat_stat(&w);
        assert!(w.params().attr.exists);
        assert_eq!(w.params().attr.size, 1);
        std::fs::write(&path, b"abc").unwrap();
        lp.stat_stat(&w);
        assert_eq!(w.params().attr.size, 3);
        assert_eq!(w.params().prev.size, 1);
        assert!(!w.is_active());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_idle_only_when_nothing_else_pending() {
        let lp = test_loop();
        let idles = counter();
        let i = Rc::clone(&idles);
        let idle = IdleWatcher::new(Idle, move |_, _| i.set(i.get() + 1));
        let timer = TimerWatcher::new(Timer::new(0.0, 0.0), |_, _| {});
        lp.idle_start(&idle);
        lp.timer_start(&timer);
        lp.run(RunFlags::NOWAIT);
        assert_eq!(idles.get(), 0);
        lp.run(RunFlags::NOWAIT);
        assert_eq!(idles.get(), 1);
        lp.idle_stop(&idle);
    }

    #[test]
    fn test_drop_deactivates_watchers() {
        let w = TimerWatcher::new(Timer::new(30.0, 0.0), |_, _| {});
        {
            let lp = test_loop();
            lp.timer_start(&w);
            assert!(w.is_active());
        }
        assert!(!w.is_active());
    }
}
