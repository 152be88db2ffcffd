//! Watcher handles and event masks.
//!
//! A watcher is registered interest in one kind of event plus the callback
//! to run when it happens. The consumer creates and owns the handle; the
//! provider keeps a clone only while the watcher is active.
//!
//! ```text
//! Watcher<K> ──Rc──► WatcherCore<K>
//!                     ├─ header    (id, flags, active, pending, priority, data)
//!                     ├─ params    (K: fd/events, after/repeat, signum, ...)
//!                     └─ callback  (FnMut(&Watcher<K>, Revents))
//! ```
//!
//! Handles are `Rc`-based and therefore `!Send`: a watcher lives on the
//! thread that drives its loop.

use std::any::Any;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Timestamps and intervals, in seconds.
pub type Tstamp = f64;

/// Lowest watcher priority.
pub const MINPRI: i32 = -2;
/// Highest watcher priority.
pub const MAXPRI: i32 = 2;

// ============================================================================
// Event masks
// ============================================================================

/// Event mask passed to callbacks and used to describe io interest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Revents(u32);

impl Revents {
    pub const NONE: Revents = Revents(0);
    pub const READ: Revents = Revents(0x0000_0001);
    pub const WRITE: Revents = Revents(0x0000_0002);
    pub const TIMER: Revents = Revents(0x0000_0100);
    pub const PERIODIC: Revents = Revents(0x0000_0200);
    pub const SIGNAL: Revents = Revents(0x0000_0400);
    pub const CHILD: Revents = Revents(0x0000_0800);
    pub const STAT: Revents = Revents(0x0000_1000);
    pub const IDLE: Revents = Revents(0x0000_2000);
    pub const PREPARE: Revents = Revents(0x0000_4000);
    pub const CHECK: Revents = Revents(0x0000_8000);
    pub const CUSTOM: Revents = Revents(0x0100_0000);
    pub const ERROR: Revents = Revents(0x8000_0000);

    const NAMES: [(Revents, &'static str); 12] = [
        (Revents::READ, "READ"),
        (Revents::WRITE, "WRITE"),
        (Revents::TIMER, "TIMER"),
        (Revents::PERIODIC, "PERIODIC"),
        (Revents::SIGNAL, "SIGNAL"),
        (Revents::CHILD, "CHILD"),
        (Revents::STAT, "STAT"),
        (Revents::IDLE, "IDLE"),
        (Revents::PREPARE, "PREPARE"),
        (Revents::CHECK, "CHECK"),
        (Revents::CUSTOM, "CUSTOM"),
        (Revents::ERROR, "ERROR"),
    ];

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Revents(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// All bits of `other` are set in `self`.
    #[inline]
    pub const fn contains(self, other: Revents) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any bit of `other` is set in `self`.
    #[inline]
    pub const fn intersects(self, other: Revents) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Revents {
    type Output = Revents;
    fn bitor(self, rhs: Revents) -> Revents {
        Revents(self.0 | rhs.0)
    }
}

impl BitOrAssign for Revents {
    fn bitor_assign(&mut self, rhs: Revents) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Revents {
    type Output = Revents;
    fn bitand(self, rhs: Revents) -> Revents {
        Revents(self.0 & rhs.0)
    }
}

impl BitAndAssign for Revents {
    fn bitand_assign(&mut self, rhs: Revents) {
        self.0 &= rhs.0;
    }
}

impl Not for Revents {
    type Output = Revents;
    fn not(self) -> Revents {
        Revents(!self.0)
    }
}

impl fmt::Debug for Revents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "Revents(NONE)");
        }
        write!(f, "Revents(")?;
        let mut rest = self.0;
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                rest &= !flag.0;
                first = false;
            }
        }
        if rest != 0 {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{:#x}", rest)?;
        }
        write!(f, ")")
    }
}

/// Flags for the loop-run operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunFlags(u32);

impl RunFlags {
    /// Run until broken or until no referenced watchers remain.
    pub const DEFAULT: RunFlags = RunFlags(0);
    /// One iteration, never block.
    pub const NOWAIT: RunFlags = RunFlags(1);
    /// One iteration, block for at least one event.
    pub const ONCE: RunFlags = RunFlags(2);

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: RunFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Stop after one iteration regardless of activity.
    #[inline]
    pub const fn is_single_iteration(self) -> bool {
        self.0 & (Self::NOWAIT.0 | Self::ONCE.0) != 0
    }
}

/// How far a loop break reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum BreakHow {
    /// Undo a pending break.
    #[default]
    Cancel = 0,
    /// Leave the innermost `run`.
    One = 1,
    /// Leave every nested `run`.
    All = 2,
}

// ============================================================================
// Common header
// ============================================================================

/// Fields every watcher carries regardless of kind.
pub struct WatcherHeader {
    id: u64,
    flags: Cell<u32>,
    active: Cell<bool>,
    pending: Cell<Revents>,
    priority: Cell<i32>,
    data: RefCell<Option<Box<dyn Any>>>,
}

impl WatcherHeader {
    fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            flags: Cell::new(0),
            active: Cell::new(false),
            pending: Cell::new(Revents::NONE),
            priority: Cell::new(0),
            data: RefCell::new(None),
        }
    }

    /// Process-unique watcher identifier.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags.get()
    }

    #[inline]
    pub fn set_flags(&self, flags: u32) {
        self.flags.set(flags);
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Provider side: mark the watcher registered or deregistered.
    #[inline]
    pub fn set_active(&self, active: bool) {
        self.active.set(active);
    }

    /// Events queued for this watcher but not yet delivered.
    #[inline]
    pub fn pending(&self) -> Revents {
        self.pending.get()
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        !self.pending.get().is_empty()
    }

    /// Provider side: merge `revents` into the pending set.
    /// Returns `true` if the watcher was not pending before.
    #[inline]
    pub fn add_pending(&self, revents: Revents) -> bool {
        let old = self.pending.get();
        self.pending.set(old | revents);
        old.is_empty()
    }

    /// Clear the pending set and return what it held.
    #[inline]
    pub fn take_pending(&self) -> Revents {
        self.pending.replace(Revents::NONE)
    }

    #[inline]
    pub fn priority(&self) -> i32 {
        self.priority.get()
    }

    fn set_priority(&self, priority: i32) {
        self.priority.set(priority.clamp(MINPRI, MAXPRI));
    }
}

impl fmt::Debug for WatcherHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherHeader")
            .field("id", &self.id)
            .field("flags", &self.flags.get())
            .field("active", &self.active.get())
            .field("pending", &self.pending.get())
            .field("priority", &self.priority.get())
            .finish()
    }
}

// ============================================================================
// Watcher handle
// ============================================================================

/// Per-kind parameters and results.
pub trait WatcherKind: fmt::Debug + 'static {
    /// Short name for diagnostics ("io", "timer", ...).
    const NAME: &'static str;
    /// The event bit this kind reports.
    const EVENT: Revents;
}

/// Callback run when a watcher has events.
pub type Callback<K> = Box<dyn FnMut(&Watcher<K>, Revents)>;

struct WatcherCore<K: WatcherKind> {
    header: WatcherHeader,
    params: RefCell<K>,
    callback: RefCell<Option<Callback<K>>>,
}

/// Consumer-owned watcher handle. Cloning shares the same watcher.
pub struct Watcher<K: WatcherKind> {
    core: Rc<WatcherCore<K>>,
}

impl<K: WatcherKind> Clone for Watcher<K> {
    fn clone(&self) -> Self {
        Self { core: Rc::clone(&self.core) }
    }
}

impl<K: WatcherKind> Watcher<K> {
    /// Create an inactive watcher.
    pub fn new<F>(params: K, callback: F) -> Self
    where
        F: FnMut(&Watcher<K>, Revents) + 'static,
    {
        Self {
            core: Rc::new(WatcherCore {
                header: WatcherHeader::new(),
                params: RefCell::new(params),
                callback: RefCell::new(Some(Box::new(callback))),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.core.header.id()
    }

    #[inline]
    pub fn header(&self) -> &WatcherHeader {
        &self.core.header
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.core.header.is_active()
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.core.header.is_pending()
    }

    /// Read the kind parameters (and provider results such as `rstatus`).
    pub fn params(&self) -> Ref<'_, K> {
        self.core.params.borrow()
    }

    /// Change parameters. Refused (returns `false`) while active.
    pub fn set<F: FnOnce(&mut K)>(&self, f: F) -> bool {
        if self.is_active() {
            return false;
        }
        f(&mut self.core.params.borrow_mut());
        true
    }

    /// Provider side: mutable access regardless of state, for writing
    /// results (deadlines, `rpid`, `attr`, ...).
    pub fn params_mut(&self) -> RefMut<'_, K> {
        self.core.params.borrow_mut()
    }

    /// Change priority. Refused (returns `false`) while active.
    pub fn set_priority(&self, priority: i32) -> bool {
        if self.is_active() {
            return false;
        }
        self.core.header.set_priority(priority);
        true
    }

    /// Replace the callback.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: FnMut(&Watcher<K>, Revents) + 'static,
    {
        *self.core.callback.borrow_mut() = Some(Box::new(callback));
    }

    /// Attach consumer-private data.
    pub fn set_data<T: Any>(&self, data: T) {
        *self.core.header.data.borrow_mut() = Some(Box::new(data));
    }

    /// Run `f` on the attached data if it has type `T`.
    pub fn with_data<T: Any, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let data = self.core.header.data.borrow();
        data.as_ref().and_then(|d| d.downcast_ref::<T>()).map(f)
    }

    /// Run the callback now.
    ///
    /// The callback is taken out of its slot for the duration of the call,
    /// so it may stop, restart or reconfigure its own watcher.
    pub fn call(&self, revents: Revents) {
        let taken = self.core.callback.borrow_mut().take();
        if let Some(mut cb) = taken {
            cb(self, revents);
            let mut slot = self.core.callback.borrow_mut();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }

    /// Type-erased clone for pending queues.
    pub fn to_any(&self) -> Box<dyn AnyWatcher> {
        Box::new(self.clone())
    }

    /// Same underlying watcher?
    #[inline]
    pub fn ptr_eq(&self, other: &Watcher<K>) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }
}

impl<K: WatcherKind> fmt::Debug for Watcher<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("kind", &K::NAME)
            .field("header", &self.core.header)
            .field("params", &*self.core.params.borrow())
            .finish()
    }
}

/// Kind-erased view used by `clear_pending`, `invoke` and pending queues.
pub trait AnyWatcher {
    fn header(&self) -> &WatcherHeader;
    fn kind_name(&self) -> &'static str;
    fn invoke(&self, revents: Revents);
}

impl<K: WatcherKind> AnyWatcher for Watcher<K> {
    fn header(&self) -> &WatcherHeader {
        &self.core.header
    }

    fn kind_name(&self) -> &'static str {
        K::NAME
    }

    fn invoke(&self, revents: Revents) {
        self.call(revents)
    }
}

// ============================================================================
// Kinds
// ============================================================================

/// File descriptor readiness.
#[derive(Debug, Clone, PartialEq)]
pub struct Io {
    pub fd: RawFd,
    /// `READ`, `WRITE` or both.
    pub events: Revents,
}

impl Io {
    pub fn new(fd: RawFd, events: Revents) -> Self {
        Self { fd, events: events & (Revents::READ | Revents::WRITE) }
    }
}

impl WatcherKind for Io {
    const NAME: &'static str = "io";
    const EVENT: Revents = Revents::READ;
}

/// Relative timer on the monotonic clock.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Timer {
    pub after: Tstamp,
    /// Re-arm interval after firing; `0.0` for one-shot.
    pub repeat: Tstamp,
    /// Provider-maintained absolute deadline while active.
    pub at: Tstamp,
}

impl Timer {
    pub fn new(after: Tstamp, repeat: Tstamp) -> Self {
        Self { after, repeat: repeat.max(0.0), at: 0.0 }
    }
}

impl WatcherKind for Timer {
    const NAME: &'static str = "timer";
    const EVENT: Revents = Revents::TIMER;
}

/// Computes the next wall-clock firing time of a periodic watcher.
/// Must return a time after `now`. It runs outside the loop's state, so
/// reading `now()` is fine; starting or stopping watchers from it is not.
pub type RescheduleFn = fn(&Periodic, Tstamp) -> Tstamp;

/// Wall-clock based timer.
#[derive(Debug, Clone, Default)]
pub struct Periodic {
    pub offset: Tstamp,
    /// `0.0` fires once at `offset`. Small positive values are raised to
    /// the loop's minimum periodic interval.
    pub interval: Tstamp,
    pub reschedule: Option<RescheduleFn>,
    /// Provider-maintained next firing time.
    pub at: Tstamp,
}

impl Periodic {
    pub fn new(offset: Tstamp, interval: Tstamp) -> Self {
        Self { offset, interval: interval.max(0.0), reschedule: None, at: 0.0 }
    }

    pub fn with_reschedule(reschedule: RescheduleFn) -> Self {
        Self { reschedule: Some(reschedule), ..Self::default() }
    }
}

impl WatcherKind for Periodic {
    const NAME: &'static str = "periodic";
    const EVENT: Revents = Revents::PERIODIC;
}

/// Signal delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub signum: i32,
}

impl Signal {
    pub fn new(signum: i32) -> Self {
        Self { signum }
    }
}

impl WatcherKind for Signal {
    const NAME: &'static str = "signal";
    const EVENT: Revents = Revents::SIGNAL;
}

/// Child process status changes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Child {
    /// Pid to watch; `0` watches any child.
    pub pid: i32,
    /// Also report stopped/continued children.
    pub trace: bool,
    /// Pid that changed status (provider result).
    pub rpid: i32,
    /// Raw wait status (provider result).
    pub rstatus: i32,
}

impl Child {
    pub fn new(pid: i32, trace: bool) -> Self {
        Self { pid, trace, rpid: 0, rstatus: 0 }
    }

    /// Exit code if the child exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        if libc::WIFEXITED(self.rstatus) {
            Some(libc::WEXITSTATUS(self.rstatus))
        } else {
            None
        }
    }
}

impl WatcherKind for Child {
    const NAME: &'static str = "child";
    const EVENT: Revents = Revents::CHILD;
}

/// Snapshot of a path's attributes. `exists == false` means stat failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatAttr {
    pub exists: bool,
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub mtime_nsec: i64,
    pub ctime: i64,
    pub ctime_nsec: i64,
}

impl StatAttr {
    /// Stat `path` now.
    pub fn probe(path: &std::path::Path) -> Self {
        use std::os::unix::fs::MetadataExt;

        match std::fs::metadata(path) {
            Ok(m) => Self {
                exists: true,
                dev: m.dev(),
                ino: m.ino(),
                mode: m.mode(),
                nlink: m.nlink(),
                uid: m.uid(),
                gid: m.gid(),
                rdev: m.rdev(),
                size: m.size(),
                atime: m.atime(),
                mtime: m.mtime(),
                mtime_nsec: m.mtime_nsec(),
                ctime: m.ctime(),
                ctime_nsec: m.ctime_nsec(),
            },
            Err(_) => Self::default(),
        }
    }

    /// Differences that count as a change. Access time is ignored.
    pub fn changed_from(&self, other: &StatAttr) -> bool {
        StatAttr { atime: 0, ..*self } != StatAttr { atime: 0, ..*other }
    }
}

/// Filesystem path attribute changes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Stat {
    pub path: PathBuf,
    /// Poll interval; `0.0` uses the provider default.
    pub interval: Tstamp,
    /// Latest attributes (provider result).
    pub attr: StatAttr,
    /// Attributes before the latest change (provider result).
    pub prev: StatAttr,
    /// Provider-maintained next check time.
    pub at: Tstamp,
}

impl Stat {
    pub fn new(path: impl Into<PathBuf>, interval: Tstamp) -> Self {
        Self { path: path.into(), interval: interval.max(0.0), ..Self::default() }
    }
}

impl WatcherKind for Stat {
    const NAME: &'static str = "stat";
    const EVENT: Revents = Revents::STAT;
}

/// Runs when the loop has nothing else to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Idle;

impl WatcherKind for Idle {
    const NAME: &'static str = "idle";
    const EVENT: Revents = Revents::IDLE;
}

/// Runs before the loop blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Prepare;

impl WatcherKind for Prepare {
    const NAME: &'static str = "prepare";
    const EVENT: Revents = Revents::PREPARE;
}

/// Runs after the loop wakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Check;

impl WatcherKind for Check {
    const NAME: &'static str = "check";
    const EVENT: Revents = Revents::CHECK;
}

pub type IoWatcher = Watcher<Io>;
pub type TimerWatcher = Watcher<Timer>;
pub type PeriodicWatcher = Watcher<Periodic>;
pub type SignalWatcher = Watcher<Signal>;
pub type ChildWatcher = Watcher<Child>;
pub type StatWatcher = Watcher<Stat>;
pub type IdleWatcher = Watcher<Idle>;
pub type PrepareWatcher = Watcher<Prepare>;
pub type CheckWatcher = Watcher<Check>;
