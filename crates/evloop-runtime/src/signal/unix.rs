//! Unix self-pipe signal hub (process-wide)

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Mutex, PoisonError};

use evapi_core::handle::is_valid_signum;
use evapi_core::{kdebug, kerror};
use nix::errno::Errno;

use crate::error::{LoopError, LoopResult};

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        const NSIG: usize = 65;
    } else {
        const NSIG: usize = 33;
    }
}

static PENDING: [AtomicBool; NSIG] = [const { AtomicBool::new(false) }; NSIG];
static WAKE_WR: AtomicI32 = AtomicI32::new(-1);
static HUB: Mutex<Option<Hub>> = Mutex::new(None);

struct Hub {
    rd: RawFd,
    wr: RawFd,
    /// signum -> (watch count, disposition to restore)
    watched: HashMap<i32, (usize, libc::sigaction)>,
}

// Only async-signal-safe calls in here.
extern "C" fn on_signal(signum: libc::c_int) {
    let saved = Errno::last_raw();
    if let Some(flag) = PENDING.get(signum as usize) {
        flag.store(true, Ordering::Release);
    }
    let fd = WAKE_WR.load(Ordering::Acquire);
    if fd >= 0 {
        let byte = 1u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
    Errno::set_raw(saved);
}

fn set_nonblock_cloexec(fd: RawFd) -> LoopResult<()> {
    unsafe {
        let fl = libc::fcntl(fd, libc::F_GETFL);
        if fl < 0 || libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK) < 0 {
            return Err(LoopError::last_os());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(LoopError::last_os());
        }
    }
    Ok(())
}

impl Hub {
    fn open() -> LoopResult<Self> {
        let mut fds = [-1 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(LoopError::last_os());
        }
        let hub = Hub { rd: fds[0], wr: fds[1], watched: HashMap::new() };
        set_nonblock_cloexec(hub.rd)?;
        set_nonblock_cloexec(hub.wr)?;
        WAKE_WR.store(hub.wr, Ordering::Release);
        kdebug!("signal pipe open (rd={}, wr={})", hub.rd, hub.wr);
        Ok(hub)
    }
}

fn install(signum: i32) -> LoopResult<libc::sigaction> {
    unsafe {
        let mut new: libc::sigaction = std::mem::zeroed();
        let mut old: libc::sigaction = std::mem::zeroed();
        new.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        new.sa_flags = libc::SA_RESTART;
        libc::sigfillset(&mut new.sa_mask);
        if libc::sigaction(signum, &new, &mut old) < 0 {
            return Err(LoopError::SignalSetup(Errno::last_raw()));
        }
        Ok(old)
    }
}

fn restore(signum: i32, old: &libc::sigaction) {
    if unsafe { libc::sigaction(signum, old, std::ptr::null_mut()) } < 0 {
        kerror!("restoring disposition of signal {} failed: errno {}", signum, Errno::last_raw());
    }
}

/// Start catching `signum`. Counted: the handler stays until every
/// `watch` has a matching `unwatch`.
pub fn watch(signum: i32) -> LoopResult<()> {
    if !is_valid_signum(signum)
        || signum as usize >= NSIG
        || signum == libc::SIGKILL
        || signum == libc::SIGSTOP
    {
        return Err(LoopError::InvalidSignal(signum));
    }
    let mut guard = HUB.lock().unwrap_or_else(PoisonError::into_inner);
    if guard.is_none() {
        *guard = Some(Hub::open()?);
    }
    let Some(hub) = guard.as_mut() else {
        return Err(LoopError::Os(libc::EBADF));
    };
    if let Some((count, _)) = hub.watched.get_mut(&signum) {
        *count += 1;
        return Ok(());
    }
    let old = install(signum)?;
    hub.watched.insert(signum, (1, old));
    kdebug!("catching signal {}", signum);
    Ok(())
}

/// Drop one `watch` of `signum`; the last one restores the old disposition.
pub fn unwatch(signum: i32) {
    let mut guard = HUB.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(hub) = guard.as_mut() else { return };
    let last = match hub.watched.get_mut(&signum) {
        Some((count, _)) => {
            *count -= 1;
            *count == 0
        }
        None => return,
    };
    if last {
        if let Some((_, old)) = hub.watched.remove(&signum) {
            restore(signum, &old);
        }
        if let Some(flag) = PENDING.get(signum as usize) {
            flag.store(false, Ordering::Release);
        }
        kdebug!("released signal {}", signum);
    }
}

/// Read end of the self-pipe, once any signal has been watched.
pub fn wake_fd() -> Option<RawFd> {
    let guard = HUB.lock().unwrap_or_else(PoisonError::into_inner);
    guard.as_ref().map(|hub| hub.rd)
}

/// Empty the self-pipe.
pub fn drain() {
    let Some(fd) = wake_fd() else { return };
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

/// Was `signum` caught since the last call? Clears the flag.
pub fn take(signum: i32) -> bool {
    PENDING
        .get(signum as usize)
        .is_some_and(|flag| flag.swap(false, Ordering::AcqRel))
}

/// Number of outstanding watches on `signum`.
pub fn watch_count(signum: i32) -> usize {
    let guard = HUB.lock().unwrap_or_else(PoisonError::into_inner);
    guard
        .as_ref()
        .and_then(|hub| hub.watched.get(&signum))
        .map_or(0, |(count, _)| *count)
}
