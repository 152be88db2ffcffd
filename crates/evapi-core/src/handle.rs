//! Host handle conversion.
//!
//! Consumers work with their own handle types (file objects, numeric
//! strings, signal names). The loop only understands raw descriptors and
//! signal numbers; these two pure functions bridge the gap and are exported
//! through the table as `sv_fileno` and `sv_signum`.

use std::os::unix::io::{AsRawFd, RawFd};
use std::str::FromStr;

use nix::sys::signal::Signal as NixSignal;

/// Something a consumer can hand over as a file descriptor.
#[derive(Clone, Copy)]
pub enum HostHandle<'a> {
    /// A raw descriptor number.
    Fd(i64),
    /// A decimal descriptor number in text form.
    Str(&'a str),
    /// Any open object with a descriptor.
    Object(&'a dyn AsRawFd),
}

impl std::fmt::Debug for HostHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostHandle::Fd(n) => write!(f, "Fd({})", n),
            HostHandle::Str(s) => write!(f, "Str({:?})", s),
            HostHandle::Object(o) => write!(f, "Object(fd={})", o.as_raw_fd()),
        }
    }
}

/// Something a consumer can hand over as a signal.
#[derive(Debug, Clone, Copy)]
pub enum SignalSpec<'a> {
    Num(i64),
    /// `"INT"`, `"SIGINT"`, `"sigint"` or a decimal number.
    Name(&'a str),
}

/// Convert a host handle to a descriptor. `None` if it does not name one.
pub fn sv_fileno(handle: &HostHandle<'_>) -> Option<RawFd> {
    match *handle {
        HostHandle::Fd(n) => fd_from_i64(n),
        HostHandle::Str(s) => s.trim().parse::<i64>().ok().and_then(fd_from_i64),
        HostHandle::Object(obj) => {
            let fd = obj.as_raw_fd();
            (fd >= 0).then_some(fd)
        }
    }
}

fn fd_from_i64(n: i64) -> Option<RawFd> {
    RawFd::try_from(n).ok().filter(|fd| *fd >= 0)
}

/// Convert a signal number or name to a signal number valid on this
/// platform. `None` if unknown.
pub fn sv_signum(spec: &SignalSpec<'_>) -> Option<i32> {
    match *spec {
        SignalSpec::Num(n) => i32::try_from(n).ok().filter(|n| is_valid_signum(*n)),
        SignalSpec::Name(name) => signum_from_name(name),
    }
}

fn signum_from_name(name: &str) -> Option<i32> {
    let name = name.trim();
    if let Ok(n) = name.parse::<i64>() {
        return sv_signum(&SignalSpec::Num(n));
    }

    let upper = name.to_ascii_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
    if bare.is_empty() {
        return None;
    }

    if let Some(n) = realtime_from_name(bare) {
        return Some(n);
    }

    NixSignal::from_str(&format!("SIG{}", bare)).ok().map(|s| s as i32)
}

/// Is `signum` a deliverable signal here?
pub fn is_valid_signum(signum: i32) -> bool {
    if NixSignal::try_from(signum).is_ok() {
        return true;
    }
    match realtime_range() {
        Some((lo, hi)) => (lo..=hi).contains(&signum),
        None => false,
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        fn realtime_range() -> Option<(i32, i32)> {
            Some((libc::SIGRTMIN(), libc::SIGRTMAX()))
        }
    } else {
        fn realtime_range() -> Option<(i32, i32)> {
            None
        }
    }
}

/// `RTMIN`, `RTMAX`, `RTMIN+n`, `RTMAX-n`.
fn realtime_from_name(bare: &str) -> Option<i32> {
    let (lo, hi) = realtime_range()?;
    let n = if let Some(rest) = bare.strip_prefix("RTMIN") {
        lo + parse_offset(rest, '+')?
    } else if let Some(rest) = bare.strip_prefix("RTMAX") {
        hi - parse_offset(rest, '-')?
    } else {
        return None;
    };
    (lo..=hi).contains(&n).then_some(n)
}

fn parse_offset(rest: &str, sign: char) -> Option<i32> {
    if rest.is_empty() {
        return Some(0);
    }
    rest.strip_prefix(sign)?.parse::<i32>().ok()
}
