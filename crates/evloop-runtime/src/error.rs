//! Provider-internal errors.
//!
//! Table functions have fixed `()` signatures, so these never cross the
//! table: they are logged where they happen and leave the watcher inactive.

use core::fmt;

pub type LoopResult<T> = Result<T, LoopError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopError {
    /// A system call failed with this errno.
    Os(i32),
    /// Installing or restoring a signal disposition failed.
    SignalSetup(i32),
    /// Not a deliverable signal number.
    InvalidSignal(i32),
    /// Negative descriptor passed to an io watcher.
    InvalidFd(i32),
}

impl LoopError {
    pub(crate) fn last_os() -> Self {
        LoopError::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopError::Os(e) => write!(f, "OS error: errno {}", e),
            LoopError::SignalSetup(e) => write!(f, "signal setup failed: errno {}", e),
            LoopError::InvalidSignal(s) => write!(f, "invalid signal number {}", s),
            LoopError::InvalidFd(fd) => write!(f, "invalid file descriptor {}", fd),
        }
    }
}

impl std::error::Error for LoopError {}

impl From<nix::errno::Errno> for LoopError {
    fn from(e: nix::errno::Errno) -> Self {
        LoopError::Os(e as i32)
    }
}
