//! Child status collection for child watchers.

use evapi_core::kwarn;

/// One status change collected by `waitpid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub pid: i32,
    pub status: i32,
}

impl Reaped {
    /// Stopped or continued rather than terminated.
    pub fn is_trace_only(&self) -> bool {
        libc::WIFSTOPPED(self.status) || libc::WIFCONTINUED(self.status)
    }
}

fn wait_flags(trace: bool) -> libc::c_int {
    if trace {
        libc::WNOHANG | libc::WUNTRACED | libc::WCONTINUED
    } else {
        libc::WNOHANG
    }
}

/// Collect every status change currently available for `pid`
/// (0 = any child). Never blocks.
pub fn reap(pid: i32, trace: bool) -> Vec<Reaped> {
    let target = if pid == 0 { -1 } else { pid };
    let mut out = Vec::new();
    loop {
        let mut status: libc::c_int = 0;
        let rpid = unsafe { libc::waitpid(target, &mut status, wait_flags(trace)) };
        if rpid > 0 {
            out.push(Reaped { pid: rpid, status });
            // a specific pid can only change state once per call
            if target > 0 {
                break;
            }
            continue;
        }
        if rpid < 0 {
            let errno = nix::errno::Errno::last_raw();
            if errno == libc::EINTR {
                continue;
            }
            if errno != libc::ECHILD {
                kwarn!("waitpid({}) failed: errno {}", target, errno);
            }
        }
        break;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::{Duration, Instant};

    #[test]
    fn test_reap_exit_status() {
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let pid = child.id() as i32;
        let deadline = Instant::now() + Duration::from_secs(5);
        let reaped = loop {
            let r = reap(pid, false);
            if !r.is_empty() || Instant::now() > deadline {
                break r;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].pid, pid);
        assert!(libc::WIFEXITED(reaped[0].status));
        assert_eq!(libc::WEXITSTATUS(reaped[0].status), 3);
        assert!(!reaped[0].is_trace_only());
    }

    #[test]
    fn test_reap_unknown_pid_is_empty() {
        assert!(reap(i32::MAX - 7, false).is_empty());
    }
}
