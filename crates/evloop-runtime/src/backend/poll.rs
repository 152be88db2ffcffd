//! `PollBackend`: readiness via `poll(2)`.

use std::time::Duration;

use evapi_core::{backend, Revents};

use super::{Backend, Interest, Readiness};
use crate::error::{LoopError, LoopResult};

pub struct PollBackend {
    fds: Vec<libc::pollfd>,
}

impl PollBackend {
    pub fn new(capacity: usize) -> Self {
        Self { fds: Vec::with_capacity(capacity) }
    }
}

/// Round up so a sub-millisecond deadline still sleeps instead of spinning.
fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_nanos().div_ceil(1_000_000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

fn to_poll_events(events: Revents) -> libc::c_short {
    let mut ev = 0;
    if events.contains(Revents::READ) {
        ev |= libc::POLLIN;
    }
    if events.contains(Revents::WRITE) {
        ev |= libc::POLLOUT;
    }
    ev
}

fn from_poll_revents(wanted: Revents, re: libc::c_short) -> Revents {
    if re & libc::POLLNVAL != 0 {
        return Revents::ERROR | Revents::READ | Revents::WRITE;
    }
    let hangup = re & (libc::POLLERR | libc::POLLHUP) != 0;
    let mut out = Revents::NONE;
    if re & libc::POLLIN != 0 || hangup {
        out |= Revents::READ;
    }
    if re & libc::POLLOUT != 0 || hangup {
        out |= Revents::WRITE;
    }
    out & wanted
}

impl Backend for PollBackend {
    fn id(&self) -> u32 {
        backend::POLL
    }

    fn name(&self) -> &'static str {
        "poll"
    }

    fn wait(
        &mut self,
        interests: &[Interest],
        timeout: Option<Duration>,
    ) -> LoopResult<Vec<Readiness>> {
        self.fds.clear();
        self.fds.extend(interests.iter().map(|i| libc::pollfd {
            fd: i.fd,
            events: to_poll_events(i.events),
            revents: 0,
        }));

        let ret = unsafe {
            libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout_ms(timeout))
        };
        if ret < 0 {
            let err = LoopError::last_os();
            if err == LoopError::Os(libc::EINTR) {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut ready = Vec::with_capacity(ret as usize);
        if ret == 0 {
            return Ok(ready);
        }
        for (index, (pfd, interest)) in self.fds.iter().zip(interests).enumerate() {
            if pfd.revents == 0 {
                continue;
            }
            let revents = from_poll_revents(interest.events, pfd.revents);
            if !revents.is_empty() {
                ready.push(Readiness { index, revents });
            }
        }
        Ok(ready)
    }
}
