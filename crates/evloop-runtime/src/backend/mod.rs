//! Readiness backend abstraction.
//!
//! A `Backend` blocks until one of the registered descriptors is ready or
//! the timeout passes. The loop rebuilds the interest list each iteration
//! from its active io watchers, so backends hold no registration state.
//!
//! # Implementors
//!
//! - `PollBackend`: `poll(2)`. Works on every unix.

mod poll;

pub use poll::PollBackend;

use std::os::unix::io::RawFd;
use std::time::Duration;

use evapi_core::Revents;

use crate::error::LoopResult;

/// One descriptor the loop wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub fd: RawFd,
    /// `READ` and/or `WRITE`.
    pub events: Revents,
}

/// Readiness for `interests[index]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub index: usize,
    pub revents: Revents,
}

pub trait Backend {
    /// Backend identifier as reported through the table (`backend::POLL`, ...).
    fn id(&self) -> u32;

    fn name(&self) -> &'static str;

    /// Wait up to `timeout` (`None` = forever) and report ready interests.
    ///
    /// An interrupted wait returns an empty list, not an error.
    fn wait(&mut self, interests: &[Interest], timeout: Option<Duration>)
        -> LoopResult<Vec<Readiness>>;
}
