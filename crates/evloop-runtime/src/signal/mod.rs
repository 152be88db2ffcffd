//! Signal delivery for signal and child watchers
//!
//! Handlers only flip a per-signal flag and write one byte to a self-pipe;
//! the loop polls the pipe's read end and collects flags after waking.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    }
}
