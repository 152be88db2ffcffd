//! Deadline queues for timer, periodic and stat watchers
//!
//! ```text
//!     timer_start ──insert(id, at)──►  TimerQueue<TimerWatcher>    (monotonic)
//!  periodic_start ──insert(id, at)──►  TimerQueue<PeriodicWatcher> (wall clock)
//!      stat_start ──insert(id, at)──►  TimerQueue<StatWatcher>     (monotonic)
//!                                             │
//!                       loop iteration ──pop_expired(now)──► pending queue
//! ```
//!
//! Each queue is keyed by watcher id. Re-inserting an id supersedes its
//! earlier deadline; the superseded heap entry is skipped when it surfaces.

mod heap;

pub use heap::{TimerQueue, TimerQueueStats};
