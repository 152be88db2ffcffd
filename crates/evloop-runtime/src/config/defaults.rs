//! Library defaults for `LoopConfig`.

/// Stat watcher poll interval when the watcher asks for the default.
pub const STAT_INTERVAL_MS: u64 = 5000;

/// Lower bound for any stat poll interval.
pub const MIN_STAT_INTERVAL_MS: u64 = 100;

/// Longest block while signal or child watchers are active.
pub const SIGNAL_POLL_MS: u64 = 100;

/// Longest single block of the loop.
pub const MAX_BLOCK_MS: u64 = 60_000;

/// Initial pollfd buffer capacity.
pub const POLL_CAPACITY: usize = 64;
