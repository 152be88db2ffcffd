//! # evloop-runtime
//!
//! Reference provider of the `ev::API` table: a single-threaded event loop
//! per thread, driven by `poll(2)`, with timers, wall-clock periodics,
//! signals, child status, file stat polling and idle/prepare/check hooks.
//!
//! ```ignore
//! evloop_runtime::publish()?;            // provider side, once
//! let ev = evapi::import("my-plugin")?;  // consumer side
//! ```

pub mod api;
pub mod backend;
pub mod child;
pub mod clock;
pub mod config;
pub mod error;
pub mod ev_loop;
pub mod ops;
pub mod signal;
pub mod timer;

pub use api::{publish, publish_in, EV_API};
pub use config::{ConfigError, LoopConfig};
pub use error::{LoopError, LoopResult};
pub use ev_loop::EvLoop;
pub use ops::default_loop;
