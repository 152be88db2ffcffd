//! The exported capability table and its publication.

use evapi_core::registry::{self, Publish, Registry, API_NAME};
use evapi_core::{kdebug, sv_fileno, sv_signum, EvApi, PublishError, API_REVISION, API_VERSION};

use crate::ops;

/// Table handed to consumers. Every slot forwards to the calling thread's
/// default loop.
pub static EV_API: EvApi = EvApi {
    ver: API_VERSION,
    rev: API_REVISION,

    sv_fileno,
    sv_signum,

    now: ops::now,
    time: ops::time,
    backend: ops::backend,
    run: ops::run,
    break_loop: ops::break_loop,
    ref_loop: ops::ref_loop,
    unref_loop: ops::unref_loop,
    once: ops::once,
    clear_pending: ops::clear_pending,
    invoke: ops::invoke,

    io_start: ops::io_start,
    io_stop: ops::io_stop,
    timer_start: ops::timer_start,
    timer_stop: ops::timer_stop,
    timer_again: ops::timer_again,
    periodic_start: ops::periodic_start,
    periodic_stop: ops::periodic_stop,
    signal_start: ops::signal_start,
    signal_stop: ops::signal_stop,
    child_start: ops::child_start,
    child_stop: ops::child_stop,
    stat_start: ops::stat_start,
    stat_stop: ops::stat_stop,
    stat_stat: ops::stat_stat,
    idle_start: ops::idle_start,
    idle_stop: ops::idle_stop,
    prepare_start: ops::prepare_start,
    prepare_stop: ops::prepare_stop,
    check_start: ops::check_start,
    check_stop: ops::check_stop,
};

/// Publish `EV_API` in the process-wide registry under `ev::API`.
pub fn publish() -> Result<Publish, PublishError> {
    publish_in(registry::global())
}

/// Publish `EV_API` in `registry` under `ev::API`.
pub fn publish_in(registry: &Registry<EvApi>) -> Result<Publish, PublishError> {
    let outcome = registry.publish(API_NAME, &EV_API)?;
    if outcome == Publish::Published {
        kdebug!("provider tables: {:?}", registry.names());
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use evapi_core::{ApiVersion, BindError, Versioned};

    #[test]
    fn test_table_header() {
        assert_eq!(EV_API.api_version(), ApiVersion::CURRENT);
        assert_eq!(EV_API.ver, 3);
        assert_eq!(EV_API.rev, 0);
    }

    #[test]
    fn test_publish_then_bind() {
        let reg = Registry::new();
        assert!(matches!(
            reg.bind(API_NAME, ApiVersion::CURRENT, "test"),
            Err(BindError::NotFound { .. })
        ));
        assert_eq!(publish_in(&reg), Ok(Publish::Published));
        assert_eq!(publish_in(&reg), Ok(Publish::Unchanged));
        let table = reg.bind(API_NAME, ApiVersion::CURRENT, "test").unwrap();
        assert!(std::ptr::eq(table, &EV_API));
    }

    #[test]
    fn test_other_table_conflicts() {
        fn zero() -> u32 {
            0
        }
        static OTHER: std::sync::OnceLock<EvApi> = std::sync::OnceLock::new();
        let other = OTHER.get_or_init(|| EvApi { backend: zero, ..EV_API });

        let reg = Registry::new();
        reg.publish(API_NAME, other).unwrap();
        assert!(matches!(publish_in(&reg), Err(PublishError::Conflict { .. })));
        assert!(std::ptr::eq(reg.lookup(API_NAME).unwrap(), other));
    }

    #[test]
    fn test_sv_slots_are_core_helpers() {
        use evapi_core::{HostHandle, SignalSpec};
        assert_eq!((EV_API.sv_fileno)(&HostHandle::Fd(4)), Some(4));
        assert_eq!((EV_API.sv_signum)(&SignalSpec::Name("int")), Some(libc::SIGINT));
    }
}
