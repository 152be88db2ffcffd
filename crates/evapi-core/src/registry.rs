//! Published handles.
//!
//! A `Registry` maps discoverable names to `'static` tables. The provider
//! writes a slot once, at its own initialization; consumers only read.
//!
//! # Lifecycle
//!
//! ```text
//! provider init ──publish(name, &TABLE)──► slot filled (never removed)
//!                                               │
//! consumer init ──bind(name, expected, who)─────┘──► &'static TABLE
//! ```
//!
//! Publish happens-before bind by module load order. The lock only guards
//! the map itself; the tables are immutable once published.

use std::collections::HashMap;
use std::sync::{OnceLock, PoisonError, RwLock};

use crate::error::{BindError, BindResult, PublishError};
use crate::table::EvApi;
use crate::version::{ApiVersion, Versioned};
use crate::{kdebug, kerror, kinfo};

/// Discoverable name of the event-loop table.
pub const API_NAME: &str = "ev::API";

/// Outcome of a successful publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    /// The slot was empty and now holds the table.
    Published,
    /// An equivalent table was already published; nothing changed.
    Unchanged,
}

/// Name → table map with single-writer/many-reader slots.
pub struct Registry<T: Versioned + Sync + 'static> {
    slots: RwLock<HashMap<String, &'static T>>,
}

impl<T: Versioned + Sync + 'static> Registry<T> {
    pub fn new() -> Self {
        Self { slots: RwLock::new(HashMap::new()) }
    }

    /// Store `table` under `name`.
    ///
    /// Publishing the same (or an equivalent) table again is a no-op.
    /// Publishing a different table under a taken name is refused and the
    /// original stays in place.
    pub fn publish(&self, name: &str, table: &'static T) -> Result<Publish, PublishError> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = slots.get(name) {
            if existing.same_table(table) {
                kdebug!("{}: republish of {} ignored", name, table.api_version());
                return Ok(Publish::Unchanged);
            }
            let err = PublishError::Conflict {
                name: name.to_string(),
                existing: existing.api_version(),
                attempted: table.api_version(),
            };
            kerror!("{}", err);
            return Err(err);
        }

        slots.insert(name.to_string(), table);
        kinfo!("{}: published version {}", name, table.api_version());
        Ok(Publish::Published)
    }

    /// Raw lookup without any version check.
    pub fn lookup(&self, name: &str) -> Option<&'static T> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.get(name).copied()
    }

    /// Look up `name` and validate it against what `consumer` was built for.
    ///
    /// On success the returned reference is valid for the rest of the
    /// process and should be cached by the consumer.
    pub fn bind(&self, name: &str, expected: ApiVersion, consumer: &str) -> BindResult<&'static T> {
        let table = match self.lookup(name) {
            Some(t) => t,
            None => {
                let err = BindError::NotFound { name: name.to_string() };
                kerror!("{}: {}", consumer, err);
                return Err(err);
            }
        };

        let published = table.api_version();
        if !published.is_compatible_with(&expected) {
            let err = BindError::VersionMismatch {
                name: name.to_string(),
                consumer: consumer.to_string(),
                published,
                expected,
            };
            kerror!("{}", err);
            return Err(err);
        }

        kdebug!("{}: bound {} {} (built for {})", consumer, name, published, expected);
        Ok(table)
    }

    pub fn is_published(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Names with a published table, sorted.
    pub fn names(&self) -> Vec<String> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = slots.keys().cloned().collect();
        names.sort();
        names
    }
}

impl<T: Versioned + Sync + 'static> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide registry for event-loop tables.
///
/// Created on first access. Providers publish here unless they were handed
/// a registry explicitly.
pub fn global() -> &'static Registry<EvApi> {
    static GLOBAL: OnceLock<Registry<EvApi>> = OnceLock::new();
    GLOBAL.get_or_init(Registry::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kprint::{set_log_level, LogLevel};
    use crate::table::testing::inert;

    fn leak(t: EvApi) -> &'static EvApi {
        Box::leak(Box::new(t))
    }

    #[test]
    fn test_lookup_before_publish_is_not_found() {
        set_log_level(LogLevel::Off);
        let reg: Registry<EvApi> = Registry::new();
        let err = reg.bind(API_NAME, ApiVersion::new(1, 0), "early").unwrap_err();
        assert_eq!(err, BindError::NotFound { name: API_NAME.to_string() });
        assert!(err.to_string().contains(API_NAME));
    }

    #[test]
    fn test_scenario_revision_too_old() {
        set_log_level(LogLevel::Off);
        let reg = Registry::new();
        let table = leak(inert(3, 0));
        assert_eq!(reg.publish(API_NAME, table), Ok(Publish::Published));

        let a = reg.bind(API_NAME, ApiVersion::new(3, 0), "consumer-a").unwrap();
        assert!(std::ptr::eq(a, table));

        let err = reg.bind(API_NAME, ApiVersion::new(3, 1), "consumer-b").unwrap_err();
        match err {
            BindError::VersionMismatch { published, expected, ref consumer, .. } => {
                assert_eq!(published, ApiVersion::new(3, 0));
                assert_eq!(expected, ApiVersion::new(3, 1));
                assert_eq!(consumer, "consumer-b");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_newer_revision_binds() {
        set_log_level(LogLevel::Off);
        let reg = Registry::new();
        reg.publish(API_NAME, leak(inert(3, 4))).unwrap();
        for rev in 0..=4 {
            assert!(reg.bind(API_NAME, ApiVersion::new(3, rev), "c").is_ok());
        }
        assert!(reg.bind(API_NAME, ApiVersion::new(3, 5), "c").is_err());
    }

    #[test]
    fn test_other_version_never_binds() {
        set_log_level(LogLevel::Off);
        let reg = Registry::new();
        reg.publish(API_NAME, leak(inert(2, 9))).unwrap();
        for (v, r) in [(1, 0), (3, 0), (3, 9), (4, 0)] {
            let err = reg.bind(API_NAME, ApiVersion::new(v, r), "c").unwrap_err();
            assert!(matches!(err, BindError::VersionMismatch { .. }));
        }
    }

    #[test]
    fn test_republish_equivalent_is_noop() {
        set_log_level(LogLevel::Off);
        let reg = Registry::new();
        let first = leak(inert(3, 0));
        let second = leak(inert(3, 0));
        reg.publish(API_NAME, first).unwrap();
        let cached = reg.bind(API_NAME, ApiVersion::new(3, 0), "c").unwrap();

        assert_eq!(reg.publish(API_NAME, second), Ok(Publish::Unchanged));
        assert_eq!(reg.publish(API_NAME, first), Ok(Publish::Unchanged));

        let again = reg.lookup(API_NAME).unwrap();
        assert!(cached.same_table(again));
        assert!(std::ptr::eq(again, first));
    }

    #[test]
    fn test_conflicting_publish_keeps_original() {
        set_log_level(LogLevel::Off);
        let reg = Registry::new();
        let first = leak(inert(3, 0));
        reg.publish(API_NAME, first).unwrap();

        let err = reg.publish(API_NAME, leak(inert(3, 1))).unwrap_err();
        assert!(matches!(err, PublishError::Conflict { .. }));
        assert!(std::ptr::eq(reg.lookup(API_NAME).unwrap(), first));
    }

    #[test]
    fn test_names() {
        set_log_level(LogLevel::Off);
        let reg = Registry::new();
        assert!(reg.names().is_empty());
        reg.publish("b::API", leak(inert(3, 0))).unwrap();
        reg.publish("a::API", leak(inert(3, 0))).unwrap();
        assert_eq!(reg.names(), vec!["a::API".to_string(), "b::API".to_string()]);
        assert!(reg.is_published("a::API"));
        assert!(!reg.is_published("c::API"));
    }
}
