//! Process-wide cache for a bound handle.

use std::sync::OnceLock;

use evapi_core::{ApiVersion, BindResult, EvApi, Registry};

use crate::ev::{import_with, Ev};

/// Holds the `Ev` a consumer bound at init, for code that has no handle at
/// hand.
///
/// ```ignore
/// static EV: EvSlot = EvSlot::new();
///
/// fn init() -> BindResult<()> {
///     i_ev_api!(EV, "timer-plugin")?;
///     Ok(())
/// }
///
/// fn later() {
///     let now = EV.get().map(|ev| ev.now());
/// }
/// ```
pub struct EvSlot {
    cell: OnceLock<Ev>,
}

impl EvSlot {
    pub const fn new() -> Self {
        Self { cell: OnceLock::new() }
    }

    /// Bind against the global registry unless already bound.
    pub fn init(&self, consumer: &str) -> BindResult<Ev> {
        self.init_with(evapi_core::registry::global(), ApiVersion::CURRENT, consumer)
    }

    /// Bind against `registry` unless already bound. A failed bind leaves
    /// the slot empty so init can be retried after the provider loads.
    pub fn init_with(
        &self,
        registry: &Registry<EvApi>,
        expected: ApiVersion,
        consumer: &str,
    ) -> BindResult<Ev> {
        if let Some(ev) = self.cell.get() {
            return Ok(*ev);
        }
        let ev = import_with(registry, expected, consumer)?;
        Ok(*self.cell.get_or_init(|| ev))
    }

    pub fn get(&self) -> Option<Ev> {
        self.cell.get().copied()
    }

    pub fn is_bound(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl Default for EvSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evloop_runtime::publish_in;

    #[test]
    fn test_failed_init_leaves_slot_empty() {
        let reg = Registry::new();
        let slot = EvSlot::new();
        assert!(slot.init_with(&reg, ApiVersion::CURRENT, "late-plugin").is_err());
        assert!(!slot.is_bound());

        publish_in(&reg).unwrap();
        let ev = slot.init_with(&reg, ApiVersion::CURRENT, "late-plugin").unwrap();
        assert!(slot.is_bound());
        assert_eq!(slot.get().map(|e| e.api_version()), Some(ev.api_version()));
    }

    #[test]
    fn test_second_init_returns_cached() {
        let reg = Registry::new();
        publish_in(&reg).unwrap();
        let slot = EvSlot::new();
        let a = slot.init_with(&reg, ApiVersion::CURRENT, "a").unwrap();
        // would fail if it reached the registry again
        let b = slot.init_with(&reg, ApiVersion::new(9, 0), "a").unwrap();
        assert!(a.same_table(&b));
    }
}
