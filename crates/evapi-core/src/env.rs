//! Environment variable helpers
//!
//! ```ignore
//! use evapi_core::env::{env_get, env_get_bool};
//!
//! let stat_ms: u64 = env_get("EV_STAT_INTERVAL_MS", 5000);
//! let flush = env_get_bool("EV_FLUSH_EPRINT", false);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, or `default` if unset or unparsable.
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// `"1"`, `"true"`, `"yes"`, `"on"` (any case) are true; any other value is
/// false; unset yields `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// `Some` only if set and parsable.
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_returns_default() {
        let v: u64 = env_get("__EVAPI_TEST_UNSET__", 42);
        assert_eq!(v, 42);
        assert!(env_get_bool("__EVAPI_TEST_UNSET__", true));
        assert!(env_get_opt::<u32>("__EVAPI_TEST_UNSET__").is_none());
        assert_eq!(env_get_str("__EVAPI_TEST_UNSET__", "x"), "x");
    }

    #[test]
    fn test_parse_and_fallback() {
        std::env::set_var("__EVAPI_TEST_NUM__", " 250 ");
        assert_eq!(env_get::<u64>("__EVAPI_TEST_NUM__", 0), 250);
        std::env::set_var("__EVAPI_TEST_NUM__", "soon");
        assert_eq!(env_get::<u64>("__EVAPI_TEST_NUM__", 7), 7);
        std::env::remove_var("__EVAPI_TEST_NUM__");
    }

    #[test]
    fn test_bool_variants() {
        for (raw, want) in [("1", true), ("On", true), ("YES", true), ("0", false), ("nah", false)] {
            std::env::set_var("__EVAPI_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__EVAPI_TEST_BOOL__", !want), want, "{}", raw);
        }
        std::env::remove_var("__EVAPI_TEST_BOOL__");
    }
}
