//! Table versioning.
//!
//! `version` names the shape of the table. Any incompatible change to the
//! field set, order or meaning bumps it. `revision` counts backward-compatible
//! appends within one version.

use std::fmt;

/// Major shape of the `EvApi` table this crate was built with.
pub const API_VERSION: u32 = 3;

/// Revision of the `EvApi` table this crate was built with.
pub const API_REVISION: u32 = 0;

/// A `(version, revision)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApiVersion {
    pub version: u32,
    pub revision: u32,
}

impl ApiVersion {
    /// The pair compiled into this build.
    pub const CURRENT: ApiVersion = ApiVersion::new(API_VERSION, API_REVISION);

    #[inline]
    pub const fn new(version: u32, revision: u32) -> Self {
        Self { version, revision }
    }

    /// Can a consumer expecting `expected` use a table published as `self`?
    ///
    /// Versions must be equal; the published revision must be at least the
    /// consumer's minimum. A newer revision only appends fields the older
    /// consumer never reads.
    #[inline]
    pub const fn is_compatible_with(&self, expected: &ApiVersion) -> bool {
        self.version == expected.version && self.revision >= expected.revision
    }
}

impl Default for ApiVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.version, self.revision)
    }
}

/// A table that carries its own version header.
pub trait Versioned {
    /// The version/revision stored in the table header.
    fn api_version(&self) -> ApiVersion;

    /// Do `self` and `other` expose the same operations?
    ///
    /// Used to decide whether a second publish is a harmless repeat.
    fn same_table(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_version_higher_revision_is_compatible() {
        for rev1 in 0..4 {
            for rev2 in rev1..6 {
                let published = ApiVersion::new(3, rev2);
                let expected = ApiVersion::new(3, rev1);
                assert!(published.is_compatible_with(&expected), "{} vs {}", published, expected);
            }
        }
    }

    #[test]
    fn test_lower_revision_is_incompatible() {
        let published = ApiVersion::new(3, 0);
        let expected = ApiVersion::new(3, 1);
        assert!(!published.is_compatible_with(&expected));
    }

    #[test]
    fn test_version_mismatch_ignores_revision_order() {
        for (v1, v2) in [(1, 2), (2, 3), (3, 1), (4, 3)] {
            for (r1, r2) in [(0, 0), (0, 5), (5, 0)] {
                let published = ApiVersion::new(v1, r1);
                let expected = ApiVersion::new(v2, r2);
                assert!(!published.is_compatible_with(&expected));
            }
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(ApiVersion::new(3, 1).to_string(), "3.1");
        assert_eq!(ApiVersion::CURRENT, ApiVersion::new(API_VERSION, API_REVISION));
    }
}
