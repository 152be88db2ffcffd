//! Errors of the publish/bind protocol.
//!
//! Both bind errors are load-time failures: a consumer that gets one must
//! abort its own initialization. Nothing here is ever returned at call time.

use std::fmt;

use crate::version::ApiVersion;

/// Result type for consumer binding
pub type BindResult<T> = Result<T, BindError>;

/// Why a consumer could not bind to a published table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    /// Nothing was published under `name`: the provider is not loaded, or
    /// was loaded after this consumer.
    NotFound { name: String },

    /// The published table has a different version, or an older revision
    /// than the consumer needs.
    VersionMismatch {
        name: String,
        consumer: String,
        published: ApiVersion,
        expected: ApiVersion,
    },
}

impl BindError {
    /// The discoverable name that was searched.
    pub fn name(&self) -> &str {
        match self {
            BindError::NotFound { name } => name,
            BindError::VersionMismatch { name, .. } => name,
        }
    }
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindError::NotFound { name } => write!(f, "{} not found", name),
            BindError::VersionMismatch { name, consumer, published, expected } => write!(
                f,
                "{} version mismatch ({} vs. {}) -- please recompile {}",
                name, published, expected, consumer
            ),
        }
    }
}

impl std::error::Error for BindError {}

/// Why a provider could not publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// A different table is already published under `name`.
    Conflict {
        name: String,
        existing: ApiVersion,
        attempted: ApiVersion,
    },
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::Conflict { name, existing, attempted } => write!(
                f,
                "{} already published as {} (attempted {} with different operations)",
                name, existing, attempted
            ),
        }
    }
}

impl std::error::Error for PublishError {}
