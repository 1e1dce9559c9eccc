//! Contract of the platform service that manages affinity groups
//!
//! The reconciler only ever talks to the platform through [`AffinityService`].
//! Handles returned by `create` are opaque; only the service interprets them.

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::owner::{ClusterRef, Owner};

/// Errors returned by an [`AffinityService`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// The owner's shape cannot be grouped on this platform
    ///
    /// For example, the owner stamps machines from a template that is not a
    /// platform machine template. Clusters whose only failures are of this
    /// kind still converge, with a warning.
    #[error("incompatible owner {owner}: {reason}")]
    IncompatibleOwner {
        /// Name of the owner object
        owner: String,
        /// Why the owner cannot be grouped
        reason: String,
    },

    /// The platform rejected or failed the request
    #[error("platform error: {message}")]
    Platform {
        /// Description of what failed
        message: String,
        /// Whether the same call may succeed later
        retryable: bool,
    },

    /// The call did not complete within the per-call timeout
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// Service operation that timed out
        operation: &'static str,
        /// Timeout that elapsed
        seconds: u64,
    },
}

impl ServiceError {
    /// Owner cannot be grouped
    pub fn incompatible_owner(owner: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::IncompatibleOwner {
            owner: owner.into(),
            reason: reason.into(),
        }
    }

    /// Retryable platform failure
    pub fn platform(msg: impl Into<String>) -> Self {
        Self::Platform {
            message: msg.into(),
            retryable: true,
        }
    }

    /// Platform failure that will not heal on its own
    pub fn platform_permanent(msg: impl Into<String>) -> Self {
        Self::Platform {
            message: msg.into(),
            retryable: false,
        }
    }

    /// True when repeating the call may succeed without any change
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::IncompatibleOwner { .. } => false,
            ServiceError::Platform { retryable, .. } => *retryable,
            ServiceError::Timeout { .. } => true,
        }
    }

    /// True when the owner shape is unsupported
    pub fn is_incompatible_owner(&self) -> bool {
        matches!(self, ServiceError::IncompatibleOwner { .. })
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::IncompatibleOwner { .. } => "incompatible_owner",
            ServiceError::Platform { .. } => "platform",
            ServiceError::Timeout { .. } => "timeout",
        }
    }
}

/// Platform operations on affinity groups
///
/// Implementations must honour these guarantees:
/// - `create` is safe to repeat: it returns the existing group of an owner
///   rather than creating a duplicate, or `None` (or an empty handle) when
///   creation is intentionally skipped.
/// - `exists` reflects platform state at call time and reports connectivity
///   problems as errors, never as `false`.
/// - `remove` of an already removed handle succeeds.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AffinityService: Send + Sync {
    /// Create (or look up) the affinity group of an owner
    async fn create(&self, cluster: &ClusterRef, owner: &Owner)
        -> Result<Option<String>, ServiceError>;

    /// Check whether the group behind `handle` still exists for `owner`
    async fn exists(
        &self,
        cluster: &ClusterRef,
        owner: &Owner,
        handle: &str,
    ) -> Result<bool, ServiceError>;

    /// Delete the group behind `handle`
    async fn remove(&self, cluster: &ClusterRef, handle: &str) -> Result<(), ServiceError>;
}
