//! Error types for the affinity group controller
//!
//! Errors are structured with fields to aid debugging in production.
//! Variants that belong to a single reconciliation pass carry the name of the
//! infrastructure cluster being reconciled.

use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs or object metadata
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "metadata.labels")
        field: Option<String>,
    },

    /// Cluster topology violates an invariant (e.g. two control planes)
    ///
    /// Fatal to the whole pass: no binding is touched.
    #[error("configuration error for {cluster}: {message}")]
    Configuration {
        /// Name of the cluster with the invalid topology
        cluster: String,
        /// Description of the violated invariant
        message: String,
    },

    /// The owner objects of a cluster could not be listed
    #[error("failed to list owner objects for {cluster}: {message}")]
    OwnerListing {
        /// Name of the cluster whose owners were being listed
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// One or more affinity groups could not be verified or created
    ///
    /// The binding set produced by the pass has already been persisted when
    /// this error is returned.
    #[error("cluster module setup failed for {cluster}: {message}")]
    ModuleSetup {
        /// Name of the cluster being reconciled
        cluster: String,
        /// Summary of every per-owner failure, in processing order
        message: String,
        /// False when every hard failure needs a change before it can heal
        retryable: bool,
    },

    /// The pass was cancelled by the caller
    #[error("reconciliation of {cluster} cancelled")]
    Cancelled {
        /// Name of the cluster being reconciled
        cluster: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "telemetry", "client")
        context: String,
    },
}

impl Error {
    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a configuration error for a cluster
    pub fn configuration(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an owner listing error for a cluster
    pub fn owner_listing(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::OwnerListing {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an aggregated module setup error for a cluster
    pub fn module_setup(
        cluster: impl Into<String>,
        msg: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::ModuleSetup {
            cluster: cluster.into(),
            message: msg.into(),
            retryable,
        }
    }

    /// Create a cancellation error for a cluster
    pub fn cancelled(cluster: impl Into<String>) -> Self {
        Self::Cancelled {
            cluster: cluster.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and configuration errors require a change to the cluster
    /// objects before a retry can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 4xx means the request itself is wrong
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Validation { .. } => false,
            Error::Configuration { .. } => false,
            Error::OwnerListing { .. } => true,
            Error::ModuleSetup { retryable, .. } => *retryable,
            Error::Cancelled { .. } => true,
            Error::Internal { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Propagation in Module Reconciliation
    // ==========================================================================

    /// Story: Two control planes for one cluster is a topology bug
    ///
    /// The pass is aborted and nothing is retried until the objects change.
    #[test]
    fn story_configuration_error_is_fatal_and_permanent() {
        let err = Error::configuration(
            "prod-cluster",
            "multiple KubeadmControlPlane objects found, expected 1, found 2",
        );
        assert!(err.to_string().contains("configuration error for prod-cluster"));
        assert!(err.to_string().contains("found 2"));
        assert!(!err.is_retryable());
    }

    /// Story: An unavailable API server fails listing but heals on retry
    #[test]
    fn story_owner_listing_errors_are_retryable() {
        let err = Error::owner_listing("edge-01", "connection refused");
        assert!(err.to_string().contains("failed to list owner objects for edge-01"));
        assert!(err.is_retryable());
    }

    /// Story: Aggregated module failures carry the summary for the operator
    #[test]
    fn story_module_setup_error_carries_summary() {
        let err = Error::module_setup(
            "edge-01",
            "Failed to create cluster modules for: md-0 platform unavailable",
            true,
        );
        assert!(err.to_string().contains("md-0 platform unavailable"));
        assert!(err.to_string().contains("edge-01"));
        assert!(err.is_retryable());
    }

    /// Story: A quota rejection will not heal by retrying quickly
    #[test]
    fn story_permanent_module_setup_waits_for_resync() {
        let err = Error::module_setup("edge-01", "md-0 quota exceeded", false);
        assert!(!err.is_retryable());
    }

    #[test]
    fn cancelled_is_retryable() {
        let err = Error::cancelled("edge-01");
        assert_eq!(err.to_string(), "reconciliation of edge-01 cancelled");
        assert!(err.is_retryable());
    }

    #[test]
    fn validation_with_field_path() {
        let err = Error::validation_for_field("test", "metadata.labels", "missing cluster name");
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("metadata.labels"));
            }
            _ => panic!("Expected Validation variant"),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn internal_error_context() {
        let err = Error::internal_with_context("client", "invalid kubeconfig");
        assert!(err.to_string().contains("[client]"));
        assert!(err.is_retryable());
    }
}
