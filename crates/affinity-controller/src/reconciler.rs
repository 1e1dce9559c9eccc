//! Binding reconciler: keeps platform affinity groups in step with machine owners
//!
//! One pass merges the bindings recorded by the previous pass with the owners
//! that exist now:
//!
//! 1. Bindings whose owner is gone are removed from the platform (best effort).
//! 2. Bindings whose owner still exists are verified with `exists`.
//! 3. Owners left without a verified binding get a new group via `create`.
//!
//! The pass returns the complete new binding set plus every per-owner failure.
//! Failures never stop other owners from converging; only listing errors,
//! topology violations and cancellation abort the pass.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, info_span, warn, Instrument, Span};

use affinity_common::crd::ClusterModule;
use affinity_common::{metrics, Error, CONTROL_PLANE_KIND};

use crate::owner::{BindingKey, ClusterRef, Owner, OwnerDirectory};
use crate::service::{AffinityService, ServiceError};

/// Oldest platform major version that supports affinity groups
pub const DEFAULT_MIN_PLATFORM_MAJOR: u64 = 7;

/// Default bound on every owner listing and platform call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Prefix of the aggregated failure message
pub const FAILURE_SUMMARY_PREFIX: &str = "Failed to create cluster modules for: ";

/// Tunables of the binding reconciler
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Bound on each external call
    pub call_timeout: Duration,
    /// Minimum platform major version
    pub min_platform_major: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            min_platform_major: DEFAULT_MIN_PLATFORM_MAJOR,
        }
    }
}

/// Service call that failed for an owner
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailedOperation {
    /// Verifying an existing group
    Verify {
        /// Handle that could not be verified
        handle: String,
    },
    /// Creating a new group
    Create,
}

/// A failure recorded for one owner
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerFailure {
    /// Name of the owner object
    pub owner: String,
    /// Kind of the owner object
    pub kind: &'static str,
    /// The call that failed
    pub operation: FailedOperation,
    /// Error returned by the service
    pub error: ServiceError,
}

impl OwnerFailure {
    fn new(owner: &Owner, operation: FailedOperation, error: ServiceError) -> Self {
        Self {
            owner: owner.name().to_string(),
            kind: owner.kind(),
            operation,
            error,
        }
    }
}

impl fmt::Display for OwnerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operation {
            FailedOperation::Verify { handle } => write!(
                f,
                "{} failed to check if cluster module {:?} exists: {}",
                self.owner, handle, self.error
            ),
            FailedOperation::Create => {
                write!(f, "{} failed to create cluster module: {}", self.owner, self.error)
            }
        }
    }
}

/// Status level of a completed pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutcomeLevel {
    /// No owners need a group; nothing to report
    Absent,
    /// Every owner has a verified group
    Ready,
    /// Only incompatible owners failed; the cluster still converges
    Warning,
    /// At least one owner failed for a reason that needs a retry
    Failed,
}

impl OutcomeLevel {
    /// Lowercase label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeLevel::Absent => "absent",
            OutcomeLevel::Ready => "ready",
            OutcomeLevel::Warning => "warning",
            OutcomeLevel::Failed => "failed",
        }
    }
}

/// New binding set and per-owner failures of one pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Bindings to persist, replacing the previous set
    pub bindings: Vec<ClusterModule>,
    /// Failures in processing order
    pub failures: Vec<OwnerFailure>,
}

impl ReconcileOutcome {
    /// Classify the pass
    ///
    /// A pass where every failure is an incompatible owner is tolerated, but a
    /// single other failure turns the whole pass into a hard failure.
    pub fn level(&self) -> OutcomeLevel {
        if self.failures.is_empty() {
            if self.bindings.is_empty() {
                OutcomeLevel::Absent
            } else {
                OutcomeLevel::Ready
            }
        } else if self
            .failures
            .iter()
            .all(|f| f.error.is_incompatible_owner())
        {
            OutcomeLevel::Warning
        } else {
            OutcomeLevel::Failed
        }
    }

    /// Human-readable summary of all failures, in processing order
    pub fn failure_summary(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        let failures: Vec<String> = self.failures.iter().map(ToString::to_string).collect();
        Some(format!("{}{}", FAILURE_SUMMARY_PREFIX, failures.join(", ")))
    }

    /// Error to hand back to the caller for a failed pass
    ///
    /// The error is retryable unless every hard failure is permanent.
    pub fn to_error(&self, cluster: &ClusterRef) -> Option<Error> {
        match self.level() {
            OutcomeLevel::Failed => Some(Error::module_setup(
                cluster.to_string(),
                self.failure_summary().unwrap_or_default(),
                self.failures.iter().any(|f| f.error.is_retryable()),
            )),
            _ => None,
        }
    }
}

/// Result of a pass that did not abort
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PassResult {
    /// The platform cannot host affinity groups; nothing was done
    Unsupported {
        /// Version reported by the cluster, if any
        platform_version: Option<String>,
    },
    /// The pass ran to completion
    Completed(ReconcileOutcome),
}

impl PassResult {
    /// Lowercase label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            PassResult::Unsupported { .. } => "unsupported",
            PassResult::Completed(outcome) => outcome.level().as_str(),
        }
    }
}

/// True when the platform version supports affinity groups
///
/// Accepts `MAJOR.MINOR.PATCH` with an optional leading `v` and an optional
/// pre-release or build suffix. Anything else is unsupported.
pub fn is_platform_compatible(version: Option<&str>, min_major: u64) -> bool {
    version
        .and_then(parse_major_version)
        .is_some_and(|major| major >= min_major)
}

fn parse_major_version(version: &str) -> Option<u64> {
    let version = version.trim();
    let version = version.strip_prefix('v').unwrap_or(version);
    let core = version.split(['-', '+']).next()?;

    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let numbers: Option<Vec<u64>> = parts.iter().map(|p| p.parse().ok()).collect();
    numbers.map(|n| n[0])
}

/// Diff engine between recorded bindings and current owners
pub struct ModuleReconciler {
    owners: Arc<dyn OwnerDirectory>,
    service: Arc<dyn AffinityService>,
    config: ReconcilerConfig,
}

impl ModuleReconciler {
    /// Create a reconciler over the given collaborators
    pub fn new(
        owners: Arc<dyn OwnerDirectory>,
        service: Arc<dyn AffinityService>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            owners,
            service,
            config,
        }
    }

    /// Reconciler tunables
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one pass for a cluster
    ///
    /// `prior` is the binding set recorded by the previous pass. On success the
    /// returned outcome holds the complete replacement set. Errors abort the
    /// pass before anything should be persisted.
    pub async fn reconcile(
        &self,
        cluster: &ClusterRef,
        platform_version: Option<&str>,
        prior: &[ClusterModule],
        cancel: &CancellationToken,
    ) -> Result<PassResult, Error> {
        let span = info_span!("cluster_modules", cluster = %cluster);
        self.run_pass(cluster, platform_version, prior, cancel, &span)
            .instrument(span.clone())
            .await
    }

    async fn run_pass(
        &self,
        cluster: &ClusterRef,
        platform_version: Option<&str>,
        prior: &[ClusterModule],
        cancel: &CancellationToken,
        span: &Span,
    ) -> Result<PassResult, Error> {
        if !is_platform_compatible(platform_version, self.config.min_platform_major) {
            info!(
                parent: span,
                platform_version = ?platform_version,
                min_major = self.config.min_platform_major,
                "platform version does not support cluster modules"
            );
            return Ok(PassResult::Unsupported {
                platform_version: platform_version.map(String::from),
            });
        }

        let owners = self.list_owners(cluster, cancel).await?;
        let mut pending = index_owners(cluster, owners, span)?;

        let mut retained = Vec::new();
        let mut kept_handles = BTreeSet::new();
        let mut failures = Vec::new();

        for binding in prior {
            let key = BindingKey::of(binding);
            let binding_span = debug_span!(
                parent: span,
                "binding",
                key = %key,
                module_uuid = %binding.module_uuid
            );

            let Some(owner) = pending.remove(&key) else {
                // A repeated binding must not delete the group it shares with a kept one
                if kept_handles.contains(binding.module_uuid.as_str()) {
                    debug!(parent: &binding_span, "duplicate binding of a kept cluster module");
                } else {
                    self.remove_orphan(cluster, binding, cancel, &binding_span)
                        .await?;
                }
                continue;
            };

            let verified = self
                .call(
                    cluster,
                    cancel,
                    "exists",
                    self.service.exists(cluster, &owner, &binding.module_uuid),
                )
                .await?;

            match verified {
                Ok(true) => {
                    debug!(parent: &binding_span, "cluster module verified");
                    kept_handles.insert(binding.module_uuid.as_str());
                    retained.push(owner.binding(&binding.module_uuid));
                }
                Ok(false) => {
                    debug!(parent: &binding_span, "cluster module not found, will be recreated");
                    pending.insert(key, owner);
                }
                Err(error) => {
                    warn!(
                        parent: &binding_span,
                        error = %error,
                        "failed to check if cluster module exists"
                    );
                    metrics::record_owner_failure(error.kind());
                    // Keep the unverified handle so it is not lost and no duplicate is created
                    kept_handles.insert(binding.module_uuid.as_str());
                    retained.push(owner.binding(&binding.module_uuid));
                    failures.push(OwnerFailure::new(
                        &owner,
                        FailedOperation::Verify {
                            handle: binding.module_uuid.clone(),
                        },
                        error,
                    ));
                }
            }
        }

        let mut created = Vec::new();
        for owner in pending.into_values() {
            let owner_span = debug_span!(
                parent: span,
                "owner",
                kind = owner.kind(),
                name = %owner.name()
            );

            match self
                .call(cluster, cancel, "create", self.service.create(cluster, &owner))
                .await?
            {
                Ok(Some(handle)) if !handle.is_empty() => {
                    info!(parent: &owner_span, module_uuid = %handle, "created cluster module");
                    created.push(owner.binding(handle));
                }
                Ok(_) => {
                    debug!(parent: &owner_span, "cluster module creation skipped");
                }
                Err(error) => {
                    warn!(
                        parent: &owner_span,
                        error = %error,
                        "failed to create cluster module"
                    );
                    metrics::record_owner_failure(error.kind());
                    failures.push(OwnerFailure::new(&owner, FailedOperation::Create, error));
                }
            }
        }

        let mut bindings = retained;
        bindings.extend(created);

        let outcome = ReconcileOutcome { bindings, failures };
        debug!(
            parent: span,
            bindings = outcome.bindings.len(),
            failures = outcome.failures.len(),
            level = outcome.level().as_str(),
            "cluster module pass complete"
        );
        Ok(PassResult::Completed(outcome))
    }

    async fn list_owners(
        &self,
        cluster: &ClusterRef,
        cancel: &CancellationToken,
    ) -> Result<Vec<Owner>, Error> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::cancelled(cluster.to_string())),
            listed = tokio::time::timeout(self.config.call_timeout, self.owners.list_owners(cluster)) => {
                listed.unwrap_or_else(|_| {
                    Err(Error::owner_listing(
                        cluster.to_string(),
                        format!("timed out after {}s", self.config.call_timeout.as_secs()),
                    ))
                })
            }
        }
    }

    async fn remove_orphan(
        &self,
        cluster: &ClusterRef,
        binding: &ClusterModule,
        cancel: &CancellationToken,
        span: &Span,
    ) -> Result<(), Error> {
        match self
            .call(
                cluster,
                cancel,
                "remove",
                self.service.remove(cluster, &binding.module_uuid),
            )
            .await?
        {
            Ok(()) => {
                info!(parent: span, "removed cluster module of deleted owner");
                metrics::record_orphan_removed();
            }
            // The owner is gone; a leaked group is tolerated
            Err(error) => {
                warn!(
                    parent: span,
                    error = %error,
                    "failed to delete cluster module for object"
                );
            }
        }
        Ok(())
    }

    /// Bound a service call by the timeout and the cancellation token
    ///
    /// The outer error aborts the pass; the inner one is a per-owner failure.
    async fn call<T>(
        &self,
        cluster: &ClusterRef,
        cancel: &CancellationToken,
        operation: &'static str,
        call: impl Future<Output = Result<T, ServiceError>>,
    ) -> Result<Result<T, ServiceError>, Error> {
        let timeout = self.config.call_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::cancelled(cluster.to_string())),
            result = tokio::time::timeout(timeout, call) => Ok(result.unwrap_or_else(|_| {
                Err(ServiceError::Timeout {
                    operation,
                    seconds: timeout.as_secs(),
                })
            })),
        }
    }
}

/// Key the current owners, enforcing the single control-plane invariant
fn index_owners(
    cluster: &ClusterRef,
    owners: Vec<Owner>,
    span: &Span,
) -> Result<BTreeMap<BindingKey, Owner>, Error> {
    let control_planes = owners.iter().filter(|o| o.is_control_plane()).count();
    if control_planes > 1 {
        return Err(Error::configuration(
            cluster.to_string(),
            format!(
                "multiple {} objects found, expected 1, found {}",
                CONTROL_PLANE_KIND, control_planes
            ),
        ));
    }

    let mut indexed = BTreeMap::new();
    for owner in owners {
        match indexed.entry(owner.key()) {
            Entry::Vacant(slot) => {
                slot.insert(owner);
            }
            Entry::Occupied(slot) => {
                warn!(parent: span, key = %slot.key(), "duplicate owner ignored");
            }
        }
    }
    Ok(indexed)
}
