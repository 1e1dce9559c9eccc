//! InfraCluster controller implementation
//!
//! Each reconciliation runs one binding pass for the cluster, persists the new
//! binding set, and reports the outcome through status conditions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use affinity_common::crd::InfraCluster;
use affinity_common::{metrics, Error};

use crate::config::ControllerConfig;
use crate::owner::{ClusterRef, KubeOwnerDirectory, OwnerDirectory};
use crate::reconciler::{ModuleReconciler, OutcomeLevel, PassResult};
use crate::report::{apply_report, conditions_changed, report};
use crate::service::AffinityService;
use crate::store::{ClusterStore, KubeClusterStore};

/// Controller context shared by every reconciliation
pub struct Context {
    /// Binding reconciler
    pub reconciler: ModuleReconciler,
    /// Persistence of bindings and conditions (trait object for testability)
    pub store: Arc<dyn ClusterStore>,
    /// Requeue interval after a successful pass
    pub resync_interval: Duration,
    /// Requeue interval after a retryable failure
    pub error_requeue: Duration,
    /// Cancelled on shutdown to abort in-flight passes
    pub cancel: CancellationToken,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, service: Arc<dyn AffinityService>) -> ContextBuilder {
        ContextBuilder::new(client, service)
    }

    /// Create a context for testing with mock collaborators
    ///
    /// For production code, use [`Context::builder`].
    pub fn for_testing(
        owners: Arc<dyn OwnerDirectory>,
        service: Arc<dyn AffinityService>,
        store: Arc<dyn ClusterStore>,
    ) -> Self {
        let config = ControllerConfig::default();
        Self {
            reconciler: ModuleReconciler::new(owners, service, config.reconciler()),
            store,
            resync_interval: config.resync_interval(),
            error_requeue: config.error_requeue(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```text
/// let ctx = Context::builder(client, service)
///     .config(config)
///     .cancellation(shutdown.clone())
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    service: Arc<dyn AffinityService>,
    owners: Option<Arc<dyn OwnerDirectory>>,
    store: Option<Arc<dyn ClusterStore>>,
    config: ControllerConfig,
    cancel: Option<CancellationToken>,
}

impl ContextBuilder {
    fn new(client: Client, service: Arc<dyn AffinityService>) -> Self {
        Self {
            client,
            service,
            owners: None,
            store: None,
            config: ControllerConfig::default(),
            cancel: None,
        }
    }

    /// Use the given controller settings
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the owner directory
    pub fn owner_directory(mut self, owners: Arc<dyn OwnerDirectory>) -> Self {
        self.owners = Some(owners);
        self
    }

    /// Override the cluster store
    pub fn cluster_store(mut self, store: Arc<dyn ClusterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Token cancelled on shutdown
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Build the Context, using kube-backed defaults for unset collaborators
    pub fn build(self) -> Context {
        let owners: Arc<dyn OwnerDirectory> = match self.owners {
            Some(owners) => owners,
            None => Arc::new(KubeOwnerDirectory::new(self.client.clone())),
        };
        let store: Arc<dyn ClusterStore> = match self.store {
            Some(store) => store,
            None => Arc::new(KubeClusterStore::new(self.client.clone())),
        };

        Context {
            reconciler: ModuleReconciler::new(owners, self.service, self.config.reconciler()),
            store,
            resync_interval: self.config.resync_interval(),
            error_requeue: self.config.error_requeue(),
            cancel: self.cancel.unwrap_or_default(),
        }
    }
}

/// Reconcile the affinity groups of an InfraCluster
///
/// Returns the resync action on success. A pass with hard per-owner failures
/// returns an error after its bindings and conditions have been written.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<InfraCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start = Instant::now();
    let result = reconcile_modules(&cluster, &ctx).await;

    let label = match &result {
        Ok(label) => *label,
        Err(Error::ModuleSetup { .. }) => OutcomeLevel::Failed.as_str(),
        Err(_) => "error",
    };
    metrics::record_reconcile(label, start.elapsed().as_secs_f64());

    result.map(|_| Action::requeue(ctx.resync_interval))
}

async fn reconcile_modules(cluster: &InfraCluster, ctx: &Context) -> Result<&'static str, Error> {
    if cluster.metadata.deletion_timestamp.is_some() {
        debug!("cluster is being deleted, skipping cluster modules");
        return Ok("skipped");
    }

    let cluster_ref = ClusterRef::from_infra_cluster(cluster)?;
    let prior = cluster.cluster_modules();

    let result = ctx
        .reconciler
        .reconcile(
            &cluster_ref,
            cluster.platform_version(),
            prior,
            &ctx.cancel,
        )
        .await?;

    if let PassResult::Completed(outcome) = &result {
        if outcome.bindings.as_slice() != prior {
            ctx.store
                .replace_bindings(&cluster_ref, &outcome.bindings)
                .await?;
            info!(
                bindings = outcome.bindings.len(),
                "updated cluster module bindings"
            );
        }
        metrics::record_bindings(&cluster_ref.to_string(), outcome.bindings.len());
    }

    let current = cluster.conditions();
    let updated = apply_report(current, report(&result));
    if conditions_changed(current, &updated) {
        ctx.store.patch_conditions(&cluster_ref, &updated).await?;
    }

    if let PassResult::Completed(outcome) = &result {
        if let Some(err) = outcome.to_error(&cluster_ref) {
            return Err(err);
        }
        if outcome.level() == OutcomeLevel::Warning {
            warn!(
                summary = %outcome.failure_summary().unwrap_or_default(),
                "cluster modules unavailable for incompatible owners"
            );
        }
    }

    Ok(result.label())
}

/// Error policy for the controller
///
/// Retryable errors requeue quickly; permanent ones wait for the next resync
/// or for a change to the cluster.
pub fn error_policy(cluster: Arc<InfraCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ctx.error_requeue)
    } else {
        Action::requeue(ctx.resync_interval)
    }
}
