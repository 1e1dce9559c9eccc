//! Controller runner - builds the futures that drive the InfraCluster controller
//!
//! The controller watches InfraClusters directly and re-triggers them on
//! KubeadmControlPlane and MachineDeployment changes. A reflector over Cluster
//! API `Cluster` objects serves the owner-to-InfraCluster mapping.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::discovery::ApiResource;
use kube::runtime::reflector::{self, store::Writer};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::Client;
use tokio_util::sync::CancellationToken;

use affinity_common::crd::InfraCluster;
use affinity_common::kube_utils::build_api_resource;
use affinity_common::{
    CAPI_CLUSTER_API_VERSION, CAPI_CONTROLPLANE_API_VERSION, CLUSTER_KIND, CONTROL_PLANE_KIND,
    WORKER_GROUP_KIND,
};

use crate::config::ControllerConfig;
use crate::controller::{error_policy, reconcile, Context};
use crate::service::AffinityService;
use crate::trigger::{map_owner_change, StoreClusterIndex};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Build the InfraCluster controller and its Cluster cache
///
/// Both futures stop when `cancel` fires or on SIGTERM/SIGINT. In-flight
/// passes observe the same token.
pub fn build_controllers(
    client: Client,
    service: Arc<dyn AffinityService>,
    config: ControllerConfig,
    cancel: CancellationToken,
) -> Vec<ControllerFuture> {
    let namespace = config.watch_namespace.clone();
    let ctx = Arc::new(
        Context::builder(client.clone(), service)
            .config(config)
            .cancellation(cancel.clone())
            .build(),
    );

    let cluster_ar = build_api_resource(CAPI_CLUSTER_API_VERSION, CLUSTER_KIND);
    let control_plane_ar = build_api_resource(CAPI_CONTROLPLANE_API_VERSION, CONTROL_PLANE_KIND);
    let worker_group_ar = build_api_resource(CAPI_CLUSTER_API_VERSION, WORKER_GROUP_KIND);

    let cluster_writer = Writer::new(cluster_ar.clone());
    let cluster_store = cluster_writer.as_reader();
    let cluster_cache = reflector::reflector(
        cluster_writer,
        watcher::watcher(
            dynamic_api(&client, namespace.as_deref(), &cluster_ar),
            watcher_config(),
        ),
    )
    .default_backoff()
    .applied_objects()
    .take_until(cancel.clone().cancelled_owned())
    .for_each(|event| {
        if let Err(e) = event {
            tracing::warn!(error = %e, "Cluster watch error");
        }
        std::future::ready(())
    });

    let infra_clusters: Api<InfraCluster> = match namespace.as_deref() {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let controller = Controller::new(infra_clusters, watcher_config());

    let index = Arc::new(StoreClusterIndex::new(
        cluster_store,
        cluster_ar,
        controller.store(),
    ));
    let control_plane_index = index.clone();
    let worker_group_index = index;

    // Update events trigger a pass as well; the watcher cannot tell them apart
    let controller = controller
        .watches_with(
            dynamic_api(&client, namespace.as_deref(), &control_plane_ar),
            control_plane_ar,
            watcher_config(),
            move |obj| map_owner_change(control_plane_index.as_ref(), &obj),
        )
        .watches_with(
            dynamic_api(&client, namespace.as_deref(), &worker_group_ar),
            worker_group_ar,
            watcher_config(),
            move |obj| map_owner_change(worker_group_index.as_ref(), &obj),
        )
        .graceful_shutdown_on(cancel.cancelled_owned())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("InfraCluster"));

    tracing::info!(
        namespace = namespace.as_deref().unwrap_or("*"),
        "- InfraCluster controller"
    );

    vec![Box::pin(controller), Box::pin(cluster_cache)]
}

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

fn dynamic_api(client: &Client, namespace: Option<&str>, ar: &ApiResource) -> Api<DynamicObject> {
    match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, ar),
        None => Api::all_with(client.clone(), ar),
    }
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
