//! Maps owner object changes to the InfraCluster that must be reconciled
//!
//! A change to a KubeadmControlPlane or MachineDeployment resolves to its
//! Cluster API `Cluster`, then to the InfraCluster named by the Cluster's
//! `spec.infrastructureRef`. Lookups are served from reflector caches; an
//! unresolvable change is dropped and left to the periodic resync.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::runtime::reflector::{ObjectRef, Store};
use thiserror::Error;
use tracing::{debug, trace};

#[cfg(test)]
use mockall::automock;

use affinity_common::crd::InfraCluster;
use affinity_common::kube_utils::{nested_str, parse_api_version};
use affinity_common::{CAPI_GROUP, CLUSTER_KIND, CLUSTER_NAME_LABEL};

/// Cached view of Cluster and InfraCluster objects
#[cfg_attr(test, automock)]
pub trait ClusterIndex: Send + Sync {
    /// Cluster API cluster by namespace and name
    fn capi_cluster(&self, namespace: &str, name: &str) -> Option<Arc<DynamicObject>>;

    /// True when the InfraCluster is present in the cache
    fn has_infra_cluster(&self, namespace: &str, name: &str) -> bool;
}

/// Cluster index over reflector stores
#[derive(Clone)]
pub struct StoreClusterIndex {
    clusters: Store<DynamicObject>,
    cluster_resource: ApiResource,
    infra_clusters: Store<InfraCluster>,
}

impl StoreClusterIndex {
    /// Wrap the Cluster store and the InfraCluster store of the controller
    pub fn new(
        clusters: Store<DynamicObject>,
        cluster_resource: ApiResource,
        infra_clusters: Store<InfraCluster>,
    ) -> Self {
        Self {
            clusters,
            cluster_resource,
            infra_clusters,
        }
    }
}

impl ClusterIndex for StoreClusterIndex {
    fn capi_cluster(&self, namespace: &str, name: &str) -> Option<Arc<DynamicObject>> {
        let key = ObjectRef::new_with(name, self.cluster_resource.clone()).within(namespace);
        self.clusters.get(&key)
    }

    fn has_infra_cluster(&self, namespace: &str, name: &str) -> bool {
        self.infra_clusters
            .get(&ObjectRef::new(name).within(namespace))
            .is_some()
    }
}

/// Why a change could not be mapped
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerMiss {
    /// The object is cluster-scoped
    #[error("object has no namespace")]
    NoNamespace,
    /// Neither the label nor an owner reference names a Cluster
    #[error("failed to get owner Cluster")]
    NoOwnerCluster,
    /// The Cluster is not in the cache
    #[error("Cluster {0} not found")]
    ClusterNotFound(String),
    /// The Cluster has no infrastructure reference
    #[error("Cluster {0} has no spec.infrastructureRef")]
    NoInfrastructureRef(String),
    /// The referenced InfraCluster is not in the cache
    #[error("InfraCluster {0} not found")]
    InfraClusterNotFound(String),
}

/// Name of the owning Cluster API cluster
///
/// The cluster-name label wins; otherwise an owner reference of kind
/// `Cluster` in the Cluster API group.
pub fn owner_cluster_name(meta: &ObjectMeta) -> Option<String> {
    if let Some(name) = meta
        .labels
        .as_ref()
        .and_then(|labels| labels.get(CLUSTER_NAME_LABEL))
    {
        return Some(name.clone());
    }

    meta.owner_references.as_ref()?.iter().find_map(|owner| {
        let (group, _) = parse_api_version(&owner.api_version);
        (owner.kind == CLUSTER_KIND && group == CAPI_GROUP).then(|| owner.name.clone())
    })
}

/// Resolve the InfraCluster for a changed owner object
pub fn resolve_infra_cluster(
    index: &dyn ClusterIndex,
    meta: &ObjectMeta,
) -> Result<ObjectRef<InfraCluster>, TriggerMiss> {
    let namespace = meta.namespace.as_deref().ok_or(TriggerMiss::NoNamespace)?;
    let cluster_name = owner_cluster_name(meta).ok_or(TriggerMiss::NoOwnerCluster)?;

    let cluster = index
        .capi_cluster(namespace, &cluster_name)
        .ok_or_else(|| TriggerMiss::ClusterNotFound(cluster_name.clone()))?;
    let infra_name = nested_str(&cluster.data, &["spec", "infrastructureRef", "name"])
        .ok_or_else(|| TriggerMiss::NoInfrastructureRef(cluster_name.clone()))?;

    if !index.has_infra_cluster(namespace, infra_name) {
        return Err(TriggerMiss::InfraClusterNotFound(format!(
            "{}/{}",
            namespace, infra_name
        )));
    }

    Ok(ObjectRef::new(infra_name).within(namespace))
}

/// Watch mapper for owner kinds: zero or one reconcile request
pub fn map_owner_change(
    index: &dyn ClusterIndex,
    obj: &DynamicObject,
) -> Option<ObjectRef<InfraCluster>> {
    match resolve_infra_cluster(index, &obj.metadata) {
        Ok(target) => {
            trace!(
                owner = obj.metadata.name.as_deref().unwrap_or_default(),
                target = %target,
                "owner change triggers reconciliation"
            );
            Some(target)
        }
        Err(miss) => {
            debug!(
                owner = obj.metadata.name.as_deref().unwrap_or_default(),
                namespace = obj.metadata.namespace.as_deref().unwrap_or_default(),
                reason = %miss,
                "owner change not mapped to an InfraCluster"
            );
            None
        }
    }
}
