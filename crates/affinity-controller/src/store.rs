//! Persistence of bindings and conditions on the InfraCluster object

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use affinity_common::crd::{ClusterModule, Condition, InfraCluster};
use affinity_common::{Error, FIELD_MANAGER};

use crate::owner::ClusterRef;

/// Writes pass results back to the cluster object
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Overwrite `spec.clusterModules` with the given set
    async fn replace_bindings(
        &self,
        cluster: &ClusterRef,
        bindings: &[ClusterModule],
    ) -> Result<(), Error>;

    /// Overwrite `status.conditions`
    async fn patch_conditions(
        &self,
        cluster: &ClusterRef,
        conditions: &[Condition],
    ) -> Result<(), Error>;
}

/// Cluster store backed by the kube API
pub struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, cluster: &ClusterRef) -> Api<InfraCluster> {
        Api::namespaced(self.client.clone(), &cluster.namespace)
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn replace_bindings(
        &self,
        cluster: &ClusterRef,
        bindings: &[ClusterModule],
    ) -> Result<(), Error> {
        // Merge patches replace lists wholesale
        let patch = serde_json::json!({
            "spec": { "clusterModules": bindings }
        });

        self.api(cluster)
            .patch(
                &cluster.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn patch_conditions(
        &self,
        cluster: &ClusterRef,
        conditions: &[Condition],
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "status": { "conditions": conditions }
        });

        self.api(cluster)
            .patch_status(
                &cluster.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}
